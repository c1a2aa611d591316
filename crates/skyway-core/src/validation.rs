//! Pipeline configuration validation.
//!
//! Validation never stops at the first problem: callers (`set_pipeline`)
//! print every warning and error.

use crate::pipeline::*;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn into_result(self) -> crate::Result<Vec<String>> {
        if self.errors.is_empty() {
            Ok(self.warnings)
        } else {
            Err(crate::Error::InvalidPipeline(self.errors.join("; ")))
        }
    }
}

pub fn validate(config: &PipelineDefinition) -> ValidationReport {
    let mut report = ValidationReport::default();

    check_unique(config.resources.iter().map(|r| r.name.as_str()), "resource", &mut report);
    check_unique(
        config.resource_types.iter().map(|r| r.name.as_str()),
        "resource type",
        &mut report,
    );
    check_unique(config.jobs.iter().map(|j| j.name.as_str()), "job", &mut report);
    check_unique(config.groups.iter().map(|g| g.name.as_str()), "group", &mut report);

    for resource in &config.resources {
        if resource.type_name.is_empty() {
            report.error(format!("resources.{} has no type", resource.name));
        }
        check_nonzero(resource.check_every, &format!("resources.{}.check_every", resource.name), &mut report);
        check_nonzero(resource.check_timeout, &format!("resources.{}.check_timeout", resource.name), &mut report);
    }
    for rt in &config.resource_types {
        check_nonzero(rt.check_every, &format!("resource_types.{}.check_every", rt.name), &mut report);
    }
    check_resource_type_cycles(config, &mut report);

    let mut used_resources = HashSet::new();
    for job in &config.jobs {
        validate_job(config, job, &mut used_resources, &mut report);
    }
    let mut warned = HashSet::new();
    for resource in &config.resources {
        if !used_resources.contains(resource.name.as_str()) && warned.insert(resource.name.as_str()) {
            report.warn(format!("resource '{}' is not used by any job", resource.name));
        }
    }

    for group in &config.groups {
        for job in &group.jobs {
            if config.job(job).is_none() {
                report.error(format!("groups.{} refers to unknown job '{}'", group.name, job));
            }
        }
        for resource in &group.resources {
            if config.resource(resource).is_none() {
                report.error(format!("groups.{} refers to unknown resource '{}'", group.name, resource));
            }
        }
    }

    report
}

fn check_unique<'a>(names: impl Iterator<Item = &'a str>, kind: &str, report: &mut ValidationReport) {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty() {
            report.error(format!("{kind} has no name"));
        } else if !seen.insert(name) {
            report.error(format!("{kind} '{name}' is declared more than once"));
        }
    }
}

fn check_nonzero(value: Option<Duration>, field: &str, report: &mut ValidationReport) {
    if value == Some(Duration::ZERO) {
        report.error(format!("{field} must be greater than zero"));
    }
}

/// Resource types may build on each other but never in a loop.
fn check_resource_type_cycles(config: &PipelineDefinition, report: &mut ValidationReport) {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();
    for rt in &config.resource_types {
        index.entry(rt.name.as_str()).or_insert_with(|| graph.add_node(rt.name.as_str()));
    }
    for rt in &config.resource_types {
        if let (Some(&from), Some(&to)) = (index.get(rt.type_name.as_str()), index.get(rt.name.as_str())) {
            graph.add_edge(from, to, ());
        }
    }
    if let Err(cycle) = toposort(&graph, None) {
        let name = graph.node_weight(cycle.node_id()).copied().unwrap_or_default();
        report.error(format!("resource type '{name}' has a cyclic type dependency"));
    }
}

fn validate_job<'a>(
    config: &'a PipelineDefinition,
    job: &'a JobDefinition,
    used_resources: &mut HashSet<&'a str>,
    report: &mut ValidationReport,
) {
    let ctx = format!("jobs.{}", job.name);
    if job.plan.is_empty() {
        report.warn(format!("{ctx} has an empty plan"));
    }
    if job.serial && job.max_in_flight > 0 {
        report.warn(format!("{ctx} sets both serial and max_in_flight; serial wins"));
    }
    if !job.serial_groups.is_empty() && job.max_in_flight > 0 {
        report.warn(format!("{ctx} sets both serial_groups and max_in_flight; serial_groups wins"));
    }

    let mut steps: Vec<&'a StepDefinition> = Vec::new();
    for step in &job.plan {
        step.walk(&mut |s| steps.push(s));
    }
    for hook in [&job.on_success, &job.on_failure, &job.on_error, &job.on_abort, &job.ensure]
        .into_iter()
        .flatten()
    {
        hook.walk(&mut |s| steps.push(s));
    }

    let mut artifact_names = HashSet::new();
    for step in steps {
        if step.timeout == Some(Duration::ZERO) {
            report.error(format!("{ctx}: step timeout must be greater than zero"));
        }
        if step.attempts == Some(0) {
            report.error(format!("{ctx}: attempts must be at least 1"));
        }
        match &step.step {
            StepConfig::Get(get) => {
                let resource = get.resource_name();
                match config.resource(resource) {
                    Some(r) => {
                        used_resources.insert(r.name.as_str());
                    }
                    None => report.error(format!("{ctx}.get.{} refers to unknown resource '{resource}'", get.name)),
                }
                if !artifact_names.insert(get.name.as_str()) {
                    report.warn(format!("{ctx} has more than one step named '{}'", get.name));
                }
                for upstream in &get.passed {
                    match config.job(upstream) {
                        None => report.error(format!(
                            "{ctx}.get.{} passed refers to unknown job '{upstream}'",
                            get.name
                        )),
                        Some(up) if up.name == job.name => report.error(format!(
                            "{ctx}.get.{} cannot pass through its own job",
                            get.name
                        )),
                        Some(up) => {
                            let touches = up.inputs().iter().any(|i| i.resource == resource)
                                || up.outputs().iter().any(|o| o == resource);
                            if !touches {
                                report.error(format!(
                                    "{ctx}.get.{} passed job '{upstream}' does not interact with resource '{resource}'",
                                    get.name
                                ));
                            }
                        }
                    }
                }
            }
            StepConfig::Put(put) => {
                let resource = put.resource_name();
                match config.resource(resource) {
                    Some(r) => {
                        used_resources.insert(r.name.as_str());
                    }
                    None => report.error(format!("{ctx}.put.{} refers to unknown resource '{resource}'", put.name)),
                }
            }
            StepConfig::Task(task) => {
                if task.config.is_none() && task.file.is_none() {
                    report.error(format!("{ctx}.task.{} must specify either 'file' or 'config'", task.name));
                }
                if let Some(inline) = &task.config {
                    if let Err(e) = inline.validate() {
                        report.error(format!("{ctx}.task.{}: {e}", task.name));
                    }
                    if task.image.is_some() && inline.image_resource.is_some() {
                        report.warn(format!(
                            "{ctx}.task.{} specifies both 'image' and 'image_resource'; 'image' is used",
                            task.name
                        ));
                    }
                }
            }
            StepConfig::SetPipeline(sp) => {
                if sp.file.is_empty() {
                    report.error(format!("{ctx}.set_pipeline.{} has no file", sp.name));
                }
            }
            StepConfig::InParallel(_) | StepConfig::Do(_) | StepConfig::Try(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> PipelineDefinition {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_valid_pipeline() {
        let report = validate(&parse(
            r#"
resources:
  - {name: repo, type: git}
jobs:
  - name: unit
    plan:
      - get: {name: repo}
  - name: deploy
    plan:
      - get: {name: repo, passed: [unit]}
"#,
        ));
        assert!(report.is_valid(), "{:?}", report.errors);
    }

    #[test]
    fn test_unknown_resource_and_passed_job() {
        let report = validate(&parse(
            r#"
jobs:
  - name: unit
    plan:
      - get: {name: missing, passed: [ghost]}
"#,
        ));
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn test_duplicate_unused_resource_warns_once() {
        let report = validate(&parse(
            r#"
resources:
  - {name: repo, type: git}
  - {name: repo, type: git}
jobs: []
"#,
        ));
        assert_eq!(report.warnings, vec!["resource 'repo' is not used by any job".to_string()]);
        assert_eq!(report.errors, vec!["resource 'repo' is declared more than once".to_string()]);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let report = validate(&parse(
            r#"
resources:
  - {name: repo, type: git}
jobs:
  - name: unit
    plan:
      - get: {name: repo}
        timeout: 0s
"#,
        ));
        assert!(report.errors.iter().any(|e| e.contains("timeout")));
    }

    #[test]
    fn test_resource_type_cycle_rejected() {
        let report = validate(&parse(
            r#"
resource_types:
  - {name: a, type: b}
  - {name: b, type: a}
"#,
        ));
        assert!(report.errors.iter().any(|e| e.contains("cyclic")));

        let self_ref = validate(&parse("resource_types:\n  - {name: a, type: a}\n"));
        assert!(!self_ref.is_valid());
    }

    #[test]
    fn test_image_and_image_resource_warns() {
        let report = validate(&parse(
            r#"
jobs:
  - name: build
    plan:
      - task:
          name: compile
          image: custom
          config:
            platform: linux
            image_resource: {type: registry-image, source: {repository: alpine}}
            run: {path: make}
"#,
        ));
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.contains("'image' is used")));
    }
}
