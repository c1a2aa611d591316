//! Turns a job's configuration plus its resolved inputs into a build plan.

use skyway_core::build::BuildInput;
use skyway_core::pipeline::{JobDefinition, StepConfig, StepDefinition};
use skyway_core::plan::*;
use skyway_core::resource::{Resource, VersionedResourceType};
use skyway_core::{Error, Result};
use std::time::Duration;

/// Everything a plan needs beyond the job config itself.
pub struct PlanContext<'a> {
    pub resources: &'a [Resource],
    pub resource_types: &'a [VersionedResourceType],
    pub inputs: &'a [BuildInput],
}

impl PlanContext<'_> {
    fn resource(&self, name: &str) -> Result<&Resource> {
        self.resources
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| Error::ResourceNotFound(name.to_string()))
    }
}

/// Plan for one build of `job`. The root is a `do` of the job's steps
/// carrying the job-level hooks.
pub fn plan_job(job: &JobDefinition, ctx: &PlanContext<'_>) -> Result<Plan> {
    let mut ids = PlanIdGenerator::new();
    let id = ids.next_id();
    let steps = job
        .plan
        .iter()
        .map(|step| plan_step(step, ctx, &mut ids))
        .collect::<Result<Vec<_>>>()?;

    let mut root = Plan {
        id,
        kind: PlanKind::Do(steps),
        hooks: Hooks::default(),
    };
    root.hooks = Hooks {
        on_success: plan_hook(job.on_success.as_deref(), ctx, &mut ids)?,
        on_failure: plan_hook(job.on_failure.as_deref(), ctx, &mut ids)?,
        on_error: plan_hook(job.on_error.as_deref(), ctx, &mut ids)?,
        on_abort: plan_hook(job.on_abort.as_deref(), ctx, &mut ids)?,
        ensure: plan_hook(job.ensure.as_deref(), ctx, &mut ids)?,
    };
    root.validate()?;
    Ok(root)
}

fn plan_hook(
    hook: Option<&StepDefinition>,
    ctx: &PlanContext<'_>,
    ids: &mut PlanIdGenerator,
) -> Result<Option<Box<Plan>>> {
    hook.map(|h| plan_step(h, ctx, ids).map(Box::new)).transpose()
}

/// Modifiers nest as `retry(timeout(step))` so every attempt gets its own
/// deadline; hooks hang off the outermost node and see the final outcome.
fn plan_step(step: &StepDefinition, ctx: &PlanContext<'_>, ids: &mut PlanIdGenerator) -> Result<Plan> {
    let mut plan = plan_leaf(step, ctx, ids)?;

    if let Some(timeout) = step.timeout {
        plan = ids.plan(PlanKind::Timeout {
            duration_secs: whole_secs(timeout),
            step: Box::new(plan),
        });
    }
    if let Some(attempts) = step.attempts
        && attempts > 1
    {
        plan = ids.plan(PlanKind::Retry {
            attempts,
            step: Box::new(plan),
        });
    }

    plan.hooks = Hooks {
        on_success: plan_hook(step.on_success.as_deref(), ctx, ids)?,
        on_failure: plan_hook(step.on_failure.as_deref(), ctx, ids)?,
        on_error: plan_hook(step.on_error.as_deref(), ctx, ids)?,
        on_abort: plan_hook(step.on_abort.as_deref(), ctx, ids)?,
        ensure: plan_hook(step.ensure.as_deref(), ctx, ids)?,
    };
    Ok(plan)
}

fn plan_leaf(step: &StepDefinition, ctx: &PlanContext<'_>, ids: &mut PlanIdGenerator) -> Result<Plan> {
    let id = ids.next_id();
    let kind = match &step.step {
        StepConfig::Get(get) => {
            let resource = ctx.resource(get.resource_name())?;
            let input = ctx
                .inputs
                .iter()
                .find(|i| i.name == get.name)
                .ok_or_else(|| Error::InvalidPlan(format!("no version determined for input '{}'", get.name)))?;
            PlanKind::Get(GetPlan {
                name: get.name.clone(),
                resource: Some(resource.name.clone()),
                type_name: resource.type_name.clone(),
                source: resource.source.clone(),
                params: get.params.clone(),
                version: Some(input.version.clone()),
                tags: merge_tags(&step.tags, &resource.tags),
                resource_types: ctx.resource_types.to_vec(),
            })
        }
        StepConfig::Put(put) => {
            let resource = ctx.resource(put.resource_name())?;
            PlanKind::Put(PutPlan {
                name: put.name.clone(),
                resource: resource.name.clone(),
                type_name: resource.type_name.clone(),
                source: resource.source.clone(),
                params: put.params.clone(),
                inputs: put.inputs.clone(),
                tags: merge_tags(&step.tags, &resource.tags),
                resource_types: ctx.resource_types.to_vec(),
                get_after: !put.no_get,
                get_params: put.get_params.clone(),
            })
        }
        StepConfig::Task(task) => PlanKind::Task(TaskPlan {
            name: task.name.clone(),
            privileged: task.privileged,
            config: task.config.clone(),
            config_path: task.file.clone(),
            params: task.params.clone(),
            image_artifact: task.image.clone(),
            input_mapping: task.input_mapping.clone(),
            output_mapping: task.output_mapping.clone(),
            tags: step.tags.clone(),
            resource_types: ctx.resource_types.to_vec(),
        }),
        StepConfig::SetPipeline(sp) => PlanKind::SetPipeline(SetPipelinePlan {
            name: sp.name.clone(),
            file: sp.file.clone(),
            vars: sp.vars.clone(),
        }),
        StepConfig::Do(steps) => PlanKind::Do(
            steps
                .iter()
                .map(|s| plan_step(s, ctx, ids))
                .collect::<Result<Vec<_>>>()?,
        ),
        StepConfig::InParallel(parallel) => PlanKind::InParallel {
            steps: parallel
                .steps
                .iter()
                .map(|s| plan_step(s, ctx, ids))
                .collect::<Result<Vec<_>>>()?,
            limit: parallel.limit,
            fail_fast: parallel.fail_fast,
        },
        StepConfig::Try(inner) => PlanKind::Try(Box::new(plan_step(inner, ctx, ids)?)),
    };
    Ok(Plan {
        id,
        kind,
        hooks: Hooks::default(),
    })
}

fn merge_tags(step: &[String], resource: &[String]) -> Vec<String> {
    let mut tags = step.to_vec();
    for tag in resource {
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }
    tags
}

/// Sub-second remainders round up; a zero duration stays zero and is
/// rejected by plan validation.
fn whole_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use skyway_core::ids::*;
    use skyway_core::pipeline::PipelineDefinition;
    use skyway_core::resource::{Source, Version};

    const PIPELINE: &str = r#"
resources:
  - name: repo
    type: git
    source: {uri: "https://example.com/repo.git"}
    tags: [linux]
jobs:
  - name: unit
    plan:
      - get: {name: repo, trigger: true}
      - task: {name: test, file: repo/ci/test.yml, image: repo}
        timeout: 30m
        attempts: 3
        tags: [big]
        on_failure:
          put: {name: repo, params: {tag: failed}}
      - try:
          put: {name: repo, no_get: true}
    ensure:
      task: {name: cleanup, file: repo/ci/cleanup.yml}
"#;

    fn resource() -> Resource {
        let mut source = Source::new();
        source.insert("uri".into(), serde_json::json!("https://example.com/repo.git"));
        Resource {
            id: ResourceId::new(1),
            pipeline_id: PipelineId::new(1),
            team_id: TeamId::new(1),
            name: "repo".into(),
            type_name: "git".into(),
            source,
            check_every: None,
            check_timeout: None,
            tags: vec!["linux".into()],
            pinned_version: None,
            webhook_token: None,
            icon: None,
            paused: false,
            public: false,
            check_error: None,
            resource_config_id: None,
        }
    }

    fn input() -> BuildInput {
        BuildInput {
            name: "repo".into(),
            resource_id: ResourceId::new(1),
            version_id: VersionId::new(5),
            version: Version::new().with("ref", "abc"),
            first_occurrence: true,
        }
    }

    fn job() -> JobDefinition {
        let config: PipelineDefinition = serde_yaml::from_str(PIPELINE).unwrap();
        config.job("unit").unwrap().clone()
    }

    #[test]
    fn test_plan_shape() {
        let resources = vec![resource()];
        let inputs = vec![input()];
        let ctx = PlanContext {
            resources: &resources,
            resource_types: &[],
            inputs: &inputs,
        };
        let plan = plan_job(&job(), &ctx).unwrap();

        let PlanKind::Do(steps) = &plan.kind else {
            panic!("root is not a do: {:?}", plan.kind);
        };
        assert_eq!(steps.len(), 3);
        assert!(plan.hooks.ensure.is_some());

        let PlanKind::Get(get) = &steps[0].kind else {
            panic!("expected get");
        };
        assert_eq!(get.version, Some(Version::new().with("ref", "abc")));
        assert_eq!(get.type_name, "git");
        assert_eq!(get.tags, vec!["linux".to_string()]);

        // retry(timeout(task)) with the hook on the retry node.
        let PlanKind::Retry { attempts, step } = &steps[1].kind else {
            panic!("expected retry");
        };
        assert_eq!(*attempts, 3);
        assert!(steps[1].hooks.on_failure.is_some());
        let PlanKind::Timeout { duration_secs, step } = &step.kind else {
            panic!("expected timeout");
        };
        assert_eq!(*duration_secs, 1800);
        let PlanKind::Task(task) = &step.kind else {
            panic!("expected task");
        };
        assert_eq!(task.config_path.as_deref(), Some("repo/ci/test.yml"));
        assert_eq!(task.image_artifact.as_deref(), Some("repo"));
        assert_eq!(task.tags, vec!["big".to_string()]);

        let PlanKind::Try(inner) = &steps[2].kind else {
            panic!("expected try");
        };
        let PlanKind::Put(put) = &inner.kind else {
            panic!("expected put");
        };
        assert!(!put.get_after);
    }

    #[test]
    fn test_plan_ids_are_unique() {
        let resources = vec![resource()];
        let inputs = vec![input()];
        let ctx = PlanContext {
            resources: &resources,
            resource_types: &[],
            inputs: &inputs,
        };
        let plan = plan_job(&job(), &ctx).unwrap();
        let mut ids = Vec::new();
        plan.each(&mut |node| ids.push(node.id.clone()));
        let count = ids.len();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids.dedup();
        assert_eq!(ids.len(), count);
    }

    #[test]
    fn test_missing_input_version_is_invalid_plan() {
        let resources = vec![resource()];
        let ctx = PlanContext {
            resources: &resources,
            resource_types: &[],
            inputs: &[],
        };
        assert!(matches!(plan_job(&job(), &ctx), Err(Error::InvalidPlan(_))));
    }

    #[test]
    fn test_missing_resource() {
        let inputs = vec![input()];
        let ctx = PlanContext {
            resources: &[],
            resource_types: &[],
            inputs: &inputs,
        };
        assert!(matches!(plan_job(&job(), &ctx), Err(Error::ResourceNotFound(_))));
    }

    #[test]
    fn test_whole_secs_rounds_up() {
        assert_eq!(whole_secs(Duration::from_millis(1500)), 2);
        assert_eq!(whole_secs(Duration::from_secs(3)), 3);
    }
}
