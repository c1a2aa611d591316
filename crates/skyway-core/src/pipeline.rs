//! Pipeline configuration types.
//!
//! These types represent a pipeline as submitted by `set_pipeline`; the
//! stored rows for resources and jobs are derived from them on save.

use crate::ids::*;
use crate::resource::{Params, Source, Version};
use crate::task::TaskConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub team_id: TeamId,
    pub name: String,
    pub config_version: ConfigVersion,
    pub config: PipelineDefinition,
    pub paused: bool,
    pub archived: bool,
    pub public: bool,
    pub last_scheduled: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Pipeline {
    /// Archived and paused pipelines do no work.
    pub fn is_active(&self) -> bool {
        !self.paused && !self.archived
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    #[serde(default)]
    pub resources: Vec<ResourceDefinition>,
    #[serde(default)]
    pub resource_types: Vec<ResourceTypeDefinition>,
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupDefinition>,
}

impl PipelineDefinition {
    pub fn resource(&self, name: &str) -> Option<&ResourceDefinition> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn resource_type(&self, name: &str) -> Option<&ResourceTypeDefinition> {
        self.resource_types.iter().find(|r| r.name == name)
    }

    pub fn job(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|j| j.name == name)
    }

    /// Canonical JSON of the whole config.
    pub fn canonical_json(&self) -> crate::Result<String> {
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_string(&value)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub source: Source,
    #[serde(default, with = "crate::duration::option", skip_serializing_if = "Option::is_none")]
    pub check_every: Option<Duration>,
    #[serde(default, with = "crate::duration::option", skip_serializing_if = "Option::is_none")]
    pub check_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Pins every `get` of this resource to one version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub public: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTypeDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub source: Source,
    #[serde(default, skip_serializing_if = "Params::is_empty")]
    pub params: Params,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default, with = "crate::duration::option", skip_serializing_if = "Option::is_none")]
    pub check_every: Option<Duration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDefinition {
    pub name: String,
    #[serde(default)]
    pub jobs: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLogRetention {
    #[serde(default)]
    pub builds: u32,
    #[serde(default)]
    pub days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    pub plan: Vec<StepDefinition>,
    #[serde(default)]
    pub serial: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub serial_groups: Vec<String>,
    #[serde(default)]
    pub max_in_flight: u32,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub disable_manual_trigger: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_log_retention: Option<BuildLogRetention>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_logs_to_retain: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<Box<StepDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<Box<StepDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<Box<StepDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_abort: Option<Box<StepDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensure: Option<Box<StepDefinition>>,
}

/// A `get` step as seen by the input algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInput {
    pub name: String,
    pub resource: String,
    pub passed: Vec<String>,
    pub trigger: bool,
    pub version: VersionConfig,
}

impl JobDefinition {
    /// Serial groups this job belongs to. A serial or max-in-flight job
    /// without explicit groups forms a group of its own.
    pub fn serial_groups(&self) -> Vec<String> {
        if !self.serial_groups.is_empty() {
            return self.serial_groups.clone();
        }
        if self.serial || self.max_in_flight > 0 {
            return vec![self.name.clone()];
        }
        Vec::new()
    }

    /// Maximum concurrently running builds; 0 means unlimited.
    pub fn max_in_flight(&self) -> u32 {
        if self.serial || !self.serial_groups.is_empty() {
            return 1;
        }
        self.max_in_flight
    }

    /// Every `get` step reachable from the job's plan, in plan order.
    pub fn inputs(&self) -> Vec<JobInput> {
        let mut inputs = Vec::new();
        for step in &self.plan {
            step.walk(&mut |s| {
                if let StepConfig::Get(get) = &s.step {
                    inputs.push(JobInput {
                        name: get.name.clone(),
                        resource: get.resource_name().to_string(),
                        passed: get.passed.clone(),
                        trigger: get.trigger,
                        version: get.version.clone(),
                    });
                }
            });
        }
        inputs
    }

    /// Names of resources this job `put`s to.
    pub fn outputs(&self) -> Vec<String> {
        let mut outputs = Vec::new();
        for step in &self.plan {
            step.walk(&mut |s| {
                if let StepConfig::Put(put) = &s.step {
                    outputs.push(put.resource_name().to_string());
                }
            });
        }
        outputs
    }

    /// Retention after applying configured defaults and maximums; zero
    /// fields mean unlimited.
    pub fn effective_retention(
        &self,
        default: BuildLogRetention,
        max: BuildLogRetention,
    ) -> BuildLogRetention {
        let mut retention = self.build_log_retention.unwrap_or(BuildLogRetention {
            builds: self.build_logs_to_retain.unwrap_or(0),
            days: 0,
        });
        if retention.builds == 0 {
            retention.builds = default.builds;
        }
        if retention.days == 0 {
            retention.days = default.days;
        }
        if max.builds > 0 && (retention.builds == 0 || retention.builds > max.builds) {
            retention.builds = max.builds;
        }
        if max.days > 0 && (retention.days == 0 || retention.days > max.days) {
            retention.days = max.days;
        }
        retention
    }
}

/// A step in a job's plan together with its hooks and modifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    #[serde(flatten)]
    pub step: StepConfig,
    #[serde(default, with = "crate::duration::option", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<Box<StepDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<Box<StepDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<Box<StepDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_abort: Option<Box<StepDefinition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensure: Option<Box<StepDefinition>>,
}

impl StepDefinition {
    pub fn new(step: StepConfig) -> Self {
        Self {
            step,
            timeout: None,
            attempts: None,
            tags: Vec::new(),
            on_success: None,
            on_failure: None,
            on_error: None,
            on_abort: None,
            ensure: None,
        }
    }

    /// Hooks attached to this step, labelled by kind.
    pub fn hooks(&self) -> impl Iterator<Item = (&'static str, &StepDefinition)> {
        [
            ("on_success", &self.on_success),
            ("on_failure", &self.on_failure),
            ("on_error", &self.on_error),
            ("on_abort", &self.on_abort),
            ("ensure", &self.ensure),
        ]
        .into_iter()
        .filter_map(|(name, hook)| hook.as_deref().map(|h| (name, h)))
    }

    /// Visit this step, its children and its hooks depth-first.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a StepDefinition)) {
        f(self);
        match &self.step {
            StepConfig::Do(steps) => {
                for step in steps {
                    step.walk(f);
                }
            }
            StepConfig::InParallel(p) => {
                for step in &p.steps {
                    step.walk(f);
                }
            }
            StepConfig::Try(step) => step.walk(f),
            _ => {}
        }
        for (_, hook) in self.hooks() {
            hook.walk(f);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepConfig {
    Get(GetStep),
    Put(PutStep),
    Task(TaskStep),
    SetPipeline(SetPipelineStep),
    Do(Vec<StepDefinition>),
    InParallel(InParallelStep),
    Try(Box<StepDefinition>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetStep {
    pub name: String,
    /// Defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub passed: Vec<String>,
    #[serde(default)]
    pub trigger: bool,
    #[serde(default)]
    pub version: VersionConfig,
    #[serde(default, skip_serializing_if = "Params::is_empty")]
    pub params: Params,
}

impl GetStep {
    pub fn resource_name(&self) -> &str {
        self.resource.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutStep {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Params::is_empty")]
    pub params: Params,
    /// Artifacts to stage; `None` stages every artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<String>>,
    #[serde(default)]
    pub no_get: bool,
    #[serde(default, skip_serializing_if = "Params::is_empty")]
    pub get_params: Params,
}

impl PutStep {
    pub fn resource_name(&self) -> &str {
        self.resource.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub name: String,
    /// `artifact/path/to/task.yml`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<TaskConfig>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    /// Name of an artifact to use as the container image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_mapping: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPipelineStep {
    /// Name of the pipeline to set.
    pub name: String,
    /// `artifact/path/to/pipeline.yml`
    pub file: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub vars: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InParallelStep {
    pub steps: Vec<StepDefinition>,
    /// 0 runs every step at once.
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStrategy {
    #[default]
    Latest,
    Every,
}

/// `version:` on a get step: `latest`, `every`, or a pinned version map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VersionConfig {
    Strategy(VersionStrategy),
    Pinned(Version),
}

impl Default for VersionConfig {
    fn default() -> Self {
        VersionConfig::Strategy(VersionStrategy::Latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PIPELINE: &str = r#"
resources:
  - name: repo
    type: git
    source: {uri: "https://example.com/repo.git"}
    check_every: 1m
jobs:
  - name: unit
    serial: true
    plan:
      - get: {name: repo, trigger: true}
      - task: {name: test, file: repo/ci/test.yml}
        timeout: 30m
        attempts: 2
        on_failure:
          put: {name: notify}
  - name: deploy
    plan:
      - in_parallel:
          limit: 2
          steps:
            - get: {name: repo, passed: [unit], version: every}
            - get: {name: pinned, resource: repo, version: {ref: abc}}
"#;

    fn pipeline() -> PipelineDefinition {
        serde_yaml::from_str(PIPELINE).unwrap()
    }

    #[test]
    fn test_parse_flattened_steps() {
        let config = pipeline();
        let unit = config.job("unit").unwrap();
        assert!(matches!(unit.plan[0].step, StepConfig::Get(_)));
        assert_eq!(unit.plan[1].timeout, Some(Duration::from_secs(1800)));
        assert_eq!(unit.plan[1].attempts, Some(2));
        assert!(unit.plan[1].on_failure.is_some());
        assert_eq!(
            config.resource("repo").unwrap().check_every,
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_job_inputs_walk_nested_steps() {
        let config = pipeline();
        let inputs = config.job("deploy").unwrap().inputs();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].passed, vec!["unit".to_string()]);
        assert_eq!(inputs[0].version, VersionConfig::Strategy(VersionStrategy::Every));
        assert_eq!(inputs[1].resource, "repo");
        assert_eq!(
            inputs[1].version,
            VersionConfig::Pinned(Version::new().with("ref", "abc"))
        );
    }

    #[test]
    fn test_max_in_flight_derivation() {
        let config = pipeline();
        let unit = config.job("unit").unwrap();
        assert_eq!(unit.max_in_flight(), 1);
        assert_eq!(unit.serial_groups(), vec!["unit".to_string()]);

        let deploy = config.job("deploy").unwrap();
        assert_eq!(deploy.max_in_flight(), 0);
        assert!(deploy.serial_groups().is_empty());
    }

    #[test]
    fn test_canonical_json_is_stable() {
        let config = pipeline();
        let json = config.canonical_json().unwrap();
        let reparsed: PipelineDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(reparsed.canonical_json().unwrap(), json);
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_effective_retention_clamps() {
        let mut job = pipeline().job("deploy").unwrap().clone();
        job.build_log_retention = Some(BuildLogRetention { builds: 50, days: 0 });
        let retention = job.effective_retention(
            BuildLogRetention { builds: 10, days: 3 },
            BuildLogRetention { builds: 20, days: 0 },
        );
        assert_eq!(retention, BuildLogRetention { builds: 20, days: 3 });
    }
}
