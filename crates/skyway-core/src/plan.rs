//! Build plans.
//!
//! A plan is a tree of [`Plan`] nodes. Each node has a stable [`PlanId`], a
//! kind-specific payload and optional hooks. The same shape is persisted
//! (encrypted) as a build's private plan.

use crate::ids::*;
use crate::resource::{Params, Source, Version, VersionedResourceType};
use crate::task::TaskConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub kind: PlanKind,
    #[serde(default, skip_serializing_if = "Hooks::is_empty")]
    pub hooks: Hooks,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    Get(GetPlan),
    Put(PutPlan),
    Task(TaskPlan),
    SetPipeline(SetPipelinePlan),
    Check(CheckPlan),
    Do(Vec<Plan>),
    InParallel {
        steps: Vec<Plan>,
        limit: usize,
        fail_fast: bool,
    },
    Try(Box<Plan>),
    Timeout {
        duration_secs: u64,
        step: Box<Plan>,
    },
    Retry {
        attempts: u32,
        step: Box<Plan>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<Box<Plan>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<Box<Plan>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<Box<Plan>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_abort: Option<Box<Plan>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensure: Option<Box<Plan>>,
}

impl Hooks {
    pub fn is_empty(&self) -> bool {
        self.on_success.is_none()
            && self.on_failure.is_none()
            && self.on_error.is_none()
            && self.on_abort.is_none()
            && self.ensure.is_none()
    }

    fn all(&self) -> impl Iterator<Item = &Plan> {
        [
            &self.on_success,
            &self.on_failure,
            &self.on_error,
            &self.on_abort,
            &self.ensure,
        ]
        .into_iter()
        .filter_map(|h| h.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPlan {
    /// Artifact name the fetched volume is registered under.
    pub name: String,
    /// Pipeline resource this get reads, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(rename = "type")]
    pub type_name: String,
    pub source: Source,
    #[serde(default)]
    pub params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub resource_types: Vec<VersionedResourceType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutPlan {
    pub name: String,
    pub resource: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub source: Source,
    #[serde(default)]
    pub params: Params,
    /// `None` stages every artifact.
    #[serde(default)]
    pub inputs: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub resource_types: Vec<VersionedResourceType>,
    /// Run the type's `in` afterwards for canonical version and metadata.
    #[serde(default)]
    pub get_after: bool,
    #[serde(default)]
    pub get_params: Params,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub name: String,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub config: Option<TaskConfig>,
    #[serde(default)]
    pub config_path: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub image_artifact: Option<String>,
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub output_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub resource_types: Vec<VersionedResourceType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPipelinePlan {
    pub name: String,
    pub file: String,
    #[serde(default)]
    pub vars: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckPlan {
    #[serde(rename = "type")]
    pub type_name: String,
    pub source: Source,
    #[serde(default)]
    pub from_version: Option<Version>,
    pub timeout_secs: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub resource_types: Vec<VersionedResourceType>,
}

impl Plan {
    pub fn new(id: impl Into<String>, kind: PlanKind) -> Self {
        Self {
            id: PlanId::new(id),
            kind,
            hooks: Hooks::default(),
        }
    }

    /// Direct children, excluding hooks.
    pub fn children(&self) -> Vec<&Plan> {
        match &self.kind {
            PlanKind::Do(steps) | PlanKind::InParallel { steps, .. } => steps.iter().collect(),
            PlanKind::Try(step)
            | PlanKind::Timeout { step, .. }
            | PlanKind::Retry { step, .. } => vec![step.as_ref()],
            _ => Vec::new(),
        }
    }

    /// Visit every node including hook subtrees.
    pub fn each(&self, f: &mut dyn FnMut(&Plan)) {
        f(self);
        for child in self.children() {
            child.each(f);
        }
        for hook in self.hooks.all() {
            hook.each(f);
        }
    }

    /// Reject structurally invalid trees before they are persisted.
    pub fn validate(&self) -> Result<()> {
        let mut ids = std::collections::HashSet::new();
        let mut problem = None;
        self.each(&mut |node| {
            if problem.is_some() {
                return;
            }
            if !ids.insert(node.id.clone()) {
                problem = Some(format!("duplicate plan id '{}'", node.id));
                return;
            }
            match &node.kind {
                PlanKind::Timeout { duration_secs: 0, .. } => {
                    problem = Some(format!("plan {} has a zero timeout", node.id));
                }
                PlanKind::Retry { attempts: 0, .. } => {
                    problem = Some(format!("plan {} has zero attempts", node.id));
                }
                PlanKind::Task(task) if task.config.is_none() && task.config_path.is_none() => {
                    problem = Some(format!("task '{}' has neither config nor file", task.name));
                }
                _ => {}
            }
        });
        match problem {
            Some(p) => Err(Error::InvalidPlan(p)),
            None => Ok(()),
        }
    }

    /// Redacted view: step names and shape only, no sources or params.
    pub fn public(&self) -> Value {
        let mut node = match &self.kind {
            PlanKind::Get(get) => json!({
                "get": {"name": get.name, "resource": get.resource, "type": get.type_name, "version": get.version}
            }),
            PlanKind::Put(put) => json!({
                "put": {"name": put.name, "resource": put.resource, "type": put.type_name}
            }),
            PlanKind::Task(task) => json!({
                "task": {"name": task.name, "privileged": task.privileged}
            }),
            PlanKind::SetPipeline(sp) => json!({"set_pipeline": {"name": sp.name}}),
            PlanKind::Check(check) => json!({"check": {"type": check.type_name}}),
            PlanKind::Do(steps) => json!({"do": steps.iter().map(Plan::public).collect::<Vec<_>>()}),
            PlanKind::InParallel { steps, limit, fail_fast } => json!({
                "in_parallel": {
                    "steps": steps.iter().map(Plan::public).collect::<Vec<_>>(),
                    "limit": limit,
                    "fail_fast": fail_fast,
                }
            }),
            PlanKind::Try(step) => json!({"try": step.public()}),
            PlanKind::Timeout { duration_secs, step } => json!({
                "timeout": {"duration_secs": duration_secs, "step": step.public()}
            }),
            PlanKind::Retry { attempts, step } => json!({
                "retry": {"attempts": attempts, "step": step.public()}
            }),
        };
        if let Value::Object(map) = &mut node {
            map.insert("id".to_string(), json!(self.id));
            for (name, hook) in [
                ("on_success", &self.hooks.on_success),
                ("on_failure", &self.hooks.on_failure),
                ("on_error", &self.hooks.on_error),
                ("on_abort", &self.hooks.on_abort),
                ("ensure", &self.hooks.ensure),
            ] {
                if let Some(h) = hook {
                    map.insert(name.to_string(), h.public());
                }
            }
        }
        node
    }
}

/// Hands out sequential plan ids while a plan tree is being built.
#[derive(Debug, Default)]
pub struct PlanIdGenerator {
    next: u64,
}

impl PlanIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> PlanId {
        self.next += 1;
        PlanId::new(self.next.to_string())
    }

    pub fn plan(&mut self, kind: PlanKind) -> Plan {
        Plan {
            id: self.next_id(),
            kind,
            hooks: Hooks::default(),
        }
    }
}
