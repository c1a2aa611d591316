//! Task configuration, inline in a job or loaded from an artifact.

use crate::resource::{Params, Source, Version};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_resource: Option<ImageResource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rootfs_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<TaskInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<TaskOutput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caches: Vec<TaskCache>,
    pub run: TaskRun,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

fn default_platform() -> String {
    "linux".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageResource {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub source: Source,
    #[serde(default, skip_serializing_if = "Params::is_empty")]
    pub params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInput {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCache {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl TaskInput {
    /// Mount path relative to the task's working directory.
    pub fn mount_path(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.name)
    }
}

impl TaskOutput {
    pub fn mount_path(&self) -> &str {
        self.path.as_deref().unwrap_or(&self.name)
    }
}

impl TaskConfig {
    pub fn from_yaml(raw: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(raw).map_err(|e| Error::InvalidTaskConfig(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.platform.is_empty() {
            errors.push("missing 'platform'".to_string());
        }
        if self.run.path.is_empty() {
            errors.push("missing path to executable to run".to_string());
        }

        let mut seen = HashSet::new();
        for input in &self.inputs {
            if input.name.is_empty() {
                errors.push("input has empty name".to_string());
            }
            if !seen.insert(input.mount_path()) {
                errors.push(format!("duplicate input path '{}'", input.mount_path()));
            }
        }
        for output in &self.outputs {
            if output.name.is_empty() {
                errors.push("output has empty name".to_string());
            }
            if output.mount_path() == "." || output.mount_path().is_empty() {
                errors.push(format!("output '{}' cannot be the working directory", output.name));
            }
            if !seen.insert(output.mount_path()) {
                errors.push(format!("output '{}' overlaps another mount", output.name));
            }
        }
        for cache in &self.caches {
            if cache.path.is_empty() {
                errors.push("cache path cannot be empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidTaskConfig(errors.join("; ")))
        }
    }

    /// Apply step-level params over the task's own defaults.
    pub fn merge_params(&mut self, overrides: &BTreeMap<String, String>) {
        for (k, v) in overrides {
            self.params.insert(k.clone(), v.clone());
        }
    }
}
