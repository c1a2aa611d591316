//! Builds and their inputs and outputs.

use crate::ids::*;
use crate::plan::Plan;
use crate::resource::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Errored | BuildStatus::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Started => "started",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
            BuildStatus::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => BuildStatus::Pending,
            "started" => BuildStatus::Started,
            "succeeded" => BuildStatus::Succeeded,
            "failed" => BuildStatus::Failed,
            "errored" => BuildStatus::Errored,
            "aborted" => BuildStatus::Aborted,
            _ => return None,
        })
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub name: String,
    pub status: BuildStatus,
    pub scheduled: bool,
    pub manually_triggered: bool,
    pub inputs_determined: bool,
    pub team_id: TeamId,
    pub pipeline_id: Option<PipelineId>,
    pub job_id: Option<JobId>,
    pub rerun_of: Option<BuildId>,
    pub rerun_number: i32,
    /// Decrypted private plan; absent until scheduled.
    pub private_plan: Option<Plan>,
    pub public_plan: Option<serde_json::Value>,
    pub abort_requested: bool,
    pub interceptible: bool,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub reap_time: Option<DateTime<Utc>>,
}

impl Build {
    pub fn is_one_off(&self) -> bool {
        self.job_id.is_none()
    }

    /// Counted against max-in-flight: started, or scheduled but not yet started.
    pub fn is_in_flight(&self) -> bool {
        self.status == BuildStatus::Started
            || (self.status == BuildStatus::Pending && self.scheduled)
    }
}

/// Name of the `n`th rerun of a build named `original`.
pub fn rerun_name(original: &str, n: i32) -> String {
    format!("{original}.{n}")
}

/// The version chosen for one `get` input of a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildInput {
    pub name: String,
    pub resource_id: ResourceId,
    pub version_id: VersionId,
    pub version: Version,
    /// True if no earlier build of the job used this version for this input.
    pub first_occurrence: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub resource_id: ResourceId,
    pub version_id: VersionId,
    pub version: Version,
}
