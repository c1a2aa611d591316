//! Resource checks.

use crate::ids::*;
use crate::plan::CheckPlan;
use crate::resource::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Started,
    Succeeded,
    Errored,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Started => "started",
            CheckStatus::Succeeded => "succeeded",
            CheckStatus::Errored => "errored",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "started" => CheckStatus::Started,
            "succeeded" => CheckStatus::Succeeded,
            "errored" => CheckStatus::Errored,
            _ => return None,
        })
    }
}

/// What a check was created for; used to record errors and drop checks of
/// deleted resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum CheckTarget {
    Resource(ResourceId),
    ResourceType(ResourceTypeId),
}

/// A check is created `started` and unclaimed; a checker claims it by
/// stamping `start_time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Check {
    pub id: CheckId,
    pub resource_config_id: ResourceConfigId,
    pub target: CheckTarget,
    pub from_version: Option<Version>,
    pub plan: CheckPlan,
    pub status: CheckStatus,
    pub check_error: Option<String>,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Check {
    pub fn is_claimed(&self) -> bool {
        self.start_time.is_some()
    }
}
