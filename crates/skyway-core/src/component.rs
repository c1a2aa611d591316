//! Periodic components and the names of the leases they take.

use crate::ids::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const SCANNER: &str = "scanner";
pub const CHECKER: &str = "checker";
pub const SCHEDULER: &str = "scheduler";
pub const BUILD_TRACKER: &str = "tracker";
pub const COLLECTOR_BUILDS: &str = "collector_builds";
pub const COLLECTOR_BUILD_LOGS: &str = "collector_build_logs";
pub const COLLECTOR_WORKERS: &str = "collector_workers";
pub const COLLECTOR_RESOURCE_CONFIGS: &str = "collector_resource_configs";
pub const COLLECTOR_RESOURCE_CACHES: &str = "collector_resource_caches";
pub const COLLECTOR_RESOURCE_CACHE_USES: &str = "collector_resource_cache_uses";
pub const COLLECTOR_ARTIFACTS: &str = "collector_artifacts";
pub const COLLECTOR_CHECKS: &str = "collector_checks";
pub const COLLECTOR_VOLUMES: &str = "collector_volumes";
pub const COLLECTOR_CONTAINERS: &str = "collector_containers";
pub const COLLECTOR_CHECK_SESSIONS: &str = "collector_check_sessions";
pub const COLLECTOR_VAR_SOURCES: &str = "collector_var_sources";

/// Operator-tunable state of a periodic component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    pub interval: Duration,
    pub paused: bool,
    pub last_run: Option<DateTime<Utc>>,
}

impl Component {
    /// True if `interval` has elapsed since the last successful run.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_run {
            None => true,
            Some(last) => {
                let elapsed = now.signed_duration_since(last).to_std().unwrap_or_default();
                elapsed >= self.interval
            }
        }
    }
}

/// Lease names for the critical sections that are not components.
pub mod leases {
    use super::*;

    pub fn component(name: &str) -> String {
        format!("component:{name}")
    }

    pub fn job_scheduling(job_id: JobId) -> String {
        format!("scheduling:job:{job_id}")
    }

    pub fn build_tracking(build_id: BuildId) -> String {
        format!("tracking:build:{build_id}")
    }

    pub fn resource_config_check(config_id: ResourceConfigId) -> String {
        format!("check:resource_config:{config_id}")
    }

    pub fn cache_fetch(cache_id: ResourceCacheId, worker_name: &str) -> String {
        format!("fetch:cache:{cache_id}:{worker_name}")
    }
}
