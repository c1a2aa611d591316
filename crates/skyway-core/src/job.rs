//! Jobs as stored for a pipeline.

use crate::ids::*;
use crate::pipeline::JobDefinition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub pipeline_id: PipelineId,
    pub team_id: TeamId,
    pub name: String,
    pub config: JobDefinition,
    pub paused: bool,
    pub build_number_seq: i64,
    pub schedule_requested_time: DateTime<Utc>,
    pub next_build_id: Option<BuildId>,
    pub latest_completed_build_id: Option<BuildId>,
}

impl Job {
    pub fn max_in_flight(&self) -> u32 {
        self.config.max_in_flight()
    }

    pub fn serial_groups(&self) -> Vec<String> {
        self.config.serial_groups()
    }

    /// True if this job shares a serial group with `groups`.
    pub fn shares_serial_group(&self, groups: &[String]) -> bool {
        self.serial_groups().iter().any(|g| groups.contains(g))
    }
}
