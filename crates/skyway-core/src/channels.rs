//! Names of pub/sub notification channels.

use crate::ids::*;

pub const BUILD_STARTED: &str = "build_started";
pub const WORKER_STATE_CHANGED: &str = "worker_state_changed";

pub fn build_events(build_id: BuildId) -> String {
    format!("build_events_{build_id}")
}

pub fn build_abort(build_id: BuildId) -> String {
    format!("build_abort_{build_id}")
}

pub fn pipeline_paused(pipeline_id: PipelineId) -> String {
    format!("pipeline_paused_{pipeline_id}")
}
