//! Spans for builds, steps, checks and periodic components.

use skyway_core::build::Build;
use tracing::{Level, Span, span};

/// Attributes attached to CI spans, following OpenTelemetry naming.
#[derive(Debug, Clone, Default)]
pub struct CiAttributes {
    pub team_id: Option<i64>,
    pub pipeline_id: Option<i64>,
    pub job_id: Option<i64>,
    pub build_id: Option<i64>,
    pub build_name: Option<String>,
    pub plan_id: Option<String>,
    pub step_kind: Option<String>,
    pub worker: Option<String>,
    pub resource_config_id: Option<i64>,
}

impl CiAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(mut self, build: &Build) -> Self {
        self.team_id = Some(build.team_id.get());
        self.pipeline_id = build.pipeline_id.map(|id| id.get());
        self.job_id = build.job_id.map(|id| id.get());
        self.build_id = Some(build.id.get());
        self.build_name = Some(build.name.clone());
        self
    }

    pub fn step(mut self, plan_id: impl Into<String>, kind: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self.step_kind = Some(kind.into());
        self
    }

    pub fn worker(mut self, name: impl Into<String>) -> Self {
        self.worker = Some(name.into());
        self
    }

    pub fn resource_config(mut self, id: i64) -> Self {
        self.resource_config_id = Some(id);
        self
    }
}

pub fn build_span(attrs: &CiAttributes) -> Span {
    span!(
        Level::INFO,
        "build.run",
        ci.team.id = attrs.team_id.unwrap_or(0),
        ci.pipeline.id = attrs.pipeline_id.unwrap_or(0),
        ci.job.id = attrs.job_id.unwrap_or(0),
        ci.build.id = attrs.build_id.unwrap_or(0),
        ci.build.name = attrs.build_name.as_deref().unwrap_or(""),
    )
}

pub fn step_span(attrs: &CiAttributes) -> Span {
    span!(
        Level::INFO,
        "step.run",
        ci.build.id = attrs.build_id.unwrap_or(0),
        ci.plan.id = attrs.plan_id.as_deref().unwrap_or(""),
        ci.step.kind = attrs.step_kind.as_deref().unwrap_or(""),
        ci.worker = attrs.worker.as_deref().unwrap_or(""),
    )
}

pub fn check_span(attrs: &CiAttributes) -> Span {
    span!(
        Level::INFO,
        "resource.check",
        ci.resource_config.id = attrs.resource_config_id.unwrap_or(0),
        ci.team.id = attrs.team_id.unwrap_or(0),
    )
}

/// One tick of a periodic component.
pub fn component_span(name: &str) -> Span {
    span!(Level::DEBUG, "component.tick", component = name)
}

pub fn collector_span(name: &str) -> Span {
    span!(Level::DEBUG, "gc.collect", collector = name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ci_attributes_builder() {
        let attrs = CiAttributes::new()
            .step("plan-3", "task")
            .worker("w1")
            .resource_config(9);

        assert_eq!(attrs.plan_id.as_deref(), Some("plan-3"));
        assert_eq!(attrs.step_kind.as_deref(), Some("task"));
        assert_eq!(attrs.worker.as_deref(), Some("w1"));
        assert_eq!(attrs.resource_config_id, Some(9));
        assert!(attrs.build_id.is_none());
    }
}
