//! Shared dependencies of every build run.

use skyway_component::LeaseManager;
use skyway_core::build::Build;
use skyway_core::config::CoreConfig;
use skyway_core::ports::*;
use skyway_core::vars::Variables;
use skyway_core::worker::{ContainerOwner, WorkerSpec};
use skyway_events::BuildEmitter;
use skyway_worker::{BuildArtifacts, Pool, Provisioner};
use std::sync::Arc;
use std::time::Duration;

/// Ports and services the engine reaches through.
#[derive(Clone)]
pub struct EngineContext {
    pub builds: Arc<dyn BuildRepository>,
    pub events: Arc<dyn EventStore>,
    pub pipelines: Arc<dyn PipelineRepository>,
    pub versions: Arc<dyn VersionRepository>,
    pub configs: Arc<dyn ResourceConfigRepository>,
    pub containers: Arc<dyn ContainerRepository>,
    pub volumes: Arc<dyn VolumeRepository>,
    pub artifacts: Arc<dyn ArtifactRepository>,
    pub bus: Arc<dyn NotificationBus>,
    pub pool: Arc<Pool>,
    pub provisioner: Arc<Provisioner>,
    pub leases: Arc<LeaseManager>,
    /// Credential sources behind `((var))` references.
    pub vars: Arc<dyn Variables>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub redact_secrets: bool,
    /// How long `on_abort` and `ensure` hooks may run after an abort.
    pub abort_grace_period: Duration,
    /// Upper bound on a single resource check.
    pub check_timeout: Duration,
}

impl EngineConfig {
    pub fn from_core(config: &CoreConfig) -> Self {
        Self {
            redact_secrets: config.enable_redact_secrets,
            abort_grace_period: config.abort_grace_period(),
            check_timeout: config.global_resource_check_timeout(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_core(&CoreConfig::default())
    }
}

/// Everything one build's steps share.
pub struct RunState {
    pub ctx: Arc<EngineContext>,
    pub config: EngineConfig,
    pub emitter: BuildEmitter,
    pub artifacts: BuildArtifacts,
}

impl RunState {
    pub fn new(ctx: Arc<EngineContext>, config: EngineConfig, build: Build) -> Self {
        let emitter = BuildEmitter::new(ctx.events.clone(), build).with_redaction(config.redact_secrets);
        Self {
            ctx,
            config,
            emitter,
            artifacts: BuildArtifacts::new(),
        }
    }

    pub fn build(&self) -> &Build {
        self.emitter.build()
    }

    pub(crate) fn step_owner(&self, plan_id: &skyway_core::ids::PlanId) -> ContainerOwner {
        ContainerOwner::BuildStep {
            build_id: self.build().id,
            plan_id: plan_id.clone(),
            team_id: self.build().team_id,
        }
    }

    pub(crate) fn worker_spec(&self, platform: Option<String>, tags: &[String], resource_type: Option<String>) -> WorkerSpec {
        WorkerSpec {
            platform,
            tags: tags.to_vec(),
            team_id: Some(self.build().team_id),
            resource_type,
        }
    }
}
