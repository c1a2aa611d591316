//! Garbage collection for Skyway.
//!
//! Every collector is a [`Task`] run by its own component runner, so at
//! most one web node collects a given kind of garbage at a time. Each run
//! is idempotent: a collector that is interrupted simply picks up the rest
//! on its next tick.

pub mod artifacts;
pub mod builds;
pub mod checks;
pub mod containers;
pub mod resources;
pub mod vars;
pub mod volumes;
pub mod workers;

#[cfg(test)]
mod testing;

pub use artifacts::ArtifactCollector;
pub use builds::{BuildCollector, BuildLogCollector};
pub use checks::{CheckCollector, CheckSessionCollector};
pub use containers::ContainerCollector;
pub use resources::{ResourceCacheCollector, ResourceCacheUseCollector, ResourceConfigCollector};
pub use vars::VarSourceCollector;
pub use volumes::VolumeCollector;
pub use workers::WorkerCollector;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skyway_component::Task;
use skyway_core::Result;
use skyway_core::component;
use skyway_core::config::CoreConfig;
use skyway_core::ports::*;
use skyway_secrets::VarSourcePool;
use skyway_trace::collector_span;
use skyway_worker::Provisioner;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Store ports and worker plumbing shared by the collectors.
#[derive(Clone)]
pub struct GcContext {
    pub builds: Arc<dyn BuildRepository>,
    pub events: Arc<dyn EventStore>,
    pub pipelines: Arc<dyn PipelineRepository>,
    pub workers: Arc<dyn WorkerRepository>,
    pub containers: Arc<dyn ContainerRepository>,
    pub volumes: Arc<dyn VolumeRepository>,
    pub artifacts: Arc<dyn ArtifactRepository>,
    pub configs: Arc<dyn ResourceConfigRepository>,
    pub checks: Arc<dyn CheckRepository>,
    pub provisioner: Arc<Provisioner>,
    pub var_sources: Option<Arc<VarSourcePool>>,
}

/// Every collector paired with its component name, ready for a runner.
pub fn collectors(ctx: &GcContext, config: &CoreConfig) -> Vec<(&'static str, Arc<dyn Task>)> {
    let gc = &config.gc;
    let mut all: Vec<(&'static str, Arc<dyn Task>)> = vec![
        (component::COLLECTOR_BUILDS, Arc::new(BuildCollector::new(ctx.builds.clone(), ctx.containers.clone(), gc))),
        (component::COLLECTOR_BUILD_LOGS, Arc::new(BuildLogCollector::new(ctx, config))),
        (component::COLLECTOR_WORKERS, Arc::new(WorkerCollector::new(ctx.workers.clone(), ctx.containers.clone(), gc))),
        (
            component::COLLECTOR_RESOURCE_CACHE_USES,
            Arc::new(ResourceCacheUseCollector::new(ctx.configs.clone())),
        ),
        (
            component::COLLECTOR_RESOURCE_CACHES,
            Arc::new(ResourceCacheCollector::new(ctx.configs.clone(), gc)),
        ),
        (
            component::COLLECTOR_RESOURCE_CONFIGS,
            Arc::new(ResourceConfigCollector::new(ctx.configs.clone(), gc)),
        ),
        (component::COLLECTOR_ARTIFACTS, Arc::new(ArtifactCollector::new(ctx.artifacts.clone(), gc))),
        (component::COLLECTOR_CHECKS, Arc::new(CheckCollector::new(ctx.checks.clone(), config))),
        (component::COLLECTOR_CHECK_SESSIONS, Arc::new(CheckSessionCollector::new(ctx.containers.clone()))),
        (component::COLLECTOR_CONTAINERS, Arc::new(ContainerCollector::new(ctx, gc))),
        (component::COLLECTOR_VOLUMES, Arc::new(VolumeCollector::new(ctx, gc))),
    ];
    if let Some(pool) = &ctx.var_sources {
        all.push((component::COLLECTOR_VAR_SOURCES, Arc::new(VarSourceCollector::new(pool.clone()))));
    }
    all.into_iter()
        .map(|(name, task)| (name, Arc::new(Traced { name, inner: task }) as Arc<dyn Task>))
        .collect()
}

/// Runs a collector inside its `gc.collect` span.
struct Traced {
    name: &'static str,
    inner: Arc<dyn Task>,
}

#[async_trait]
impl Task for Traced {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.inner.run(cancel).instrument(collector_span(self.name)).await
    }
}

/// The instant `period` before `now`, saturating at the earliest time.
pub(crate) fn before(now: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(period)
        .ok()
        .and_then(|period| now.checked_sub_signed(period))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
