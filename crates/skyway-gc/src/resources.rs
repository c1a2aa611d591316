//! Resource config and cache lifecycle.
//!
//! Uses are released first, then caches nobody uses, then configs nothing
//! refers to. Each step only removes what the previous ones already freed,
//! so the three can run in any order and still converge.

use async_trait::async_trait;
use skyway_component::Task;
use skyway_core::Result;
use skyway_core::config::GcConfig;
use skyway_core::ports::ResourceConfigRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Drops cache uses held by finished builds and expired check sessions.
pub struct ResourceCacheUseCollector {
    configs: Arc<dyn ResourceConfigRepository>,
}

impl ResourceCacheUseCollector {
    pub fn new(configs: Arc<dyn ResourceConfigRepository>) -> Self {
        Self { configs }
    }
}

#[async_trait]
impl Task for ResourceCacheUseCollector {
    async fn run(&self, _cancel: CancellationToken) -> Result<()> {
        let released = self.configs.release_finished_cache_uses().await?;
        if released > 0 {
            info!(released, "Released resource cache uses");
        }
        Ok(())
    }
}

pub struct ResourceCacheCollector {
    configs: Arc<dyn ResourceConfigRepository>,
    grace: Duration,
}

impl ResourceCacheCollector {
    pub fn new(configs: Arc<dyn ResourceConfigRepository>, config: &GcConfig) -> Self {
        Self {
            configs,
            grace: config.unreferenced_grace_period(),
        }
    }
}

#[async_trait]
impl Task for ResourceCacheCollector {
    async fn run(&self, _cancel: CancellationToken) -> Result<()> {
        let deleted = self.configs.delete_unused_caches(self.grace).await?;
        if deleted > 0 {
            info!(deleted, "Deleted unused resource caches");
        }
        Ok(())
    }
}

pub struct ResourceConfigCollector {
    configs: Arc<dyn ResourceConfigRepository>,
    grace: Duration,
}

impl ResourceConfigCollector {
    pub fn new(configs: Arc<dyn ResourceConfigRepository>, config: &GcConfig) -> Self {
        Self {
            configs,
            grace: config.unreferenced_grace_period(),
        }
    }
}

#[async_trait]
impl Task for ResourceConfigCollector {
    async fn run(&self, _cancel: CancellationToken) -> Result<()> {
        let deleted = self.configs.delete_unused_configs(self.grace).await?;
        if deleted > 0 {
            info!(deleted, "Deleted unused resource configs");
        }
        Ok(())
    }
}
