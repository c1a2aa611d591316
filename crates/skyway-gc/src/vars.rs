//! Credential cache eviction.

use async_trait::async_trait;
use skyway_component::Task;
use skyway_core::Result;
use skyway_secrets::VarSourcePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct VarSourceCollector {
    pool: Arc<VarSourcePool>,
}

impl VarSourceCollector {
    pub fn new(pool: Arc<VarSourcePool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Task for VarSourceCollector {
    async fn run(&self, _cancel: CancellationToken) -> Result<()> {
        let evicted = self.pool.collect().await;
        if evicted > 0 {
            info!(evicted, "Evicted cached variables");
        }
        Ok(())
    }
}
