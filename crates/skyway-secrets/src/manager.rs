//! Cached credential lookups shared by every build.

use async_trait::async_trait;
use serde_json::Value;
use skyway_core::Result;
use skyway_core::vars::{VarRef, Variables};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct VarSourcePoolConfig {
    /// How long a resolved value is reused.
    pub cache_ttl: Duration,
}

impl Default for VarSourcePoolConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
        }
    }
}

struct CachedValue {
    value: Option<Value>,
    cached_at: Instant,
}

/// Resolves variables through the registered sources, caching results so
/// that a burst of builds does not hammer the credential manager. Expired
/// entries are evicted by [`VarSourcePool::collect`].
pub struct VarSourcePool {
    config: VarSourcePoolConfig,
    sources: Vec<Arc<dyn Variables>>,
    cache: RwLock<HashMap<VarRef, CachedValue>>,
}

impl VarSourcePool {
    pub fn new(config: VarSourcePoolConfig) -> Self {
        Self {
            config,
            sources: Vec::new(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, source: Arc<dyn Variables>) {
        info!(sources = self.sources.len() + 1, "Registering variable source");
        self.sources.push(source);
    }

    /// Drop cache entries older than the TTL. Returns how many were evicted.
    pub async fn collect(&self) -> usize {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        let ttl = self.config.cache_ttl;
        cache.retain(|_, cached| cached.cached_at.elapsed() < ttl);
        let evicted = before - cache.len();
        if evicted > 0 {
            debug!(evicted, "Evicted cached variables");
        }
        evicted
    }

    pub async fn cache_size(&self) -> usize {
        self.cache.read().await.len()
    }
}

impl Default for VarSourcePool {
    fn default() -> Self {
        Self::new(VarSourcePoolConfig::default())
    }
}

#[async_trait]
impl Variables for VarSourcePool {
    async fn get(&self, var: &VarRef) -> Result<Option<Value>> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(var)
                && cached.cached_at.elapsed() < self.config.cache_ttl
            {
                return Ok(cached.value.clone());
            }
        }

        let mut value = None;
        for source in &self.sources {
            if let Some(found) = source.get(var).await? {
                value = Some(found);
                break;
            }
        }

        self.cache.write().await.insert(
            var.clone(),
            CachedValue {
                value: value.clone(),
                cached_at: Instant::now(),
            },
        );
        Ok(value)
    }
}
