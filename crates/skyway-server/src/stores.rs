//! Port implementations selected by configuration.

use crate::config::ServerConfig;
use skyway_core::ports::*;
use skyway_core::{Error, Result};
use skyway_db::*;
use skyway_nats::{HealthCheck, HealthStatus, NatsBus, NatsConfig, PluginEventStore};
use skyway_secrets::{AesGcmStrategy, NoEncryption};
use skyway_secrets::encryption::{seal_canary, verify_canary};
use std::sync::Arc;
use tracing::{info, warn};

/// Every port the control plane reaches through.
#[derive(Clone)]
pub struct Stores {
    pub teams: Arc<dyn TeamRepository>,
    pub pipelines: Arc<dyn PipelineRepository>,
    pub builds: Arc<dyn BuildRepository>,
    pub creator: Arc<dyn BuildCreator>,
    pub events: Arc<dyn EventStore>,
    pub versions: Arc<dyn VersionRepository>,
    pub configs: Arc<dyn ResourceConfigRepository>,
    pub checks: Arc<dyn CheckRepository>,
    pub workers: Arc<dyn WorkerRepository>,
    pub containers: Arc<dyn ContainerRepository>,
    pub volumes: Arc<dyn VolumeRepository>,
    pub artifacts: Arc<dyn ArtifactRepository>,
    pub components: Arc<dyn ComponentRepository>,
    pub leases: Arc<dyn LeaseRepository>,
    pub bus: Arc<dyn NotificationBus>,
    /// Held to drain the connection on shutdown.
    pub nats: Option<Arc<NatsBus>>,
}

impl Stores {
    /// Everything in process, for a single node.
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            teams: store.clone(),
            pipelines: store.clone(),
            builds: store.clone(),
            creator: store.clone(),
            events: store.clone(),
            versions: store.clone(),
            configs: store.clone(),
            checks: store.clone(),
            workers: store.clone(),
            containers: store.clone(),
            volumes: store.clone(),
            artifacts: store.clone(),
            components: store.clone(),
            leases: store.clone(),
            bus: store.bus(),
            nats: None,
        }
    }

    /// Connect to PostgreSQL and, when configured, NATS. Migrations run and
    /// the encryption key is checked before anything else touches the data.
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        let db = Database::connect(&config.database_url).await?;
        db.migrate().await?;
        info!("Database migrated");

        let strategy = encryption(config);
        check_encryption_key(&db, strategy.as_ref()).await?;

        let nats = match &config.nats_url {
            Some(url) => {
                let bus = NatsBus::connect_with_config(NatsConfig::new(url.clone())).await?;
                ensure_operational(&bus.health_check())?;
                info!(url = %url, "Connected to NATS");
                Some(Arc::new(bus))
            }
            None => None,
        };
        let bus: Arc<dyn NotificationBus> = match &nats {
            Some(bus) => bus.clone(),
            None => Arc::new(PgBus::new(db.pool().clone())),
        };

        let events: Arc<dyn EventStore> = match (&nats, config.event_store_plugin) {
            (Some(bus), true) => Arc::new(PluginEventStore::over_nats(
                bus.client().clone(),
                NatsConfig::new(config.nats_url.clone().unwrap_or_default()),
                bus.metrics().clone(),
            )),
            (None, true) => return Err(Error::Other("event_store_plugin requires nats_url".to_string())),
            (_, false) => Arc::new(PgEventStore::new(db.pool().clone())),
        };
        events.setup().await?;

        let pool = db.pool().clone();
        Ok(Self {
            teams: Arc::new(PgTeamRepository::new(pool.clone())),
            pipelines: Arc::new(PgPipelineRepository::new(pool.clone())),
            builds: Arc::new(PgBuildRepository::new(pool.clone(), strategy.clone())),
            creator: Arc::new(PgBuildCreator::new(pool.clone(), strategy, events.clone())),
            events,
            versions: Arc::new(PgVersionRepository::new(pool.clone())),
            configs: Arc::new(PgResourceConfigRepository::new(pool.clone())),
            checks: Arc::new(PgCheckRepository::new(pool.clone())),
            workers: Arc::new(PgWorkerRepository::new(pool.clone())),
            containers: Arc::new(PgContainerRepository::new(pool.clone())),
            volumes: Arc::new(PgVolumeRepository::new(pool.clone())),
            artifacts: Arc::new(PgArtifactRepository::new(pool.clone())),
            components: Arc::new(PgComponentRepository::new(pool.clone())),
            leases: Arc::new(PgLeaseRepository::new(pool)),
            bus,
            nats,
        })
    }

    pub async fn close(&self) {
        if let Err(e) = self.events.close().await {
            warn!(error = %e, "Failed to close event store");
        }
        if let Some(nats) = &self.nats {
            let health = nats.health_check();
            info!(
                published = health.messages_published,
                requests = health.requests,
                failures = health.failures,
                reconnects = health.reconnect_attempts,
                "Closing NATS connection"
            );
            if let Err(e) = nats.shutdown().await {
                warn!(error = %e, "Failed to drain NATS connection");
            }
        }
    }
}

fn encryption(config: &ServerConfig) -> Arc<dyn EncryptionStrategy> {
    match &config.encryption_key {
        Some(key) => Arc::new(AesGcmStrategy::from_master_key(key)),
        None => {
            warn!("No encryption key configured, plans are stored in the clear");
            Arc::new(NoEncryption)
        }
    }
}

/// Seal the canary on first boot; on later boots it must open with the
/// configured key or startup fails.
async fn check_encryption_key(db: &Database, strategy: &dyn EncryptionStrategy) -> Result<()> {
    if let Some((ciphertext, nonce)) = db.encryption_canary().await? {
        return verify_canary(strategy, &ciphertext, nonce.as_deref());
    }
    let (ciphertext, nonce) = seal_canary(strategy)?;
    if db.store_encryption_canary(&ciphertext, nonce.as_deref()).await? {
        info!(encrypted = nonce.is_some(), "Stored encryption canary");
        return Ok(());
    }
    // Another node sealed it concurrently.
    match db.encryption_canary().await? {
        Some((ciphertext, nonce)) => verify_canary(strategy, &ciphertext, nonce.as_deref()),
        None => Err(Error::Database("encryption canary vanished".to_string())),
    }
}

/// A NATS connection that is down stops startup; a degraded one is used
/// with a warning.
fn ensure_operational(health: &HealthCheck) -> Result<()> {
    match &health.status {
        HealthStatus::Healthy => Ok(()),
        HealthStatus::Degraded { reason } => {
            warn!(reason = %reason, failures = health.failures, "NATS connection degraded");
            Ok(())
        }
        HealthStatus::Unhealthy { reason } => Err(Error::EventBus(format!("NATS unavailable: {reason}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyway_nats::NatsMetrics;

    #[test]
    fn test_disconnected_nats_stops_startup() {
        let metrics = NatsMetrics::new();
        let err = ensure_operational(&HealthCheck::from_metrics(&metrics, false)).unwrap_err();
        assert!(matches!(err, Error::EventBus(_)));
    }

    #[test]
    fn test_degraded_nats_is_used() {
        let metrics = NatsMetrics::new();
        assert!(ensure_operational(&HealthCheck::from_metrics(&metrics, true)).is_ok());
        metrics.record_publish_failure();
        assert!(ensure_operational(&HealthCheck::from_metrics(&metrics, true)).is_ok());
    }
}
