//! Check rows and check-session containers.

use crate::before;
use async_trait::async_trait;
use chrono::Utc;
use skyway_component::Task;
use skyway_core::Result;
use skyway_core::config::CoreConfig;
use skyway_core::ports::{CheckRepository, ContainerRepository};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Errors checks that outlived the global check timeout and deletes
/// finished checks older than the recycle period.
pub struct CheckCollector {
    checks: Arc<dyn CheckRepository>,
    timeout: Duration,
    recycle_period: Duration,
}

impl CheckCollector {
    pub fn new(checks: Arc<dyn CheckRepository>, config: &CoreConfig) -> Self {
        Self {
            checks,
            timeout: config.global_resource_check_timeout(),
            recycle_period: config.gc.check_recycle_period(),
        }
    }
}

#[async_trait]
impl Task for CheckCollector {
    async fn run(&self, _cancel: CancellationToken) -> Result<()> {
        let now = Utc::now();
        let expired = self.checks.expire_checks(before(now, self.timeout)).await?;
        let deleted = self.checks.delete_checks_before(before(now, self.recycle_period)).await?;
        if expired + deleted > 0 {
            info!(expired, deleted, "Collected checks");
        }
        Ok(())
    }
}

/// Releases check containers whose session expired so the container
/// collector can destroy them.
pub struct CheckSessionCollector {
    containers: Arc<dyn ContainerRepository>,
}

impl CheckSessionCollector {
    pub fn new(containers: Arc<dyn ContainerRepository>) -> Self {
        Self { containers }
    }
}

#[async_trait]
impl Task for CheckSessionCollector {
    async fn run(&self, _cancel: CancellationToken) -> Result<()> {
        let expired = self.containers.expire_check_sessions(Utc::now()).await?;
        if expired > 0 {
            info!(expired, "Expired check sessions");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use skyway_core::ports::*;
    use pretty_assertions::assert_eq;
    use skyway_core::check::CheckTarget;
    use skyway_core::config::GcConfig;
    use skyway_core::ids::{ResourceConfigId, ResourceId};
    use skyway_core::plan::CheckPlan;
    use skyway_core::worker::ContainerOwner;

    fn plan() -> CheckPlan {
        CheckPlan {
            type_name: "git".to_string(),
            source: Default::default(),
            from_version: None,
            timeout_secs: 60,
            tags: vec![],
            resource_types: vec![],
        }
    }

    async fn queue(f: &Fixture) {
        f.store
            .create_check(ResourceConfigId::new(7), CheckTarget::Resource(ResourceId::new(1)), &plan())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_fresh_checks_are_kept() {
        let f = Fixture::new().await;
        queue(&f).await;

        CheckCollector::new(f.store.clone(), &CoreConfig::default())
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(f.store.pending_checks(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stuck_check_is_expired_then_recycled() {
        let f = Fixture::new().await;
        queue(&f).await;
        let config = CoreConfig {
            global_resource_check_timeout_secs: 0,
            gc: GcConfig {
                check_recycle_period_secs: 0,
                ..GcConfig::default()
            },
            ..CoreConfig::default()
        };
        let collector = CheckCollector::new(f.store.clone(), &config);

        collector.run(CancellationToken::new()).await.unwrap();
        assert!(f.store.pending_checks(10).await.unwrap().is_empty());

        collector.run(CancellationToken::new()).await.unwrap();
        let leftover = f
            .store
            .delete_checks_before(Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn test_expired_session_releases_container() {
        let f = Fixture::new().await;
        let expired = ContainerOwner::CheckSession {
            resource_config_id: ResourceConfigId::new(7),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
        };
        let live = ContainerOwner::CheckSession {
            resource_config_id: ResourceConfigId::new(8),
            expires_at: Utc::now() + chrono::Duration::minutes(5),
        };
        let stale = f.store.create_container("w1", &expired).await.unwrap();
        let fresh = f.store.create_container("w1", &live).await.unwrap();

        CheckSessionCollector::new(f.store.clone())
            .run(CancellationToken::new())
            .await
            .unwrap();

        let owners: Vec<_> = f
            .store
            .containers()
            .await
            .unwrap()
            .into_iter()
            .map(|c| (c.handle, c.owner.is_some()))
            .collect();
        assert!(owners.contains(&(stale.handle, false)));
        assert!(owners.contains(&(fresh.handle, true)));
    }
}
