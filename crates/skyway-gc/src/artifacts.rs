//! Worker artifact expiry.

use crate::before;
use async_trait::async_trait;
use chrono::Utc;
use skyway_component::Task;
use skyway_core::Result;
use skyway_core::config::GcConfig;
use skyway_core::ports::ArtifactRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Removes artifacts that were never initialized within the TTL, and
/// initialized artifacts nothing refers to any more. The volumes behind
/// removed artifacts are left to the volume collector.
pub struct ArtifactCollector {
    artifacts: Arc<dyn ArtifactRepository>,
    ttl: Duration,
}

impl ArtifactCollector {
    pub fn new(artifacts: Arc<dyn ArtifactRepository>, config: &GcConfig) -> Self {
        Self {
            artifacts,
            ttl: config.artifact_ttl(),
        }
    }
}

#[async_trait]
impl Task for ArtifactCollector {
    async fn run(&self, _cancel: CancellationToken) -> Result<()> {
        let expired = self.artifacts.remove_expired_artifacts(before(Utc::now(), self.ttl)).await?;
        let orphaned = self.artifacts.remove_orphaned_artifacts().await?;
        if expired + orphaned > 0 {
            info!(expired, orphaned, "Removed artifacts");
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
    use skyway_core::build::BuildStatus;
    use skyway_core::ids::ArtifactId;
    use skyway_core::plan::{Plan, PlanKind};
    use skyway_core::worker::{ArtifactAssociation, WorkerState};

    async fn remaining(f: &Fixture) -> Vec<ArtifactId> {
        let mut ids: Vec<ArtifactId> = f.store.artifacts().await.unwrap().into_iter().map(|a| a.id).collect();
        ids.sort();
        ids
    }

    fn collector(f: &Fixture) -> ArtifactCollector {
        ArtifactCollector::new(f.store.clone(), &GcConfig::default())
    }

    #[tokio::test]
    async fn test_uninitialized_artifact_expires_after_ttl() {
        let f = Fixture::new().await;
        let stale = f.store.create_artifact("stale", None, Some("w1")).await.unwrap();
        let fresh = f.store.create_artifact("fresh", None, Some("w1")).await.unwrap();
        f.store
            .set_artifact_created_at(stale.id, Utc::now() - chrono::Duration::hours(13));

        collector(&f).run(CancellationToken::new()).await.unwrap();

        assert_eq!(remaining(&f).await, vec![fresh.id]);
    }

    #[tokio::test]
    async fn test_artifact_outlives_its_running_build_only() {
        let f = Fixture::new().await;
        let plan = Plan::new("root", PlanKind::Do(vec![]));
        let build = f.store.create_started_build(f.team_id, None, &plan).await.unwrap();
        let artifact = f.store.create_artifact("output", Some(build.id), Some("w1")).await.unwrap();
        f.store.initialize_artifact(artifact.id, None).await.unwrap();
        let collector = collector(&f);

        collector.run(CancellationToken::new()).await.unwrap();
        assert_eq!(remaining(&f).await, vec![artifact.id]);

        f.store.finish_build(build.id, BuildStatus::Succeeded).await.unwrap();
        collector.run(CancellationToken::new()).await.unwrap();
        assert!(remaining(&f).await.is_empty());
    }

    #[tokio::test]
    async fn test_associated_artifact_is_kept() {
        let f = Fixture::new().await;
        let artifact = f.store.create_artifact("git", None, Some("w1")).await.unwrap();
        f.store
            .initialize_artifact(
                artifact.id,
                Some(ArtifactAssociation::BaseResourceType {
                    type_name: "git".to_string(),
                }),
            )
            .await
            .unwrap();

        collector(&f).run(CancellationToken::new()).await.unwrap();

        assert_eq!(remaining(&f).await, vec![artifact.id]);
    }

    #[tokio::test]
    async fn test_orphan_on_unreachable_worker_waits() {
        let f = Fixture::new().await;
        let artifact = f.store.create_artifact("orphan", None, Some("w1")).await.unwrap();
        f.store.initialize_artifact(artifact.id, None).await.unwrap();
        f.store.set_worker_state("w1", WorkerState::Stalled).await.unwrap();

        collector(&f).run(CancellationToken::new()).await.unwrap();

        assert_eq!(remaining(&f).await, vec![artifact.id]);
    }
}
