//! Container reaping.

use crate::{GcContext, before};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, stream};
use skyway_component::Task;
use skyway_core::Result;
use skyway_core::config::GcConfig;
use skyway_core::ports::{ContainerRepository, WorkerRepository};
use skyway_core::worker::{Container, ContainerState, Worker};
use skyway_worker::Provisioner;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) const DESTROY_CONCURRENCY: usize = 8;

/// Where a piece of garbage lives, as far as reaping it is concerned.
pub(crate) enum Placement<'a> {
    /// Reachable: destroy on the worker, then drop the row.
    Live(&'a Worker),
    /// Gone long enough that only the row is left to drop.
    Missing,
    /// Recently unreachable; try again later.
    Unreachable,
}

pub(crate) fn placement<'a>(
    workers: &'a HashMap<String, Worker>,
    name: &str,
    missing_cutoff: DateTime<Utc>,
) -> Placement<'a> {
    match workers.get(name) {
        Some(worker) if worker.state.is_reachable() => Placement::Live(worker),
        Some(worker) if worker.last_heartbeat < missing_cutoff => Placement::Missing,
        Some(_) => Placement::Unreachable,
        None => Placement::Missing,
    }
}

/// Releases containers of finished builds once their grace is over, then
/// destroys every container without an owner.
pub struct ContainerCollector {
    containers: Arc<dyn ContainerRepository>,
    workers: Arc<dyn WorkerRepository>,
    provisioner: Arc<Provisioner>,
    build_grace: Duration,
    hijack_grace: Duration,
    missing_grace: Duration,
}

impl ContainerCollector {
    pub fn new(ctx: &GcContext, config: &GcConfig) -> Self {
        Self {
            containers: ctx.containers.clone(),
            workers: ctx.workers.clone(),
            provisioner: ctx.provisioner.clone(),
            build_grace: config.one_off_build_grace_period(),
            hijack_grace: config.hijack_grace_period(),
            missing_grace: config.missing_grace_period(),
        }
    }

    async fn reap(&self, container: &Container, workers: &HashMap<String, Worker>, missing_cutoff: DateTime<Utc>) -> bool {
        let result = match placement(workers, &container.worker_name, missing_cutoff) {
            Placement::Live(worker) => self.provisioner.destroy_container(worker, &container.handle).await,
            Placement::Missing => {
                debug!(handle = %container.handle, worker = %container.worker_name, "Dropping container of missing worker");
                self.containers.delete_container(&container.handle).await
            }
            Placement::Unreachable => return false,
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(handle = %container.handle, worker = %container.worker_name, error = %e, "Failed to destroy container");
                false
            }
        }
    }
}

#[async_trait]
impl Task for ContainerCollector {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let now = Utc::now();
        let released = self
            .containers
            .release_finished_build_containers(before(now, self.build_grace), before(now, self.hijack_grace))
            .await?;
        if released > 0 {
            debug!(released, "Released finished build containers");
        }

        let workers: HashMap<String, Worker> = self
            .workers
            .workers()
            .await?
            .into_iter()
            .map(|w| (w.name.clone(), w))
            .collect();
        let doomed: Vec<Container> = self
            .containers
            .containers()
            .await?
            .into_iter()
            .filter(|c| c.owner.is_none() || c.state == ContainerState::Destroying)
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }

        let missing_cutoff = before(now, self.missing_grace);
        let reaps: Vec<BoxFuture<'_, bool>> = doomed
            .iter()
            .map(|container| self.reap(container, &workers, missing_cutoff).boxed())
            .collect();
        let destroyed = stream::iter(reaps)
            .buffer_unordered(DESTROY_CONCURRENCY)
            .take_until(cancel.cancelled())
            .collect::<Vec<bool>>()
            .await
            .into_iter()
            .filter(|destroyed| *destroyed)
            .count();

        info!(candidates = doomed.len(), destroyed, "Collected containers");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use skyway_core::ports::*;
    use pretty_assertions::assert_eq;
    use skyway_core::ids::ResourceConfigId;
    use skyway_core::worker::{ContainerOwner, WorkerState};

    fn collector(f: &Fixture) -> ContainerCollector {
        ContainerCollector::new(&f.ctx, &GcConfig::default())
    }

    async fn handles(f: &Fixture) -> Vec<skyway_core::ids::ContainerHandle> {
        f.store.containers().await.unwrap().into_iter().map(|c| c.handle).collect()
    }

    #[tokio::test]
    async fn test_recently_finished_build_keeps_container() {
        let f = Fixture::new().await;
        let build = f.finished_build().await;
        let container = f.build_container("w1", &build).await;

        collector(&f).run(CancellationToken::new()).await.unwrap();

        assert_eq!(handles(&f).await, vec![container.handle]);
        assert!(f.client.destroyed_containers().is_empty());
    }

    #[tokio::test]
    async fn test_old_build_container_is_destroyed() {
        let f = Fixture::new().await;
        let build = f.finished_build().await;
        let container = f.build_container("w1", &build).await;
        f.store
            .set_build_end_time(build.id, Utc::now() - chrono::Duration::minutes(10));

        collector(&f).run(CancellationToken::new()).await.unwrap();

        assert!(handles(&f).await.is_empty());
        assert_eq!(f.client.destroyed_containers(), vec![container.handle]);
    }

    #[tokio::test]
    async fn test_hijacked_container_gets_longer_grace() {
        let f = Fixture::new().await;
        let build = f.finished_build().await;
        let container = f.build_container("w1", &build).await;
        f.store.mark_hijacked(&container.handle).await.unwrap();
        f.store
            .set_build_end_time(build.id, Utc::now() - chrono::Duration::minutes(10));

        collector(&f).run(CancellationToken::new()).await.unwrap();

        assert_eq!(handles(&f).await, vec![container.handle]);
    }

    #[tokio::test]
    async fn test_running_build_container_is_kept() {
        let f = Fixture::new().await;
        let plan = skyway_core::plan::Plan::new("root", skyway_core::plan::PlanKind::Do(vec![]));
        let build = f.store.create_started_build(f.team_id, None, &plan).await.unwrap();
        f.build_container("w1", &build).await;
        let session = ContainerOwner::CheckSession {
            resource_config_id: ResourceConfigId::new(3),
            expires_at: Utc::now() + chrono::Duration::minutes(5),
        };
        f.store.create_container("w1", &session).await.unwrap();

        collector(&f).run(CancellationToken::new()).await.unwrap();

        assert_eq!(handles(&f).await.len(), 2);
    }

    #[tokio::test]
    async fn test_containers_of_missing_worker_are_dropped() {
        let f = Fixture::new().await;
        let build = f.finished_build().await;
        f.build_container("w1", &build).await;
        f.store
            .set_build_end_time(build.id, Utc::now() - chrono::Duration::minutes(10));
        f.store.set_worker_state("w1", WorkerState::Stalled).await.unwrap();
        let collector = collector(&f);

        collector.run(CancellationToken::new()).await.unwrap();
        assert_eq!(handles(&f).await.len(), 1);

        f.store.set_worker_heartbeat("w1", Utc::now() - chrono::Duration::minutes(10));
        collector.run(CancellationToken::new()).await.unwrap();
        assert!(handles(&f).await.is_empty());
        assert!(f.client.destroyed_containers().is_empty());
    }
}
