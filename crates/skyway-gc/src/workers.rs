//! Worker state upkeep.
//!
//! Workers that stop heartbeating are stalled. Landing and retiring
//! workers finish their transition once no build holds a container on
//! them. Stalled workers that stay away past the missing grace are landed,
//! or retired when ephemeral, and retired workers are deleted.

use crate::before;
use async_trait::async_trait;
use chrono::Utc;
use skyway_component::Task;
use skyway_core::Result;
use skyway_core::config::GcConfig;
use skyway_core::ports::{ContainerRepository, WorkerRepository};
use skyway_core::worker::{Worker, WorkerState};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct WorkerCollector {
    workers: Arc<dyn WorkerRepository>,
    containers: Arc<dyn ContainerRepository>,
    stall_after: Duration,
    missing_grace: Duration,
}

impl WorkerCollector {
    pub fn new(workers: Arc<dyn WorkerRepository>, containers: Arc<dyn ContainerRepository>, config: &GcConfig) -> Self {
        Self {
            workers,
            containers,
            stall_after: config.worker_heartbeat_stall_after(),
            missing_grace: config.missing_grace_period(),
        }
    }

    /// What should happen to `worker`; `busy` means a build still holds a
    /// container on it.
    fn action(&self, worker: &Worker, busy: bool) -> Option<Action> {
        let now = Utc::now();
        let silent = worker.last_heartbeat < before(now, self.stall_after);
        let missing = worker.last_heartbeat < before(now, self.missing_grace);
        match worker.state {
            WorkerState::Running | WorkerState::Landing | WorkerState::Retiring if silent => {
                Some(Action::Move(WorkerState::Stalled))
            }
            WorkerState::Landing if !busy => Some(Action::Move(WorkerState::Landed)),
            WorkerState::Retiring if !busy => Some(Action::Move(WorkerState::Retired)),
            WorkerState::Stalled if missing && worker.ephemeral => Some(Action::Move(WorkerState::Retired)),
            WorkerState::Stalled if missing => Some(Action::Move(WorkerState::Landed)),
            WorkerState::Retired => Some(Action::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Move(WorkerState),
    Delete,
}

#[async_trait]
impl Task for WorkerCollector {
    async fn run(&self, _cancel: CancellationToken) -> Result<()> {
        let busy: HashSet<String> = self
            .containers
            .containers()
            .await?
            .into_iter()
            .filter(|c| c.owner.as_ref().is_some_and(|o| o.build_id().is_some()))
            .map(|c| c.worker_name)
            .collect();

        let mut moved = 0;
        let mut deleted = 0;
        for worker in self.workers.workers().await? {
            match self.action(&worker, busy.contains(&worker.name)) {
                Some(Action::Move(state)) => {
                    if let Err(e) = self.workers.set_worker_state(&worker.name, state).await {
                        warn!(worker = %worker.name, error = %e, "Failed to move worker");
                        continue;
                    }
                    info!(worker = %worker.name, from = %worker.state, to = %state, "Worker state changed");
                    moved += 1;
                }
                Some(Action::Delete) => {
                    self.workers.delete_worker(&worker.name).await?;
                    info!(worker = %worker.name, "Deleted retired worker");
                    deleted += 1;
                }
                None => {}
            }
        }

        if moved + deleted > 0 {
            info!(moved, deleted, "Collected workers");
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

    fn collector(f: &Fixture) -> WorkerCollector {
        WorkerCollector::new(f.store.clone(), f.store.clone(), &GcConfig::default())
    }

    async fn state(f: &Fixture, name: &str) -> Option<WorkerState> {
        f.store.worker(name).await.unwrap().map(|w| w.state)
    }

    #[tokio::test]
    async fn test_silent_worker_is_stalled() {
        let f = Fixture::new().await;
        f.store.set_worker_heartbeat("w1", Utc::now() - chrono::Duration::seconds(90));

        collector(&f).run(CancellationToken::new()).await.unwrap();

        assert_eq!(state(&f, "w1").await, Some(WorkerState::Stalled));
    }

    #[tokio::test]
    async fn test_heartbeating_worker_is_left_alone() {
        let f = Fixture::new().await;
        collector(&f).run(CancellationToken::new()).await.unwrap();
        assert_eq!(state(&f, "w1").await, Some(WorkerState::Running));
    }

    #[tokio::test]
    async fn test_landing_waits_for_builds() {
        let f = Fixture::new().await;
        let plan = skyway_core::plan::Plan::new("root", skyway_core::plan::PlanKind::Do(vec![]));
        let build = f.store.create_started_build(f.team_id, None, &plan).await.unwrap();
        f.build_container("w1", &build).await;
        f.store.set_worker_state("w1", WorkerState::Landing).await.unwrap();
        let collector = collector(&f);

        collector.run(CancellationToken::new()).await.unwrap();
        assert_eq!(state(&f, "w1").await, Some(WorkerState::Landing));

        f.store
            .finish_build(build.id, skyway_core::build::BuildStatus::Succeeded)
            .await
            .unwrap();
        f.store
            .release_finished_build_containers(Utc::now() + chrono::Duration::seconds(1), Utc::now())
            .await
            .unwrap();
        collector.run(CancellationToken::new()).await.unwrap();
        assert_eq!(state(&f, "w1").await, Some(WorkerState::Landed));
    }

    #[tokio::test]
    async fn test_retiring_worker_is_retired_then_deleted() {
        let f = Fixture::new().await;
        f.store.set_worker_state("w1", WorkerState::Retiring).await.unwrap();
        let collector = collector(&f);

        collector.run(CancellationToken::new()).await.unwrap();
        assert_eq!(state(&f, "w1").await, Some(WorkerState::Retired));

        collector.run(CancellationToken::new()).await.unwrap();
        assert_eq!(state(&f, "w1").await, None);
    }

    #[tokio::test]
    async fn test_missing_workers_land_or_retire() {
        let f = Fixture::new().await;
        f.store
            .save_worker(&Worker {
                ephemeral: true,
                ..worker("w2")
            })
            .await
            .unwrap();
        for name in ["w1", "w2"] {
            f.store.set_worker_state(name, WorkerState::Stalled).await.unwrap();
            f.store.set_worker_heartbeat(name, Utc::now() - chrono::Duration::minutes(10));
        }
        let collector = collector(&f);

        collector.run(CancellationToken::new()).await.unwrap();
        assert_eq!(state(&f, "w1").await, Some(WorkerState::Landed));
        assert_eq!(state(&f, "w2").await, Some(WorkerState::Retired));

        collector.run(CancellationToken::new()).await.unwrap();
        assert_eq!(state(&f, "w1").await, Some(WorkerState::Landed));
        assert_eq!(state(&f, "w2").await, None);
    }
}
