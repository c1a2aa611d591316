//! The worker pool.

use crate::placement::{PlacementChain, PlacementContext};
use futures::StreamExt;
use skyway_core::ids::VolumeHandle;
use skyway_core::ports::{ContainerRepository, NotificationBus, NotificationStream, VolumeRepository, WorkerRepository};
use skyway_core::worker::{ContainerOwner, ContainerState, VolumeState, Worker, WorkerSpec, WorkerState};
use skyway_core::{Error, Result, channels};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Re-read the worker table at least this often while waiting, in case a
/// notification is missed.
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct Pool {
    workers: Arc<dyn WorkerRepository>,
    containers: Arc<dyn ContainerRepository>,
    volumes: Arc<dyn VolumeRepository>,
    bus: Arc<dyn NotificationBus>,
    chain: PlacementChain,
    wait_timeout: Duration,
}

impl Pool {
    pub fn new(
        workers: Arc<dyn WorkerRepository>,
        containers: Arc<dyn ContainerRepository>,
        volumes: Arc<dyn VolumeRepository>,
        bus: Arc<dyn NotificationBus>,
    ) -> Self {
        Self {
            workers,
            containers,
            volumes,
            bus,
            chain: PlacementChain::default(),
            wait_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_chain(mut self, chain: PlacementChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub async fn running_workers(&self) -> Result<Vec<Worker>> {
        Ok(self
            .workers
            .workers()
            .await?
            .into_iter()
            .filter(|w| w.state == WorkerState::Running)
            .collect())
    }

    /// A reachable worker by name; used to address volumes that already live
    /// somewhere.
    pub async fn find_worker(&self, name: &str) -> Result<Worker> {
        match self.workers.worker(name).await? {
            Some(w) if w.state.is_reachable() => Ok(w),
            _ => Err(Error::WorkerNotFound(name.to_string())),
        }
    }

    /// Whether a worker can host a container for `spec`, ignoring team.
    pub fn compatible(worker: &Worker, spec: &WorkerSpec) -> bool {
        if let Some(platform) = &spec.platform
            && &worker.platform != platform
        {
            return false;
        }
        // Untagged steps only land on untagged workers.
        if spec.tags.is_empty() {
            if !worker.tags.is_empty() {
                return false;
            }
        } else if !spec.tags.iter().all(|t| worker.tags.contains(t)) {
            return false;
        }
        if let Some(type_name) = &spec.resource_type
            && worker.resource_type(type_name).is_none()
        {
            return false;
        }
        true
    }

    /// Running workers compatible with `spec`. A team's own workers are
    /// preferred over global ones; other teams' workers are never visible.
    pub async fn satisfying(&self, spec: &WorkerSpec) -> Result<Vec<Worker>> {
        let compatible: Vec<Worker> = self
            .running_workers()
            .await?
            .into_iter()
            .filter(|w| Self::compatible(w, spec))
            .collect();

        if let Some(team) = spec.team_id {
            let own: Vec<Worker> = compatible
                .iter()
                .filter(|w| w.team_id == Some(team))
                .cloned()
                .collect();
            if !own.is_empty() {
                return Ok(own);
            }
        }
        Ok(compatible.into_iter().filter(|w| w.team_id.is_none()).collect())
    }

    async fn placement_context(&self, input_volumes: &[VolumeHandle]) -> Result<PlacementContext> {
        let mut ctx = PlacementContext::default();
        for container in self.containers.containers().await? {
            if container.state == ContainerState::Destroying {
                continue;
            }
            *ctx.containers.entry(container.worker_name.clone()).or_default() += 1;
            if matches!(container.owner, Some(ContainerOwner::BuildStep { .. })) {
                *ctx.build_containers.entry(container.worker_name).or_default() += 1;
            }
        }
        for volume in self.volumes.volumes().await? {
            if matches!(volume.state, VolumeState::Creating | VolumeState::Created) {
                *ctx.volumes.entry(volume.worker_name).or_default() += 1;
            }
        }
        for handle in input_volumes {
            if let Some(volume) = self.volumes.volume(handle).await? {
                *ctx.input_volumes.entry(volume.worker_name).or_default() += 1;
            }
        }
        Ok(ctx)
    }

    /// Pick one worker for a container, waiting up to the pool's timeout for
    /// a suitable one to appear or free up.
    ///
    /// The wait timeout is the caller's deadline: when it passes the result
    /// is [`Error::NoWorkersSatisfying`] if nothing matches `spec`, or
    /// [`Error::NoWorkers`] if the placement chain filtered every match out.
    /// Cancelling `cancel` means the step itself was interrupted and yields
    /// [`Error::Aborted`].
    pub async fn choose_for(
        &self,
        spec: &WorkerSpec,
        input_volumes: &[VolumeHandle],
        cancel: &CancellationToken,
    ) -> Result<Worker> {
        let mut changes: Option<NotificationStream> = match self.bus.listen(channels::WORKER_STATE_CHANGED).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, "Cannot listen for worker changes, polling instead");
                None
            }
        };
        let deadline = Instant::now() + self.wait_timeout;
        let mut waited = false;

        loop {
            let candidates = self.satisfying(spec).await?;
            let failure = if candidates.is_empty() {
                Error::NoWorkersSatisfying(spec.describe())
            } else {
                let ctx = self.placement_context(input_volumes).await?;
                match self.chain.choose(candidates, &ctx) {
                    Some(worker) => {
                        if waited {
                            info!(worker = %worker.name, "Worker available after waiting");
                        }
                        return Ok(worker);
                    }
                    None => Error::NoWorkers,
                }
            };

            if Instant::now() >= deadline {
                return Err(failure);
            }
            if !waited {
                debug!(spec = %spec.describe(), error = %failure, "Waiting for a worker");
                waited = true;
            }

            let poll = tokio::time::sleep(WAIT_POLL_INTERVAL.min(deadline - Instant::now()));
            let ended = match &mut changes {
                Some(stream) => tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Aborted),
                    signal = stream.next() => signal.is_none(),
                    _ = poll => false,
                },
                None => tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Aborted),
                    _ = poll => false,
                },
            };
            if ended {
                changes = None;
            }
        }
    }

    /// Pick a worker for a task container. When the chain caps active tasks
    /// one of the worker's task slots is taken as well; it is given back
    /// through [`TaskSlot::release`], or when the slot is dropped.
    pub async fn choose_for_task(
        &self,
        spec: &WorkerSpec,
        input_volumes: &[VolumeHandle],
        cancel: &CancellationToken,
    ) -> Result<(Worker, Option<TaskSlot>)> {
        let Some(max) = self.chain.active_task_limit() else {
            return Ok((self.choose_for(spec, input_volumes, cancel).await?, None));
        };
        loop {
            let worker = self.choose_for(spec, input_volumes, cancel).await?;
            let active = self.workers.increase_active_tasks(&worker.name).await?;
            let slot = TaskSlot {
                workers: self.workers.clone(),
                worker: worker.name.clone(),
                released: false,
            };
            if active.max(0) as usize <= max {
                return Ok((worker, Some(slot)));
            }
            // Another build took the last slot between choosing and counting.
            slot.release().await;
            debug!(worker = %worker.name, active, max, "Task slot taken, choosing again");
        }
    }
}

/// One counted task on a worker.
pub struct TaskSlot {
    workers: Arc<dyn WorkerRepository>,
    worker: String,
    released: bool,
}

impl TaskSlot {
    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.workers.decrease_active_tasks(&self.worker).await {
            warn!(worker = %self.worker, error = %e, "Failed to release task slot");
        }
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Dropped mid-task, e.g. when the build is handed to another node.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(worker = %self.worker, "Task slot leaked outside a runtime");
            return;
        };
        let workers = self.workers.clone();
        let worker = std::mem::take(&mut self.worker);
        runtime.spawn(async move {
            if let Err(e) = workers.decrease_active_tasks(&worker).await {
                warn!(worker = %worker, error = %e, "Failed to release task slot");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use skyway_core::ids::{BuildId, PlanId, TeamId};
    use skyway_core::ports::VolumeRequest;
    use skyway_core::worker::WorkerResourceType;
    use skyway_db::memory::MemoryStore;

    fn worker(name: &str) -> Worker {
        Worker {
            name: name.to_string(),
            state: WorkerState::Running,
            platform: "linux".to_string(),
            tags: vec![],
            team_id: None,
            garden_addr: format!("{name}:7777"),
            baggageclaim_url: format!("http://{name}:7788"),
            version: "2.5".to_string(),
            resource_types: vec![WorkerResourceType {
                type_name: "git".to_string(),
                image: "/usr/local/skyway/resource-types/git/rootfs".to_string(),
                version: "1.0".to_string(),
                privileged: false,
            }],
            ephemeral: false,
            active_tasks: 0,
            start_time: Utc::now(),
            last_heartbeat: Utc::now(),
        }
    }

    fn pool(store: &Arc<MemoryStore>) -> Pool {
        Pool::new(store.clone(), store.clone(), store.clone(), store.bus())
            .with_wait_timeout(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_satisfying_filters_platform_tags_and_types() {
        let store = Arc::new(MemoryStore::new());
        store.save_worker(&worker("plain")).await.unwrap();
        store
            .save_worker(&Worker {
                tags: vec!["gpu".to_string()],
                ..worker("tagged")
            })
            .await
            .unwrap();
        store
            .save_worker(&Worker {
                platform: "windows".to_string(),
                ..worker("win")
            })
            .await
            .unwrap();
        let pool = pool(&store);

        let untagged = pool.satisfying(&WorkerSpec::default()).await.unwrap();
        let mut names: Vec<_> = untagged.iter().map(|w| w.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["plain", "win"]);

        let gpu = pool
            .satisfying(&WorkerSpec {
                tags: vec!["gpu".to_string()],
                ..WorkerSpec::default()
            })
            .await
            .unwrap();
        assert_eq!(gpu.len(), 1);
        assert_eq!(gpu[0].name, "tagged");

        let docker = pool
            .satisfying(&WorkerSpec {
                resource_type: Some("docker-image".to_string()),
                ..WorkerSpec::default()
            })
            .await
            .unwrap();
        assert!(docker.is_empty());
    }

    #[tokio::test]
    async fn test_team_workers_preferred_and_isolated() {
        let store = Arc::new(MemoryStore::new());
        store.save_worker(&worker("global")).await.unwrap();
        store
            .save_worker(&Worker {
                team_id: Some(TeamId::new(1)),
                ..worker("team-one")
            })
            .await
            .unwrap();
        let pool = pool(&store);

        let mine = pool
            .satisfying(&WorkerSpec {
                team_id: Some(TeamId::new(1)),
                ..WorkerSpec::default()
            })
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].name, "team-one");

        let other = pool
            .satisfying(&WorkerSpec {
                team_id: Some(TeamId::new(2)),
                ..WorkerSpec::default()
            })
            .await
            .unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].name, "global");
    }

    #[tokio::test]
    async fn test_choose_for_prefers_volume_locality() {
        let store = Arc::new(MemoryStore::new());
        store.save_worker(&worker("a")).await.unwrap();
        store.save_worker(&worker("b")).await.unwrap();
        let volume = store
            .create_volume(&VolumeRequest {
                worker_name: "b".to_string(),
                path: "/tmp/build/get".to_string(),
                ..VolumeRequest::default()
            })
            .await
            .unwrap();

        let chosen = pool(&store)
            .choose_for(&WorkerSpec::default(), &[volume.handle], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(chosen.name, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_choose_for_times_out_without_workers() {
        let store = Arc::new(MemoryStore::new());
        let err = pool(&store)
            .choose_for(&WorkerSpec::default(), &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoWorkersSatisfying(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_choose_for_waits_for_capacity() {
        let store = Arc::new(MemoryStore::new());
        store.save_worker(&worker("busy")).await.unwrap();
        let container = store
            .create_container(
                "busy",
                &ContainerOwner::BuildStep {
                    build_id: BuildId::new(1),
                    plan_id: PlanId::new("1"),
                    team_id: TeamId::new(1),
                },
            )
            .await
            .unwrap();
        let pool = Arc::new(pool(&store).with_chain(PlacementChain::new(vec![
            crate::placement::PlacementStrategy::LimitActiveContainers(1),
        ])));

        let waiting = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.choose_for(&WorkerSpec::default(), &[], &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiting.is_finished());

        store.delete_container(&container.handle).await.unwrap();
        let chosen = waiting.await.unwrap().unwrap();
        assert_eq!(chosen.name, "busy");
    }

    #[tokio::test(start_paused = true)]
    async fn test_choose_for_limits_exhausted_is_no_workers() {
        let store = Arc::new(MemoryStore::new());
        store
            .save_worker(&Worker {
                active_tasks: 3,
                ..worker("loaded")
            })
            .await
            .unwrap();
        let err = pool(&store)
            .with_chain(PlacementChain::new(vec![
                crate::placement::PlacementStrategy::LimitActiveTasks(1),
            ]))
            .choose_for(&WorkerSpec::default(), &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoWorkers));
    }

    #[tokio::test]
    async fn test_choose_for_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pool(&store)
            .choose_for(&WorkerSpec::default(), &[], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Aborted));
    }

    #[tokio::test]
    async fn test_choose_for_task_holds_a_slot_until_released() {
        let store = Arc::new(MemoryStore::new());
        store.save_worker(&worker("w1")).await.unwrap();
        let limited = pool(&store).with_chain(PlacementChain::new(vec![
            crate::placement::PlacementStrategy::LimitActiveTasks(2),
        ]));

        let (chosen, slot) = limited
            .choose_for_task(&WorkerSpec::default(), &[], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(chosen.name, "w1");
        assert_eq!(store.worker("w1").await.unwrap().unwrap().active_tasks, 1);

        // Re-registering does not reset what builds hold.
        store.save_worker(&worker("w1")).await.unwrap();
        assert_eq!(store.worker("w1").await.unwrap().unwrap().active_tasks, 1);

        slot.expect("limited chain takes a slot").release().await;
        assert_eq!(store.worker("w1").await.unwrap().unwrap().active_tasks, 0);
    }

    #[tokio::test]
    async fn test_choose_for_task_without_limit_takes_no_slot() {
        let store = Arc::new(MemoryStore::new());
        store.save_worker(&worker("w1")).await.unwrap();
        let (_, slot) = pool(&store)
            .choose_for_task(&WorkerSpec::default(), &[], &CancellationToken::new())
            .await
            .unwrap();
        assert!(slot.is_none());
        assert_eq!(store.worker("w1").await.unwrap().unwrap().active_tasks, 0);
    }
}
