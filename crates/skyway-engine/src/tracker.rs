//! Attaches an engine run to every in-flight build, one driver per build
//! across the fleet.

use crate::engine::Engine;
use async_trait::async_trait;
use skyway_component::Task;
use skyway_core::Result;
use skyway_core::component::leases;
use skyway_core::ids::BuildId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

pub struct Tracker {
    engine: Arc<Engine>,
    lease_ttl: Duration,
    shutdown: CancellationToken,
    running: Arc<Mutex<HashSet<BuildId>>>,
    tasks: TaskTracker,
}

impl Tracker {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            lease_ttl: DEFAULT_LEASE_TTL,
            shutdown: CancellationToken::new(),
            running: Arc::default(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Builds this process is currently driving.
    pub fn running(&self) -> Vec<BuildId> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Release every build and wait up to `timeout` for the runs to let go.
    /// Unfinished builds stay `started` for another tracker to pick up.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        self.tasks.close();
        match tokio::time::timeout(timeout, self.tasks.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(remaining = self.tasks.len(), "Build runs did not stop in time");
                false
            }
        }
    }

    fn claim(&self, id: BuildId) -> bool {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).insert(id)
    }

    fn unclaim(running: &Mutex<HashSet<BuildId>>, id: BuildId) {
        running.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
    }
}

#[async_trait]
impl Task for Tracker {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let ctx = self.engine.context();
        for build in ctx.builds.builds_to_track().await? {
            if cancel.is_cancelled() || self.shutdown.is_cancelled() {
                break;
            }
            let id = build.id;
            if !self.claim(id) {
                continue;
            }
            let Some(lease) = ctx.leases.acquire(&leases::build_tracking(id), self.lease_ttl).await? else {
                debug!(build_id = %id, "Build driven elsewhere");
                Self::unclaim(&self.running, id);
                continue;
            };

            let engine = self.engine.clone();
            let running = self.running.clone();
            let stop = self.shutdown.child_token();
            self.tasks.spawn(async move {
                let lost = lease.lost();
                let run = engine.run_build(build, stop.clone());
                tokio::pin!(run);
                let result = tokio::select! {
                    result = &mut run => result,
                    _ = lost.cancelled() => {
                        warn!(build_id = %id, "Build lease lost, releasing build");
                        stop.cancel();
                        run.await
                    }
                };
                match result {
                    Ok(Some(status)) => debug!(build_id = %id, status = %status.as_str(), "Build run ended"),
                    Ok(None) => info!(build_id = %id, "Build run released"),
                    Err(e) => error!(build_id = %id, error = %e, "Build run failed"),
                }
                if !lease.is_lost()
                    && let Err(e) = lease.release().await
                {
                    warn!(build_id = %id, error = %e, "Failed to release build lease");
                }
                Self::unclaim(&running, id);
            });
        }
        Ok(())
    }
}
