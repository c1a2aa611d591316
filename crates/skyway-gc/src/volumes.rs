//! Volume reaping.

use crate::containers::{DESTROY_CONCURRENCY, Placement, placement};
use crate::{GcContext, before};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, stream};
use skyway_component::Task;
use skyway_core::Result;
use skyway_core::config::GcConfig;
use skyway_core::ids::ArtifactId;
use skyway_core::ports::{ArtifactRepository, VolumeRepository, WorkerRepository};
use skyway_core::worker::{Volume, VolumeAssociation, VolumeState, Worker};
use skyway_worker::Provisioner;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Destroys created volumes nothing owns, and drops every volume of a
/// worker that has been missing past the grace period.
///
/// A volume with live copy-on-write children is skipped until the children
/// are gone, so a chain is reaped over several runs.
pub struct VolumeCollector {
    volumes: Arc<dyn VolumeRepository>,
    workers: Arc<dyn WorkerRepository>,
    artifacts: Arc<dyn ArtifactRepository>,
    provisioner: Arc<Provisioner>,
    missing_grace: Duration,
}

impl VolumeCollector {
    pub fn new(ctx: &GcContext, config: &GcConfig) -> Self {
        Self {
            volumes: ctx.volumes.clone(),
            workers: ctx.workers.clone(),
            artifacts: ctx.artifacts.clone(),
            provisioner: ctx.provisioner.clone(),
            missing_grace: config.missing_grace_period(),
        }
    }

    async fn reap(&self, volume: &Volume, workers: &HashMap<String, Worker>, missing_cutoff: DateTime<Utc>) -> bool {
        let result = match placement(workers, &volume.worker_name, missing_cutoff) {
            Placement::Live(worker) => self.provisioner.destroy_volume(worker, &volume.handle).await,
            Placement::Missing => {
                debug!(handle = %volume.handle, worker = %volume.worker_name, "Dropping volume of missing worker");
                self.volumes.delete_volume(&volume.handle).await.map(|()| true)
            }
            Placement::Unreachable => return false,
        };
        match result {
            Ok(destroyed) => destroyed,
            Err(e) => {
                warn!(handle = %volume.handle, worker = %volume.worker_name, error = %e, "Failed to destroy volume");
                false
            }
        }
    }
}

/// Owned volumes stay. An artifact association only counts while the
/// artifact still exists.
fn is_garbage(volume: &Volume, artifacts: &HashSet<ArtifactId>) -> bool {
    match volume.state {
        VolumeState::Destroying => return true,
        VolumeState::Creating | VolumeState::Destroyed => return false,
        VolumeState::Created => {}
    }
    if volume.container_handle.is_some() {
        return false;
    }
    match &volume.association {
        None => true,
        Some(VolumeAssociation::BuildArtifact { artifact_id }) => !artifacts.contains(artifact_id),
        Some(_) => false,
    }
}

#[async_trait]
impl Task for VolumeCollector {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let now = Utc::now();
        let missing_cutoff = before(now, self.missing_grace);
        let workers: HashMap<String, Worker> = self
            .workers
            .workers()
            .await?
            .into_iter()
            .map(|w| (w.name.clone(), w))
            .collect();
        let artifacts: HashSet<ArtifactId> = self.artifacts.artifacts().await?.into_iter().map(|a| a.id).collect();

        let doomed: Vec<Volume> = self
            .volumes
            .volumes()
            .await?
            .into_iter()
            .filter(|v| {
                is_garbage(v, &artifacts) || matches!(placement(&workers, &v.worker_name, missing_cutoff), Placement::Missing)
            })
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }

        let reaps: Vec<BoxFuture<'_, bool>> = doomed
            .iter()
            .map(|volume| self.reap(volume, &workers, missing_cutoff).boxed())
            .collect();
        let destroyed = stream::iter(reaps)
            .buffer_unordered(DESTROY_CONCURRENCY)
            .take_until(cancel.cancelled())
            .collect::<Vec<bool>>()
            .await
            .into_iter()
            .filter(|destroyed| *destroyed)
            .count();

        info!(candidates = doomed.len(), destroyed, "Collected volumes");
        Ok(())
    }
}
