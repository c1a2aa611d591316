//! Creating and destroying containers and volumes on workers.
//!
//! The store row is written first and marked created only once the agent
//! confirms, so a crash in between leaves a `creating` row for the
//! collectors rather than an untracked container.

use crate::client::{ContainerSpec, Mount, RootfsSpec, WorkerClient};
use skyway_core::Result;
use skyway_core::ids::{ContainerHandle, TeamId, VolumeHandle};
use skyway_core::ports::{ContainerRepository, VolumeRepository, VolumeRequest};
use skyway_core::worker::{ContainerOwner, ContainerState, Volume, VolumeState, Worker};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ContainerRequest {
    pub owner: ContainerOwner,
    pub rootfs: RootfsSpec,
    pub privileged: bool,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
}

/// Where a volume mounted by [`Provisioner::create_with_mounts`] comes from.
#[derive(Debug, Clone)]
pub enum MountSource {
    /// A fresh empty volume owned by the container.
    Empty,
    /// A container-owned copy of a volume that may live on another worker.
    Copy { worker: Worker, volume: VolumeHandle },
    /// An existing volume mounted as is; the container does not own it.
    Existing(VolumeHandle),
}

#[derive(Debug, Clone)]
pub struct MountRequest {
    pub path: String,
    pub source: MountSource,
}

impl MountRequest {
    pub fn empty(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: MountSource::Empty,
        }
    }
}

pub struct Provisioner {
    client: Arc<dyn WorkerClient>,
    containers: Arc<dyn ContainerRepository>,
    volumes: Arc<dyn VolumeRepository>,
}

impl Provisioner {
    pub fn new(
        client: Arc<dyn WorkerClient>,
        containers: Arc<dyn ContainerRepository>,
        volumes: Arc<dyn VolumeRepository>,
    ) -> Self {
        Self {
            client,
            containers,
            volumes,
        }
    }

    pub fn client(&self) -> &Arc<dyn WorkerClient> {
        &self.client
    }

    /// Reuse the owner's container on `worker` if it was fully created,
    /// otherwise create a new one.
    pub async fn find_or_create_container(&self, worker: &Worker, request: ContainerRequest) -> Result<ContainerHandle> {
        if let Some(existing) = self.containers.find_container(&worker.name, &request.owner).await? {
            if existing.state == ContainerState::Created {
                debug!(handle = %existing.handle, worker = %worker.name, "Reusing container");
                return Ok(existing.handle);
            }
            self.containers.mark_container_destroying(&existing.handle).await?;
        }

        let container = self.containers.create_container(&worker.name, &request.owner).await?;
        let spec = ContainerSpec {
            handle: container.handle.clone(),
            rootfs: request.rootfs,
            privileged: request.privileged,
            env: request.env,
            mounts: request.mounts,
        };
        if let Err(e) = self.client.create_container(worker, &spec).await {
            warn!(handle = %container.handle, worker = %worker.name, error = %e, "Container creation failed");
            self.containers.mark_container_destroying(&container.handle).await?;
            return Err(e);
        }
        self.containers.mark_container_created(&container.handle).await?;
        debug!(handle = %container.handle, worker = %worker.name, "Created container");
        Ok(container.handle)
    }

    /// Create a fresh container for the owner along with the volumes it
    /// mounts. Returns the container and the mounted volume handles in
    /// request order. A leftover container of the same owner, from an
    /// earlier attempt, is handed to the collectors.
    pub async fn create_with_mounts(
        &self,
        worker: &Worker,
        request: ContainerRequest,
        team_id: Option<TeamId>,
        mounts: Vec<MountRequest>,
    ) -> Result<(ContainerHandle, Vec<VolumeHandle>)> {
        if let Some(existing) = self.containers.find_container(&worker.name, &request.owner).await? {
            self.containers.mark_container_destroying(&existing.handle).await?;
        }
        let container = self.containers.create_container(&worker.name, &request.owner).await?;

        match self.mount_volumes(worker, &container.handle, team_id, &mounts).await {
            Ok(handles) => {
                let mut all_mounts = request.mounts;
                all_mounts.extend(mounts.iter().zip(&handles).map(|(m, h)| Mount {
                    volume: h.clone(),
                    path: m.path.clone(),
                }));
                let spec = ContainerSpec {
                    handle: container.handle.clone(),
                    rootfs: request.rootfs,
                    privileged: request.privileged,
                    env: request.env,
                    mounts: all_mounts,
                };
                if let Err(e) = self.client.create_container(worker, &spec).await {
                    warn!(handle = %container.handle, worker = %worker.name, error = %e, "Container creation failed");
                    self.containers.mark_container_destroying(&container.handle).await?;
                    return Err(e);
                }
                self.containers.mark_container_created(&container.handle).await?;
                debug!(handle = %container.handle, worker = %worker.name, mounts = handles.len(), "Created container");
                Ok((container.handle, handles))
            }
            Err(e) => {
                self.containers.mark_container_destroying(&container.handle).await?;
                Err(e)
            }
        }
    }

    async fn mount_volumes(
        &self,
        worker: &Worker,
        container: &ContainerHandle,
        team_id: Option<TeamId>,
        mounts: &[MountRequest],
    ) -> Result<Vec<VolumeHandle>> {
        let mut handles = Vec::with_capacity(mounts.len());
        for mount in mounts {
            let request = VolumeRequest {
                worker_name: worker.name.clone(),
                team_id,
                container_handle: Some(container.clone()),
                path: mount.path.clone(),
                ..VolumeRequest::default()
            };
            let handle = match &mount.source {
                MountSource::Empty => self.create_volume(worker, request).await?.handle,
                MountSource::Copy {
                    worker: source_worker,
                    volume,
                } => self.stage(source_worker, volume, worker, request).await?.handle,
                MountSource::Existing(handle) => handle.clone(),
            };
            handles.push(handle);
        }
        Ok(handles)
    }

    pub async fn destroy_container(&self, worker: &Worker, handle: &ContainerHandle) -> Result<()> {
        self.containers.mark_container_destroying(handle).await?;
        self.client.destroy_container(worker, handle).await?;
        self.containers.delete_container(handle).await
    }

    /// Create a volume on `worker`; `request.worker_name` is overridden.
    pub async fn create_volume(&self, worker: &Worker, request: VolumeRequest) -> Result<Volume> {
        let request = VolumeRequest {
            worker_name: worker.name.clone(),
            ..request
        };
        let mut volume = self.volumes.create_volume(&request).await?;
        if let Err(e) = self
            .client
            .create_volume(worker, &volume.handle, request.parent_handle.as_ref())
            .await
        {
            warn!(handle = %volume.handle, worker = %worker.name, error = %e, "Volume creation failed");
            self.volumes.mark_volume_destroying(&volume.handle).await?;
            return Err(e);
        }
        self.volumes.mark_volume_created(&volume.handle).await?;
        volume.state = VolumeState::Created;
        Ok(volume)
    }

    /// Make `source` available on `target`: a copy-on-write child when it
    /// already lives there, otherwise a fresh volume streamed across.
    pub async fn stage(
        &self,
        source_worker: &Worker,
        source: &VolumeHandle,
        target: &Worker,
        request: VolumeRequest,
    ) -> Result<Volume> {
        if source_worker.name == target.name {
            return self
                .create_volume(
                    target,
                    VolumeRequest {
                        parent_handle: Some(source.clone()),
                        ..request
                    },
                )
                .await;
        }

        let volume = self
            .create_volume(
                target,
                VolumeRequest {
                    parent_handle: None,
                    ..request
                },
            )
            .await?;
        debug!(
            from = %source_worker.name,
            to = %target.name,
            volume = %source,
            "Streaming volume between workers"
        );
        self.client
            .stream_volume(source_worker, source, target, &volume.handle)
            .await?;
        Ok(volume)
    }

    /// Returns false while copy-on-write children still exist.
    pub async fn destroy_volume(&self, worker: &Worker, handle: &VolumeHandle) -> Result<bool> {
        if !self.volumes.mark_volume_destroying(handle).await? {
            return Ok(false);
        }
        self.client.destroy_volume(worker, handle).await?;
        self.volumes.delete_volume(handle).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeWorkerClient;
    use chrono::Utc;
    use skyway_core::ids::{BuildId, PlanId, TeamId};
    use skyway_core::ports::WorkerRepository;
    use skyway_core::worker::WorkerState;
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
            resource_types: vec![],
            ephemeral: false,
            active_tasks: 0,
            start_time: Utc::now(),
            last_heartbeat: Utc::now(),
        }
    }

    fn request() -> ContainerRequest {
        ContainerRequest {
            owner: ContainerOwner::BuildStep {
                build_id: BuildId::new(1),
                plan_id: PlanId::new("task"),
                team_id: TeamId::new(1),
            },
            rootfs: RootfsSpec::Uri {
                uri: "docker:///busybox".to_string(),
            },
            privileged: false,
            env: BTreeMap::new(),
            mounts: vec![],
        }
    }

    async fn setup() -> (Arc<MemoryStore>, Arc<FakeWorkerClient>, Provisioner) {
        let store = Arc::new(MemoryStore::new());
        store.save_worker(&worker("a")).await.unwrap();
        store.save_worker(&worker("b")).await.unwrap();
        let client = Arc::new(FakeWorkerClient::new());
        let provisioner = Provisioner::new(client.clone(), store.clone(), store.clone());
        (store, client, provisioner)
    }

    #[tokio::test]
    async fn test_container_created_once_per_owner() {
        let (store, client, provisioner) = setup().await;
        let first = provisioner.find_or_create_container(&worker("a"), request()).await.unwrap();
        let second = provisioner.find_or_create_container(&worker("a"), request()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(client.live_containers(), 1);

        let rows = store.containers().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, ContainerState::Created);
    }

    #[tokio::test]
    async fn test_destroy_container_removes_row() {
        let (store, client, provisioner) = setup().await;
        let handle = provisioner.find_or_create_container(&worker("a"), request()).await.unwrap();
        provisioner.destroy_container(&worker("a"), &handle).await.unwrap();
        assert!(store.containers().await.unwrap().is_empty());
        assert_eq!(client.destroyed_containers(), vec![handle]);
    }

    #[tokio::test]
    async fn test_stage_cow_on_same_worker_streams_otherwise() {
        let (_store, client, provisioner) = setup().await;
        let source = provisioner
            .create_volume(&worker("a"), VolumeRequest::default())
            .await
            .unwrap();
        assert_eq!(source.state, VolumeState::Created);
        client.put_file(&source.handle, "version", "v1");

        let local = provisioner
            .stage(&worker("a"), &source.handle, &worker("a"), VolumeRequest::default())
            .await
            .unwrap();
        assert_eq!(local.parent_handle.as_ref(), Some(&source.handle));

        let remote = provisioner
            .stage(&worker("a"), &source.handle, &worker("b"), VolumeRequest::default())
            .await
            .unwrap();
        assert_eq!(remote.parent_handle, None);
        assert_eq!(remote.worker_name, "b");
        let copied = client.read_file(&worker("b"), &remote.handle, "version").await.unwrap();
        assert_eq!(copied, b"v1".to_vec());
    }

    #[tokio::test]
    async fn test_create_with_mounts_owns_fresh_and_copied_volumes() {
        let (store, client, provisioner) = setup().await;
        let source = provisioner
            .create_volume(&worker("b"), VolumeRequest::default())
            .await
            .unwrap();
        client.put_file(&source.handle, "src/main.rs", "fn main() {}");
        let cache = provisioner
            .create_volume(&worker("a"), VolumeRequest::default())
            .await
            .unwrap();

        let (handle, volumes) = provisioner
            .create_with_mounts(
                &worker("a"),
                request(),
                Some(TeamId::new(1)),
                vec![
                    MountRequest::empty("/tmp/build/out"),
                    MountRequest {
                        path: "/tmp/build/repo".into(),
                        source: MountSource::Copy {
                            worker: worker("b"),
                            volume: source.handle.clone(),
                        },
                    },
                    MountRequest {
                        path: "/tmp/build/cache".into(),
                        source: MountSource::Existing(cache.handle.clone()),
                    },
                ],
            )
            .await
            .unwrap();

        assert_eq!(volumes.len(), 3);
        assert_eq!(volumes[2], cache.handle);
        let spec = client.container_spec(&handle).unwrap();
        let paths: Vec<_> = spec.mounts.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["/tmp/build/out", "/tmp/build/repo", "/tmp/build/cache"]);

        let copied = store.volume(&volumes[1]).await.unwrap().unwrap();
        assert_eq!(copied.container_handle, Some(handle.clone()));
        assert_eq!(copied.worker_name, "a");
        let contents = client.read_file(&worker("a"), &volumes[1], "src/main.rs").await.unwrap();
        assert_eq!(contents, b"fn main() {}".to_vec());

        // A second attempt replaces the first container.
        let (again, _) = provisioner
            .create_with_mounts(&worker("a"), request(), None, vec![])
            .await
            .unwrap();
        assert_ne!(again, handle);
        let states: Vec<_> = store.containers().await.unwrap().into_iter().map(|c| c.state).collect();
        assert!(states.contains(&ContainerState::Destroying));
    }

    #[tokio::test]
    async fn test_parent_volume_kept_while_children_exist() {
        let (store, _client, provisioner) = setup().await;
        let parent = provisioner
            .create_volume(&worker("a"), VolumeRequest::default())
            .await
            .unwrap();
        let child = provisioner
            .stage(&worker("a"), &parent.handle, &worker("a"), VolumeRequest::default())
            .await
            .unwrap();

        assert!(!provisioner.destroy_volume(&worker("a"), &parent.handle).await.unwrap());
        assert!(provisioner.destroy_volume(&worker("a"), &child.handle).await.unwrap());
        assert!(provisioner.destroy_volume(&worker("a"), &parent.handle).await.unwrap());
        assert!(store.volumes().await.unwrap().is_empty());
    }
}
