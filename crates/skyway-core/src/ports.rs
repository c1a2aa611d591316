//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the control-plane components
//! and their adapters: the Postgres store, the in-memory store, the NATS
//! bus and the event store plugin.

use crate::build::{Build, BuildInput, BuildOutput, BuildStatus};
use crate::check::{Check, CheckStatus, CheckTarget};
use crate::component::Component;
use crate::events::{Event, EventKey, EventPage};
use crate::ids::*;
use crate::job::Job;
use crate::pipeline::{Pipeline, PipelineDefinition, Team};
use crate::plan::{CheckPlan, Plan};
use crate::resource::*;
use crate::worker::*;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

/// Payload-less "something happened" signals.
pub type NotificationStream = Pin<Box<dyn Stream<Item = ()> + Send>>;

/// Named pub/sub channels with at-least-once delivery.
#[async_trait]
pub trait NotificationBus: Send + Sync {
    async fn notify(&self, channel: &str) -> Result<()>;

    /// Start listening. Signals sent after this returns are observed.
    async fn listen(&self, channel: &str) -> Result<NotificationStream>;
}

/// Rows backing cooperative leases.
#[async_trait]
pub trait LeaseRepository: Send + Sync {
    /// Claim `name` for `owner` if no holder heartbeated within `ttl`.
    async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool>;

    /// Re-stamp the heartbeat; false if `owner` no longer holds the lease.
    async fn heartbeat(&self, name: &str, owner: &str) -> Result<bool>;

    /// Reset the heartbeat to a sentinel so the lease can be taken at once.
    async fn release(&self, name: &str, owner: &str) -> Result<()>;
}

#[async_trait]
pub trait ComponentRepository: Send + Sync {
    /// Insert the component with `interval` unless it already exists.
    async fn register(&self, name: &str, interval: Duration) -> Result<Component>;

    async fn get(&self, name: &str) -> Result<Option<Component>>;

    async fn update_last_run(&self, name: &str, at: DateTime<Utc>) -> Result<()>;

    async fn set_paused(&self, name: &str, paused: bool) -> Result<()>;

    async fn set_interval(&self, name: &str, interval: Duration) -> Result<()>;
}

/// Per-build append-only event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// One-time setup (tables, plugin handshake).
    async fn setup(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Seed the build's event sequence.
    async fn initialize(&self, build: &Build) -> Result<()>;

    /// Append a group of events atomically and notify subscribers.
    async fn put(&self, build: &Build, events: Vec<Event>) -> Result<EventKey>;

    /// Read up to `max` events strictly after `cursor` (from the start when
    /// `None`).
    async fn get(&self, build: &Build, cursor: Option<&EventKey>, max: usize) -> Result<EventPage>;

    async fn finalize(&self, build: &Build) -> Result<()>;

    async fn delete(&self, builds: &[Build]) -> Result<()>;

    async fn delete_pipeline(&self, pipeline_id: PipelineId) -> Result<()>;

    async fn delete_team(&self, team_id: TeamId) -> Result<()>;

    /// Total order of keys issued for one build.
    fn compare_keys(&self, a: &EventKey, b: &EventKey) -> Ordering;
}

/// Result of saving a pipeline config.
#[derive(Debug, Clone)]
pub struct SavedPipeline {
    pub pipeline: Pipeline,
    pub created: bool,
}

#[async_trait]
pub trait TeamRepository: Send + Sync {
    async fn create_team(&self, name: &str) -> Result<Team>;

    async fn find_team(&self, name: &str) -> Result<Option<Team>>;

    async fn team(&self, id: TeamId) -> Result<Option<Team>>;

    async fn delete_team(&self, id: TeamId) -> Result<()>;
}

#[async_trait]
pub trait PipelineRepository: Send + Sync {
    /// Upsert a pipeline and its resources, types and jobs. With `expected`
    /// set, fails with `ConfigVersionConflict` unless the stored version
    /// matches.
    async fn save_pipeline(
        &self,
        team_id: TeamId,
        name: &str,
        config: &PipelineDefinition,
        expected: Option<ConfigVersion>,
        paused: bool,
    ) -> Result<SavedPipeline>;

    async fn pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>>;

    async fn find_pipeline(&self, team_id: TeamId, name: &str) -> Result<Option<Pipeline>>;

    async fn pipelines(&self) -> Result<Vec<Pipeline>>;

    /// Pipelines with a job whose schedule request is newer than the
    /// pipeline's last scheduling pass, paired with the newest request time.
    async fn pipelines_requesting_schedule(&self) -> Result<Vec<(Pipeline, DateTime<Utc>)>>;

    async fn update_last_scheduled(&self, id: PipelineId, at: DateTime<Utc>) -> Result<()>;

    async fn set_pipeline_paused(&self, id: PipelineId, paused: bool) -> Result<()>;

    async fn archive_pipeline(&self, id: PipelineId) -> Result<()>;

    async fn delete_pipeline(&self, id: PipelineId) -> Result<()>;

    async fn jobs(&self, pipeline_id: PipelineId) -> Result<Vec<Job>>;

    async fn job(&self, id: JobId) -> Result<Option<Job>>;

    async fn set_job_paused(&self, id: JobId, paused: bool) -> Result<()>;

    async fn request_schedule(&self, job_id: JobId) -> Result<()>;

    /// Request scheduling for every job that reads a resource on `config_id`.
    async fn request_schedule_for_config(&self, config_id: ResourceConfigId) -> Result<()>;

    async fn resources(&self, pipeline_id: PipelineId) -> Result<Vec<Resource>>;

    async fn resource(&self, id: ResourceId) -> Result<Option<Resource>>;

    async fn resource_types(&self, pipeline_id: PipelineId) -> Result<Vec<ResourceType>>;

    async fn resource_type(&self, id: ResourceTypeId) -> Result<Option<ResourceType>>;

    /// Resources of unpaused, unarchived pipelines.
    async fn active_resources(&self) -> Result<Vec<Resource>>;

    async fn active_resource_types(&self) -> Result<Vec<ResourceType>>;

    async fn set_resource_config(&self, target: CheckTarget, config_id: ResourceConfigId) -> Result<()>;

    async fn set_check_error(&self, target: CheckTarget, error: Option<String>) -> Result<()>;

    async fn pin_resource_version(&self, id: ResourceId, version: Option<Version>) -> Result<()>;
}

#[async_trait]
pub trait ResourceConfigRepository: Send + Sync {
    async fn find_or_create_config(&self, descriptor: &ResourceConfigDescriptor) -> Result<ResourceConfig>;

    async fn config(&self, id: ResourceConfigId) -> Result<Option<ResourceConfig>>;

    async fn update_last_check(
        &self,
        id: ResourceConfigId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        succeeded: bool,
    ) -> Result<()>;

    async fn find_or_create_cache(
        &self,
        user: CacheUser,
        config_id: ResourceConfigId,
        descriptor: &ResourceCacheDescriptor,
    ) -> Result<ResourceCache>;

    async fn cache(&self, id: ResourceCacheId) -> Result<Option<ResourceCache>>;

    /// Drop uses held by terminal builds and expired check sessions.
    async fn release_finished_cache_uses(&self) -> Result<usize>;

    /// Delete caches with no uses older than `grace`; volumes holding them
    /// lose their association.
    async fn delete_unused_caches(&self, grace: Duration) -> Result<usize>;

    /// Delete configs no resource, type or cache refers to, older than `grace`.
    async fn delete_unused_configs(&self, grace: Duration) -> Result<usize>;
}

/// Everything the input algorithm needs, as of one store snapshot.
#[derive(Debug, Clone, Default)]
pub struct VersionsSnapshot {
    pub cached_at: Option<DateTime<Utc>>,
    /// Enabled versions per resource, newest first.
    pub resource_versions: HashMap<ResourceId, Vec<ResourceVersion>>,
    /// Successful builds per job, newest first and at most the row limit,
    /// with every version they consumed or produced.
    pub successful_builds: HashMap<JobId, Vec<BuildVersions>>,
    /// Inputs of each job's most recent build that determined them.
    pub last_inputs: HashMap<JobId, Vec<BuildInput>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildVersions {
    pub build_id: BuildId,
    pub versions: HashMap<ResourceId, Vec<VersionId>>,
}

#[async_trait]
pub trait VersionRepository: Send + Sync {
    /// Insert versions in order; existing versions keep their position.
    async fn save_versions(
        &self,
        config_id: ResourceConfigId,
        versions: &[Version],
    ) -> Result<Vec<ResourceVersion>>;

    async fn latest_version(&self, config_id: ResourceConfigId) -> Result<Option<ResourceVersion>>;

    async fn find_version(
        &self,
        config_id: ResourceConfigId,
        version: &Version,
    ) -> Result<Option<ResourceVersion>>;

    async fn version(&self, id: VersionId) -> Result<Option<ResourceVersion>>;

    async fn update_metadata(
        &self,
        config_id: ResourceConfigId,
        version: &Version,
        metadata: &[MetadataField],
    ) -> Result<()>;

    async fn set_version_enabled(&self, resource_id: ResourceId, version_id: VersionId, enabled: bool) -> Result<()>;

    async fn is_version_enabled(&self, resource_id: ResourceId, version_id: VersionId) -> Result<bool>;

    /// Max modified time across the tables the algorithm reads.
    async fn versions_modified_at(&self, pipeline_id: PipelineId) -> Result<DateTime<Utc>>;

    async fn versions_snapshot(&self, pipeline_id: PipelineId, row_limit: usize) -> Result<VersionsSnapshot>;
}

#[async_trait]
pub trait BuildRepository: Send + Sync {
    async fn build(&self, id: BuildId) -> Result<Option<Build>>;

    /// Pending builds of a job, oldest first.
    async fn pending_builds(&self, job_id: JobId) -> Result<Vec<Build>>;

    async fn job_builds(&self, job_id: JobId) -> Result<Vec<Build>>;

    /// Started builds plus scheduled pending ones.
    async fn builds_to_track(&self) -> Result<Vec<Build>>;

    /// Builds of the pipeline that are in flight for any of `serial_groups`.
    async fn count_in_flight(&self, pipeline_id: PipelineId, serial_groups: &[String]) -> Result<usize>;

    /// Mark a pending build scheduled with its inputs and plan. False if the
    /// build is no longer pending or already scheduled.
    async fn schedule_build(&self, id: BuildId, inputs: &[BuildInput], plan: &Plan) -> Result<bool>;

    /// Move a scheduled pending build to started.
    async fn start_build(&self, id: BuildId) -> Result<bool>;

    async fn finish_build(&self, id: BuildId, status: BuildStatus) -> Result<()>;

    async fn request_abort(&self, id: BuildId) -> Result<()>;

    async fn inputs(&self, id: BuildId) -> Result<Vec<BuildInput>>;

    async fn outputs(&self, id: BuildId) -> Result<Vec<BuildOutput>>;

    async fn save_output(&self, id: BuildId, resource_id: ResourceId, version_id: VersionId) -> Result<()>;

    /// Inputs of the job's most recent build that has inputs.
    async fn latest_inputs(&self, job_id: JobId) -> Result<Vec<BuildInput>>;

    /// Terminal builds still marked interceptible.
    async fn interceptible_finished_builds(&self) -> Result<Vec<Build>>;

    async fn set_interceptible(&self, id: BuildId, interceptible: bool) -> Result<()>;

    /// Terminal, unreaped builds of a job, newest first.
    async fn reapable_builds(&self, job_id: JobId) -> Result<Vec<Build>>;

    async fn mark_reaped(&self, ids: &[BuildId]) -> Result<()>;
}

/// Transactional creation of builds (§ build creator).
#[async_trait]
pub trait BuildCreator: Send + Sync {
    async fn create_started_build(&self, team_id: TeamId, pipeline_id: Option<PipelineId>, plan: &Plan) -> Result<Build>;

    async fn create_build(&self, job: &Job) -> Result<Build>;

    async fn rerun_build(&self, job: &Job, source: &Build) -> Result<Build>;

    /// Insert a pending build unless one already exists. Returns the new
    /// build, or `None` when one was already pending.
    async fn ensure_pending_build_exists(&self, job: &Job) -> Result<Option<Build>>;
}

#[async_trait]
pub trait CheckRepository: Send + Sync {
    /// Insert a check unless a started one exists for the config.
    async fn create_check(
        &self,
        config_id: ResourceConfigId,
        target: CheckTarget,
        plan: &CheckPlan,
    ) -> Result<Option<Check>>;

    /// Unclaimed checks, oldest first.
    async fn pending_checks(&self, limit: usize) -> Result<Vec<Check>>;

    /// Stamp `start_time`; false if another checker got there first.
    async fn claim_check(&self, id: CheckId) -> Result<bool>;

    async fn finish_check(&self, id: CheckId, status: CheckStatus, error: Option<String>) -> Result<()>;

    async fn delete_check(&self, id: CheckId) -> Result<()>;

    /// Mark claimed checks started before `cutoff` as errored.
    async fn expire_checks(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Delete finished checks that ended before `cutoff`.
    async fn delete_checks_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// Register or refresh a worker; stamps its heartbeat.
    async fn save_worker(&self, worker: &Worker) -> Result<()>;

    async fn heartbeat_worker(&self, name: &str) -> Result<()>;

    async fn workers(&self) -> Result<Vec<Worker>>;

    async fn worker(&self, name: &str) -> Result<Option<Worker>>;

    async fn set_worker_state(&self, name: &str, state: WorkerState) -> Result<()>;

    async fn delete_worker(&self, name: &str) -> Result<()>;

    /// Count one more task running on the worker; returns the new count.
    async fn increase_active_tasks(&self, name: &str) -> Result<i32>;

    /// Count one task fewer, never going below zero, and wake anyone waiting
    /// for a worker. Returns the new count.
    async fn decrease_active_tasks(&self, name: &str) -> Result<i32>;
}

#[async_trait]
pub trait ContainerRepository: Send + Sync {
    async fn create_container(&self, worker_name: &str, owner: &ContainerOwner) -> Result<Container>;

    async fn find_container(&self, worker_name: &str, owner: &ContainerOwner) -> Result<Option<Container>>;

    /// Containers owned by a check session for the config, on any worker.
    async fn find_check_container(&self, config_id: ResourceConfigId) -> Result<Option<Container>>;

    async fn mark_container_created(&self, handle: &ContainerHandle) -> Result<()>;

    async fn mark_container_destroying(&self, handle: &ContainerHandle) -> Result<()>;

    async fn mark_hijacked(&self, handle: &ContainerHandle) -> Result<()>;

    async fn delete_container(&self, handle: &ContainerHandle) -> Result<()>;

    async fn containers(&self) -> Result<Vec<Container>>;

    /// Clear the owner of check-session containers whose session expired.
    async fn expire_check_sessions(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Clear the owner of containers whose build finished before `cutoff`.
    async fn release_finished_build_containers(&self, cutoff: DateTime<Utc>, hijack_cutoff: DateTime<Utc>) -> Result<usize>;
}

#[derive(Debug, Clone, Default)]
pub struct VolumeRequest {
    pub worker_name: String,
    pub team_id: Option<TeamId>,
    pub association: Option<VolumeAssociation>,
    pub container_handle: Option<ContainerHandle>,
    pub parent_handle: Option<VolumeHandle>,
    pub path: String,
}

#[async_trait]
pub trait VolumeRepository: Send + Sync {
    async fn create_volume(&self, request: &VolumeRequest) -> Result<Volume>;

    async fn mark_volume_created(&self, handle: &VolumeHandle) -> Result<()>;

    async fn set_volume_association(&self, handle: &VolumeHandle, association: Option<VolumeAssociation>) -> Result<()>;

    async fn volume(&self, handle: &VolumeHandle) -> Result<Option<Volume>>;

    async fn find_cache_volume(&self, worker_name: &str, cache_id: ResourceCacheId) -> Result<Option<Volume>>;

    async fn find_task_cache_volume(&self, worker_name: &str, job_id: JobId, step_name: &str, path: &str) -> Result<Option<Volume>>;

    async fn volumes(&self) -> Result<Vec<Volume>>;

    /// False while a copy-on-write child of the volume is not destroyed.
    async fn mark_volume_destroying(&self, handle: &VolumeHandle) -> Result<bool>;

    async fn delete_volume(&self, handle: &VolumeHandle) -> Result<()>;
}

#[async_trait]
pub trait ArtifactRepository: Send + Sync {
    /// A fresh, uninitialized artifact.
    async fn create_artifact(&self, name: &str, build_id: Option<BuildId>, worker_name: Option<&str>) -> Result<WorkerArtifact>;

    async fn initialize_artifact(&self, id: ArtifactId, association: Option<ArtifactAssociation>) -> Result<()>;

    async fn artifacts(&self) -> Result<Vec<WorkerArtifact>>;

    /// Delete uninitialized artifacts created before `cutoff`.
    async fn remove_expired_artifacts(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Detach artifacts from terminated builds, then delete initialized
    /// artifacts with no build and no association on reachable workers.
    async fn remove_orphaned_artifacts(&self) -> Result<usize>;
}

/// Symmetric encryption for data at rest (plans, credentials).
pub trait EncryptionStrategy: Send + Sync {
    /// Returns ciphertext and nonce; `None` nonce means plaintext.
    fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Option<Vec<u8>>)>;

    fn decrypt(&self, ciphertext: &[u8], nonce: Option<&[u8]>) -> Result<Vec<u8>>;
}
