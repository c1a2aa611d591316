//! In-process implementation of every store port.
//!
//! Used by `skyway --dev` and as the shared fake in tests. All state lives
//! behind one mutex which is never held across an `.await`; notifications
//! are sent after the guard is dropped.

use crate::bus::MemoryBus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skyway_core::build::{Build, BuildInput, BuildOutput, BuildStatus, rerun_name};
use skyway_core::channels;
use skyway_core::check::{Check, CheckStatus, CheckTarget};
use skyway_core::component::Component;
use skyway_core::events::{Event, EventKey, EventPage, StoredEvent};
use skyway_core::ids::*;
use skyway_core::job::Job;
use skyway_core::pipeline::{Pipeline, PipelineDefinition, Team};
use skyway_core::plan::{CheckPlan, Plan};
use skyway_core::ports::*;
use skyway_core::resource::*;
use skyway_core::worker::*;
use skyway_core::{Error, Result};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

struct LeaseRow {
    owner: String,
    /// `None` once released.
    heartbeat: Option<Instant>,
    ttl: Duration,
}

struct BuildRow {
    build: Build,
    inputs: Vec<BuildInput>,
    outputs: Vec<BuildOutput>,
}

struct EventLog {
    pipeline_id: Option<PipelineId>,
    team_id: TeamId,
    events: Vec<StoredEvent>,
    finalized: bool,
}

struct ConfigRow {
    config: ResourceConfig,
    signature: String,
}

#[derive(Default)]
struct State {
    next_id: i64,
    one_off_seq: i64,
    next_check_order: i64,
    modified: Option<DateTime<Utc>>,
    leases: HashMap<String, LeaseRow>,
    components: HashMap<String, Component>,
    teams: BTreeMap<TeamId, Team>,
    pipelines: BTreeMap<PipelineId, Pipeline>,
    jobs: BTreeMap<JobId, Job>,
    resources: BTreeMap<ResourceId, Resource>,
    resource_types: BTreeMap<ResourceTypeId, ResourceType>,
    builds: BTreeMap<BuildId, BuildRow>,
    events: HashMap<BuildId, EventLog>,
    configs: BTreeMap<ResourceConfigId, ConfigRow>,
    caches: BTreeMap<ResourceCacheId, ResourceCache>,
    cache_uses: HashSet<(CacheUser, ResourceCacheId)>,
    versions: BTreeMap<VersionId, ResourceVersion>,
    disabled: HashSet<(ResourceId, VersionId)>,
    checks: BTreeMap<CheckId, Check>,
    workers: BTreeMap<String, Worker>,
    containers: BTreeMap<ContainerHandle, Container>,
    volumes: BTreeMap<VolumeHandle, Volume>,
    artifacts: BTreeMap<ArtifactId, WorkerArtifact>,
}

impl State {
    fn id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    /// Advance the versions sentinel; strictly increasing even within one
    /// clock tick.
    fn touch(&mut self) {
        let now = Utc::now();
        self.modified = Some(match self.modified {
            Some(prev) if prev >= now => prev + chrono::Duration::microseconds(1),
            _ => now,
        });
    }

    fn build_mut(&mut self, id: BuildId) -> Result<&mut BuildRow> {
        self.builds
            .get_mut(&id)
            .ok_or_else(|| Error::BuildNotFound(id.to_string()))
    }

    fn job_mut(&mut self, id: JobId) -> Result<&mut Job> {
        self.jobs.get_mut(&id).ok_or_else(|| Error::JobNotFound(id.to_string()))
    }

    fn request_schedule(&mut self, job_id: JobId) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.schedule_requested_time = Utc::now();
        }
    }

    fn request_pipeline_schedule(&mut self, pipeline_id: PipelineId) {
        let now = Utc::now();
        for job in self.jobs.values_mut().filter(|j| j.pipeline_id == pipeline_id) {
            job.schedule_requested_time = now;
        }
    }

    fn refresh_job_pointers(&mut self, job_id: JobId) {
        let next = self
            .builds
            .values()
            .filter(|r| r.build.job_id == Some(job_id) && r.build.status == BuildStatus::Pending)
            .map(|r| r.build.id)
            .min();
        let latest = self
            .builds
            .values()
            .filter(|r| {
                r.build.job_id == Some(job_id) && r.build.status.is_terminal() && r.build.rerun_of.is_none()
            })
            .map(|r| r.build.id)
            .max();
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.next_build_id = next;
            job.latest_completed_build_id = latest;
        }
    }

    fn new_build(&mut self, team_id: TeamId, pipeline_id: Option<PipelineId>, job_id: Option<JobId>, name: String) -> Build {
        let id = BuildId::new(self.id());
        Build {
            id,
            name,
            status: BuildStatus::Pending,
            scheduled: false,
            manually_triggered: false,
            inputs_determined: false,
            team_id,
            pipeline_id,
            job_id,
            rerun_of: None,
            rerun_number: 0,
            private_plan: None,
            public_plan: None,
            abort_requested: false,
            interceptible: true,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            reap_time: None,
        }
    }

    fn insert_build(&mut self, build: Build, inputs: Vec<BuildInput>) {
        self.builds.insert(
            build.id,
            BuildRow {
                build,
                inputs,
                outputs: Vec::new(),
            },
        );
    }

    fn build_is_done(&self, id: BuildId) -> bool {
        self.builds.get(&id).is_none_or(|r| r.build.status.is_terminal())
    }

    fn sync_pipeline_children(&mut self, pipeline: &Pipeline) {
        let pid = pipeline.id;
        let team_id = pipeline.team_id;
        let config = &pipeline.config;
        let now = Utc::now();

        let mut keep = HashSet::new();
        for def in &config.resources {
            let existing = self
                .resources
                .values()
                .find(|r| r.pipeline_id == pid && r.name == def.name)
                .cloned();
            let id = match &existing {
                Some(r) => r.id,
                None => ResourceId::new(self.id()),
            };
            let same_config = existing
                .as_ref()
                .filter(|r| r.type_name == def.type_name && r.source == def.source);
            self.resources.insert(
                id,
                Resource {
                    id,
                    pipeline_id: pid,
                    team_id,
                    name: def.name.clone(),
                    type_name: def.type_name.clone(),
                    source: def.source.clone(),
                    check_every: def.check_every,
                    check_timeout: def.check_timeout,
                    tags: def.tags.clone(),
                    pinned_version: def.version.clone(),
                    webhook_token: def.webhook_token.clone(),
                    icon: def.icon.clone(),
                    paused: existing.as_ref().is_some_and(|r| r.paused),
                    public: def.public,
                    check_error: same_config.and_then(|r| r.check_error.clone()),
                    resource_config_id: same_config.and_then(|r| r.resource_config_id),
                },
            );
            keep.insert(id);
        }
        self.resources.retain(|id, r| r.pipeline_id != pid || keep.contains(id));

        let mut keep = HashSet::new();
        for def in &config.resource_types {
            let existing = self
                .resource_types
                .values()
                .find(|r| r.pipeline_id == pid && r.name == def.name)
                .cloned();
            let id = match &existing {
                Some(r) => r.id,
                None => ResourceTypeId::new(self.id()),
            };
            let same_config = existing
                .as_ref()
                .filter(|r| r.type_name == def.type_name && r.source == def.source);
            self.resource_types.insert(
                id,
                ResourceType {
                    id,
                    pipeline_id: pid,
                    team_id,
                    name: def.name.clone(),
                    type_name: def.type_name.clone(),
                    source: def.source.clone(),
                    params: def.params.clone(),
                    privileged: def.privileged,
                    check_every: def.check_every,
                    tags: def.tags.clone(),
                    check_error: same_config.and_then(|r| r.check_error.clone()),
                    resource_config_id: same_config.and_then(|r| r.resource_config_id),
                },
            );
            keep.insert(id);
        }
        self.resource_types.retain(|id, r| r.pipeline_id != pid || keep.contains(id));

        let mut keep = HashSet::new();
        for def in &config.jobs {
            let existing = self
                .jobs
                .values()
                .find(|j| j.pipeline_id == pid && j.name == def.name)
                .cloned();
            let id = match &existing {
                Some(j) => j.id,
                None => JobId::new(self.id()),
            };
            self.jobs.insert(
                id,
                Job {
                    id,
                    pipeline_id: pid,
                    team_id,
                    name: def.name.clone(),
                    config: def.clone(),
                    paused: existing.as_ref().is_some_and(|j| j.paused),
                    build_number_seq: existing.as_ref().map_or(0, |j| j.build_number_seq),
                    schedule_requested_time: now,
                    next_build_id: existing.as_ref().and_then(|j| j.next_build_id),
                    latest_completed_build_id: existing.as_ref().and_then(|j| j.latest_completed_build_id),
                },
            );
            keep.insert(id);
        }
        self.jobs.retain(|id, j| j.pipeline_id != pid || keep.contains(id));
    }

    fn delete_pipeline_rows(&mut self, id: PipelineId) {
        self.pipelines.remove(&id);
        self.jobs.retain(|_, j| j.pipeline_id != id);
        self.resources.retain(|_, r| r.pipeline_id != id);
        self.resource_types.retain(|_, r| r.pipeline_id != id);
        self.builds.retain(|_, r| r.build.pipeline_id != Some(id));
        self.events.retain(|_, log| log.pipeline_id != Some(id));
    }
}

/// In-memory store implementing every port in `skyway_core::ports`.
pub struct MemoryStore {
    state: Mutex<State>,
    bus: Arc<dyn NotificationBus>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_bus(Arc::new(MemoryBus::new()))
    }

    pub fn with_bus(bus: Arc<dyn NotificationBus>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            bus,
        }
    }

    /// The bus this store notifies on.
    pub fn bus(&self) -> Arc<dyn NotificationBus> {
        self.bus.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Test helper: backdate a build's end time.
    pub fn set_build_end_time(&self, id: BuildId, at: DateTime<Utc>) {
        if let Some(row) = self.lock().builds.get_mut(&id) {
            row.build.end_time = Some(at);
        }
    }

    /// Test helper: backdate an artifact's creation.
    pub fn set_artifact_created_at(&self, id: ArtifactId, at: DateTime<Utc>) {
        if let Some(artifact) = self.lock().artifacts.get_mut(&id) {
            artifact.created_at = at;
        }
    }

    /// Test helper: backdate a worker's heartbeat.
    pub fn set_worker_heartbeat(&self, name: &str, at: DateTime<Utc>) {
        if let Some(worker) = self.lock().workers.get_mut(name) {
            worker.last_heartbeat = at;
        }
    }

    /// Test helper: backdate a component's last run.
    pub fn set_component_last_run(&self, name: &str, at: Option<DateTime<Utc>>) {
        if let Some(component) = self.lock().components.get_mut(name) {
            component.last_run = at;
        }
    }
}

#[async_trait]
impl LeaseRepository for MemoryStore {
    async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let mut st = self.lock();
        let now = Instant::now();
        let free = match st.leases.get(name) {
            None => true,
            Some(row) => row.heartbeat.is_none_or(|hb| now.duration_since(hb) > row.ttl),
        };
        if free {
            st.leases.insert(
                name.to_string(),
                LeaseRow {
                    owner: owner.to_string(),
                    heartbeat: Some(now),
                    ttl,
                },
            );
        }
        Ok(free)
    }

    async fn heartbeat(&self, name: &str, owner: &str) -> Result<bool> {
        let mut st = self.lock();
        match st.leases.get_mut(name) {
            Some(row) if row.owner == owner && row.heartbeat.is_some() => {
                row.heartbeat = Some(Instant::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, owner: &str) -> Result<()> {
        let mut st = self.lock();
        if let Some(row) = st.leases.get_mut(name)
            && row.owner == owner
        {
            row.heartbeat = None;
        }
        Ok(())
    }
}

#[async_trait]
impl ComponentRepository for MemoryStore {
    async fn register(&self, name: &str, interval: Duration) -> Result<Component> {
        let mut st = self.lock();
        Ok(st
            .components
            .entry(name.to_string())
            .or_insert_with(|| Component {
                name: name.to_string(),
                interval,
                paused: false,
                last_run: None,
            })
            .clone())
    }

    async fn get(&self, name: &str) -> Result<Option<Component>> {
        Ok(self.lock().components.get(name).cloned())
    }

    async fn update_last_run(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(c) = self.lock().components.get_mut(name) {
            c.last_run = Some(at);
        }
        Ok(())
    }

    async fn set_paused(&self, name: &str, paused: bool) -> Result<()> {
        if let Some(c) = self.lock().components.get_mut(name) {
            c.paused = paused;
        }
        Ok(())
    }

    async fn set_interval(&self, name: &str, interval: Duration) -> Result<()> {
        if let Some(c) = self.lock().components.get_mut(name) {
            c.interval = interval;
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn initialize(&self, build: &Build) -> Result<()> {
        self.lock().events.entry(build.id).or_insert_with(|| EventLog {
            pipeline_id: build.pipeline_id,
            team_id: build.team_id,
            events: Vec::new(),
            finalized: false,
        });
        Ok(())
    }

    async fn put(&self, build: &Build, events: Vec<Event>) -> Result<EventKey> {
        let messages = events.iter().map(Event::to_message).collect::<Result<Vec<_>>>()?;
        let key = {
            let mut st = self.lock();
            let log = st.events.entry(build.id).or_insert_with(|| EventLog {
                pipeline_id: build.pipeline_id,
                team_id: build.team_id,
                events: Vec::new(),
                finalized: false,
            });
            if log.finalized {
                return Err(Error::EventStreamFinalized(build.id.get()));
            }
            let mut next = log.events.len() as i64;
            let mut key = EventKey::from_event_id(next - 1);
            for message in messages {
                key = EventKey::from_event_id(next);
                log.events.push(StoredEvent {
                    event_id: next,
                    key: key.clone(),
                    message,
                });
                next += 1;
            }
            key
        };
        self.bus.notify(&channels::build_events(build.id)).await?;
        Ok(key)
    }

    async fn get(&self, build: &Build, cursor: Option<&EventKey>, max: usize) -> Result<EventPage> {
        let st = self.lock();
        let Some(log) = st.events.get(&build.id) else {
            // Reaped: nothing more will ever arrive.
            return Ok(EventPage {
                events: Vec::new(),
                next: cursor.cloned(),
                finalized: true,
            });
        };
        let start = match cursor {
            Some(key) => key
                .to_event_id()
                .ok_or_else(|| Error::Serialization("malformed event key".to_string()))?
                + 1,
            None => 0,
        };
        let events: Vec<StoredEvent> = log
            .events
            .iter()
            .skip(start.max(0) as usize)
            .take(max)
            .cloned()
            .collect();
        let next = events.last().map(|e| e.key.clone()).or_else(|| cursor.cloned());
        Ok(EventPage {
            events,
            next,
            finalized: log.finalized,
        })
    }

    async fn finalize(&self, build: &Build) -> Result<()> {
        if let Some(log) = self.lock().events.get_mut(&build.id) {
            log.finalized = true;
        }
        self.bus.notify(&channels::build_events(build.id)).await?;
        Ok(())
    }

    async fn delete(&self, builds: &[Build]) -> Result<()> {
        {
            let mut st = self.lock();
            for build in builds {
                st.events.remove(&build.id);
            }
        }
        for build in builds {
            self.bus.notify(&channels::build_events(build.id)).await?;
        }
        Ok(())
    }

    async fn delete_pipeline(&self, pipeline_id: PipelineId) -> Result<()> {
        self.lock().events.retain(|_, log| log.pipeline_id != Some(pipeline_id));
        Ok(())
    }

    async fn delete_team(&self, team_id: TeamId) -> Result<()> {
        self.lock().events.retain(|_, log| log.team_id != team_id);
        Ok(())
    }

    fn compare_keys(&self, a: &EventKey, b: &EventKey) -> Ordering {
        a.to_event_id().cmp(&b.to_event_id())
    }
}

#[async_trait]
impl TeamRepository for MemoryStore {
    async fn create_team(&self, name: &str) -> Result<Team> {
        let mut st = self.lock();
        if st.teams.values().any(|t| t.name == name) {
            return Err(Error::UniqueViolation(format!("team '{name}' exists")));
        }
        let team = Team {
            id: TeamId::new(st.id()),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        st.teams.insert(team.id, team.clone());
        Ok(team)
    }

    async fn find_team(&self, name: &str) -> Result<Option<Team>> {
        Ok(self.lock().teams.values().find(|t| t.name == name).cloned())
    }

    async fn team(&self, id: TeamId) -> Result<Option<Team>> {
        Ok(self.lock().teams.get(&id).cloned())
    }

    async fn delete_team(&self, id: TeamId) -> Result<()> {
        let mut st = self.lock();
        let pipelines: Vec<PipelineId> = st.pipelines.values().filter(|p| p.team_id == id).map(|p| p.id).collect();
        for pipeline in pipelines {
            st.delete_pipeline_rows(pipeline);
        }
        st.builds.retain(|_, r| r.build.team_id != id);
        st.events.retain(|_, log| log.team_id != id);
        st.teams.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl PipelineRepository for MemoryStore {
    async fn save_pipeline(
        &self,
        team_id: TeamId,
        name: &str,
        config: &PipelineDefinition,
        expected: Option<ConfigVersion>,
        paused: bool,
    ) -> Result<SavedPipeline> {
        let mut st = self.lock();
        if !st.teams.contains_key(&team_id) {
            return Err(Error::TeamNotFound(team_id.to_string()));
        }
        let existing = st
            .pipelines
            .values()
            .find(|p| p.team_id == team_id && p.name == name)
            .map(|p| (p.id, p.config_version));
        if let Some(expected) = expected {
            let found = existing.map_or(0, |(_, v)| v.get());
            if found != expected.get() {
                return Err(Error::ConfigVersionConflict {
                    expected: expected.get(),
                    found,
                });
            }
        }

        let (pipeline, created) = match existing {
            Some((id, version)) => {
                let p = st
                    .pipelines
                    .get_mut(&id)
                    .ok_or_else(|| Error::PipelineNotFound(id.to_string()))?;
                p.config = config.clone();
                p.config_version = version.next();
                p.archived = false;
                (p.clone(), false)
            }
            None => {
                let p = Pipeline {
                    id: PipelineId::new(st.id()),
                    team_id,
                    name: name.to_string(),
                    config_version: ConfigVersion::new(1),
                    config: config.clone(),
                    paused,
                    archived: false,
                    public: false,
                    last_scheduled: None,
                    created_at: Utc::now(),
                };
                st.pipelines.insert(p.id, p.clone());
                (p, true)
            }
        };
        st.sync_pipeline_children(&pipeline);
        st.touch();
        debug!(pipeline = %pipeline.name, version = %pipeline.config_version, created, "Pipeline saved");
        Ok(SavedPipeline { pipeline, created })
    }

    async fn pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        Ok(self.lock().pipelines.get(&id).cloned())
    }

    async fn find_pipeline(&self, team_id: TeamId, name: &str) -> Result<Option<Pipeline>> {
        Ok(self
            .lock()
            .pipelines
            .values()
            .find(|p| p.team_id == team_id && p.name == name)
            .cloned())
    }

    async fn pipelines(&self) -> Result<Vec<Pipeline>> {
        Ok(self.lock().pipelines.values().cloned().collect())
    }

    async fn pipelines_requesting_schedule(&self) -> Result<Vec<(Pipeline, DateTime<Utc>)>> {
        let st = self.lock();
        Ok(st
            .pipelines
            .values()
            .filter(|p| p.is_active())
            .filter_map(|p| {
                let newest = st
                    .jobs
                    .values()
                    .filter(|j| j.pipeline_id == p.id)
                    .map(|j| j.schedule_requested_time)
                    .max()?;
                match p.last_scheduled {
                    Some(last) if newest <= last => None,
                    _ => Some((p.clone(), newest)),
                }
            })
            .collect())
    }

    async fn update_last_scheduled(&self, id: PipelineId, at: DateTime<Utc>) -> Result<()> {
        if let Some(p) = self.lock().pipelines.get_mut(&id) {
            p.last_scheduled = Some(p.last_scheduled.map_or(at, |prev| prev.max(at)));
        }
        Ok(())
    }

    async fn set_pipeline_paused(&self, id: PipelineId, paused: bool) -> Result<()> {
        {
            let mut st = self.lock();
            let p = st
                .pipelines
                .get_mut(&id)
                .ok_or_else(|| Error::PipelineNotFound(id.to_string()))?;
            p.paused = paused;
            if !paused {
                st.request_pipeline_schedule(id);
            }
        }
        self.bus.notify(&channels::pipeline_paused(id)).await
    }

    async fn archive_pipeline(&self, id: PipelineId) -> Result<()> {
        let mut st = self.lock();
        if let Some(p) = st.pipelines.get_mut(&id) {
            p.archived = true;
            p.paused = true;
        }
        Ok(())
    }

    async fn delete_pipeline(&self, id: PipelineId) -> Result<()> {
        self.lock().delete_pipeline_rows(id);
        Ok(())
    }

    async fn jobs(&self, pipeline_id: PipelineId) -> Result<Vec<Job>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| j.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.lock().jobs.get(&id).cloned())
    }

    async fn set_job_paused(&self, id: JobId, paused: bool) -> Result<()> {
        let mut st = self.lock();
        st.job_mut(id)?.paused = paused;
        if !paused {
            st.request_schedule(id);
        }
        Ok(())
    }

    async fn request_schedule(&self, job_id: JobId) -> Result<()> {
        self.lock().request_schedule(job_id);
        Ok(())
    }

    async fn request_schedule_for_config(&self, config_id: ResourceConfigId) -> Result<()> {
        let mut st = self.lock();
        let readers: Vec<(PipelineId, String)> = st
            .resources
            .values()
            .filter(|r| r.resource_config_id == Some(config_id))
            .map(|r| (r.pipeline_id, r.name.clone()))
            .collect();
        let jobs: Vec<JobId> = st
            .jobs
            .values()
            .filter(|j| {
                readers.iter().any(|(pid, name)| {
                    j.pipeline_id == *pid && j.config.inputs().iter().any(|i| &i.resource == name)
                })
            })
            .map(|j| j.id)
            .collect();
        for job in jobs {
            st.request_schedule(job);
        }
        Ok(())
    }

    async fn resources(&self, pipeline_id: PipelineId) -> Result<Vec<Resource>> {
        Ok(self
            .lock()
            .resources
            .values()
            .filter(|r| r.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn resource(&self, id: ResourceId) -> Result<Option<Resource>> {
        Ok(self.lock().resources.get(&id).cloned())
    }

    async fn resource_types(&self, pipeline_id: PipelineId) -> Result<Vec<ResourceType>> {
        Ok(self
            .lock()
            .resource_types
            .values()
            .filter(|r| r.pipeline_id == pipeline_id)
            .cloned()
            .collect())
    }

    async fn resource_type(&self, id: ResourceTypeId) -> Result<Option<ResourceType>> {
        Ok(self.lock().resource_types.get(&id).cloned())
    }

    async fn active_resources(&self) -> Result<Vec<Resource>> {
        let st = self.lock();
        Ok(st
            .resources
            .values()
            .filter(|r| st.pipelines.get(&r.pipeline_id).is_some_and(Pipeline::is_active))
            .cloned()
            .collect())
    }

    async fn active_resource_types(&self) -> Result<Vec<ResourceType>> {
        let st = self.lock();
        Ok(st
            .resource_types
            .values()
            .filter(|r| st.pipelines.get(&r.pipeline_id).is_some_and(Pipeline::is_active))
            .cloned()
            .collect())
    }

    async fn set_resource_config(&self, target: CheckTarget, config_id: ResourceConfigId) -> Result<()> {
        let mut st = self.lock();
        match target {
            CheckTarget::Resource(id) => {
                if let Some(r) = st.resources.get_mut(&id) {
                    r.resource_config_id = Some(config_id);
                }
            }
            CheckTarget::ResourceType(id) => {
                if let Some(r) = st.resource_types.get_mut(&id) {
                    r.resource_config_id = Some(config_id);
                }
            }
        }
        st.touch();
        Ok(())
    }

    async fn set_check_error(&self, target: CheckTarget, error: Option<String>) -> Result<()> {
        let mut st = self.lock();
        match target {
            CheckTarget::Resource(id) => {
                if let Some(r) = st.resources.get_mut(&id) {
                    r.check_error = error;
                }
            }
            CheckTarget::ResourceType(id) => {
                if let Some(r) = st.resource_types.get_mut(&id) {
                    r.check_error = error;
                }
            }
        }
        Ok(())
    }

    async fn pin_resource_version(&self, id: ResourceId, version: Option<Version>) -> Result<()> {
        let mut st = self.lock();
        let resource = st
            .resources
            .get_mut(&id)
            .ok_or_else(|| Error::ResourceNotFound(id.to_string()))?;
        resource.pinned_version = version;
        let pipeline_id = resource.pipeline_id;
        st.touch();
        st.request_pipeline_schedule(pipeline_id);
        Ok(())
    }
}

#[async_trait]
impl ResourceConfigRepository for MemoryStore {
    async fn find_or_create_config(&self, descriptor: &ResourceConfigDescriptor) -> Result<ResourceConfig> {
        let signature = descriptor.signature();
        let mut st = self.lock();
        if let Some(row) = st.configs.values().find(|row| row.signature == signature) {
            return Ok(row.config.clone());
        }
        let config = ResourceConfig {
            id: ResourceConfigId::new(st.id()),
            type_name: descriptor.type_name.clone(),
            source_hash: signature.clone(),
            last_check_start_time: None,
            last_check_end_time: None,
            last_check_succeeded: false,
            created_at: Utc::now(),
        };
        st.configs.insert(
            config.id,
            ConfigRow {
                config: config.clone(),
                signature,
            },
        );
        Ok(config)
    }

    async fn config(&self, id: ResourceConfigId) -> Result<Option<ResourceConfig>> {
        Ok(self.lock().configs.get(&id).map(|row| row.config.clone()))
    }

    async fn update_last_check(
        &self,
        id: ResourceConfigId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        succeeded: bool,
    ) -> Result<()> {
        if let Some(row) = self.lock().configs.get_mut(&id) {
            row.config.last_check_start_time = Some(start);
            row.config.last_check_end_time = Some(end);
            row.config.last_check_succeeded = succeeded;
        }
        Ok(())
    }

    async fn find_or_create_cache(
        &self,
        user: CacheUser,
        config_id: ResourceConfigId,
        descriptor: &ResourceCacheDescriptor,
    ) -> Result<ResourceCache> {
        let signature = descriptor.signature();
        let mut st = self.lock();
        let cache = match st.caches.values().find(|c| c.signature == signature) {
            Some(c) => c.clone(),
            None => {
                let cache = ResourceCache {
                    id: ResourceCacheId::new(st.id()),
                    resource_config_id: config_id,
                    version: descriptor.version.clone(),
                    params_hash: signature_of_params(&descriptor.params),
                    signature,
                    created_at: Utc::now(),
                };
                st.caches.insert(cache.id, cache.clone());
                cache
            }
        };
        st.cache_uses.insert((user, cache.id));
        Ok(cache)
    }

    async fn cache(&self, id: ResourceCacheId) -> Result<Option<ResourceCache>> {
        Ok(self.lock().caches.get(&id).cloned())
    }

    async fn release_finished_cache_uses(&self) -> Result<usize> {
        let mut st = self.lock();
        let now = Utc::now();
        let live_sessions: HashSet<ResourceConfigId> = st
            .containers
            .values()
            .filter_map(|c| match &c.owner {
                Some(ContainerOwner::CheckSession {
                    resource_config_id,
                    expires_at,
                }) if *expires_at > now => Some(*resource_config_id),
                _ => None,
            })
            .collect();
        let finished: Vec<(CacheUser, ResourceCacheId)> = st
            .cache_uses
            .iter()
            .filter(|(user, _)| match user {
                CacheUser::Build(id) => st.build_is_done(*id),
                CacheUser::Container(config) => !live_sessions.contains(config),
            })
            .copied()
            .collect();
        for used in &finished {
            st.cache_uses.remove(used);
        }
        Ok(finished.len())
    }

    async fn delete_unused_caches(&self, grace: Duration) -> Result<usize> {
        let mut st = self.lock();
        let cutoff = Utc::now() - chrono::Duration::from_std(grace).unwrap_or_default();
        let in_use: HashSet<ResourceCacheId> = st.cache_uses.iter().map(|(_, id)| *id).collect();
        let doomed: HashSet<ResourceCacheId> = st
            .caches
            .iter()
            .filter(|(id, c)| !in_use.contains(id) && c.created_at <= cutoff)
            .map(|(id, _)| *id)
            .collect();
        st.caches.retain(|id, _| !doomed.contains(id));
        for volume in st.volumes.values_mut() {
            if matches!(volume.association, Some(VolumeAssociation::ResourceCache { cache_id }) if doomed.contains(&cache_id)) {
                volume.association = None;
            }
        }
        Ok(doomed.len())
    }

    async fn delete_unused_configs(&self, grace: Duration) -> Result<usize> {
        let mut st = self.lock();
        let cutoff = Utc::now() - chrono::Duration::from_std(grace).unwrap_or_default();
        let mut referenced: HashSet<ResourceConfigId> = st.resources.values().filter_map(|r| r.resource_config_id).collect();
        referenced.extend(st.resource_types.values().filter_map(|r| r.resource_config_id));
        referenced.extend(st.caches.values().map(|c| c.resource_config_id));
        referenced.extend(st.checks.values().filter(|c| c.status == CheckStatus::Started).map(|c| c.resource_config_id));
        let doomed: Vec<ResourceConfigId> = st
            .configs
            .values()
            .filter(|row| !referenced.contains(&row.config.id) && row.config.created_at <= cutoff)
            .map(|row| row.config.id)
            .collect();
        for id in &doomed {
            st.configs.remove(id);
        }
        st.versions.retain(|_, v| !doomed.contains(&v.resource_config_id));
        if !doomed.is_empty() {
            st.touch();
        }
        Ok(doomed.len())
    }
}

fn signature_of_params(params: &Params) -> String {
    signature(&serde_json::Value::Object(params.clone()))
}

#[async_trait]
impl VersionRepository for MemoryStore {
    async fn save_versions(&self, config_id: ResourceConfigId, versions: &[Version]) -> Result<Vec<ResourceVersion>> {
        let mut st = self.lock();
        let mut saved = Vec::with_capacity(versions.len());
        let mut inserted = false;
        for version in versions {
            let existing = st
                .versions
                .values()
                .find(|v| v.resource_config_id == config_id && &v.version == version)
                .cloned();
            match existing {
                Some(row) => saved.push(row),
                None => {
                    st.next_check_order += 1;
                    let row = ResourceVersion {
                        id: VersionId::new(st.id()),
                        resource_config_id: config_id,
                        version: version.clone(),
                        metadata: Vec::new(),
                        check_order: st.next_check_order,
                    };
                    st.versions.insert(row.id, row.clone());
                    saved.push(row);
                    inserted = true;
                }
            }
        }
        if inserted {
            st.touch();
        }
        Ok(saved)
    }

    async fn latest_version(&self, config_id: ResourceConfigId) -> Result<Option<ResourceVersion>> {
        Ok(self
            .lock()
            .versions
            .values()
            .filter(|v| v.resource_config_id == config_id)
            .max_by_key(|v| v.check_order)
            .cloned())
    }

    async fn find_version(&self, config_id: ResourceConfigId, version: &Version) -> Result<Option<ResourceVersion>> {
        Ok(self
            .lock()
            .versions
            .values()
            .find(|v| v.resource_config_id == config_id && &v.version == version)
            .cloned())
    }

    async fn version(&self, id: VersionId) -> Result<Option<ResourceVersion>> {
        Ok(self.lock().versions.get(&id).cloned())
    }

    async fn update_metadata(&self, config_id: ResourceConfigId, version: &Version, metadata: &[MetadataField]) -> Result<()> {
        let mut st = self.lock();
        if let Some(row) = st
            .versions
            .values_mut()
            .find(|v| v.resource_config_id == config_id && &v.version == version)
        {
            row.metadata = metadata.to_vec();
        }
        Ok(())
    }

    async fn set_version_enabled(&self, resource_id: ResourceId, version_id: VersionId, enabled: bool) -> Result<()> {
        let mut st = self.lock();
        if enabled {
            st.disabled.remove(&(resource_id, version_id));
        } else {
            st.disabled.insert((resource_id, version_id));
        }
        st.touch();
        Ok(())
    }

    async fn is_version_enabled(&self, resource_id: ResourceId, version_id: VersionId) -> Result<bool> {
        Ok(!self.lock().disabled.contains(&(resource_id, version_id)))
    }

    async fn versions_modified_at(&self, _pipeline_id: PipelineId) -> Result<DateTime<Utc>> {
        let mut st = self.lock();
        if st.modified.is_none() {
            st.touch();
        }
        Ok(st.modified.unwrap_or_else(Utc::now))
    }

    async fn versions_snapshot(&self, pipeline_id: PipelineId, row_limit: usize) -> Result<VersionsSnapshot> {
        let st = self.lock();
        let mut snapshot = VersionsSnapshot {
            cached_at: st.modified,
            ..Default::default()
        };

        for resource in st.resources.values().filter(|r| r.pipeline_id == pipeline_id) {
            let Some(config_id) = resource.resource_config_id else {
                snapshot.resource_versions.insert(resource.id, Vec::new());
                continue;
            };
            let mut versions: Vec<ResourceVersion> = st
                .versions
                .values()
                .filter(|v| v.resource_config_id == config_id && !st.disabled.contains(&(resource.id, v.id)))
                .cloned()
                .collect();
            versions.sort_by(|a, b| b.check_order.cmp(&a.check_order));
            snapshot.resource_versions.insert(resource.id, versions);
        }

        for job in st.jobs.values().filter(|j| j.pipeline_id == pipeline_id) {
            let mut builds: Vec<&BuildRow> = st
                .builds
                .values()
                .filter(|r| r.build.job_id == Some(job.id) && r.build.status == BuildStatus::Succeeded)
                .collect();
            builds.sort_by(|a, b| b.build.id.cmp(&a.build.id));
            let successful = builds
                .into_iter()
                .take(row_limit.max(1))
                .map(|row| {
                    let mut versions: HashMap<ResourceId, Vec<VersionId>> = HashMap::new();
                    for input in &row.inputs {
                        versions.entry(input.resource_id).or_default().push(input.version_id);
                    }
                    for output in &row.outputs {
                        versions.entry(output.resource_id).or_default().push(output.version_id);
                    }
                    BuildVersions {
                        build_id: row.build.id,
                        versions,
                    }
                })
                .collect();
            snapshot.successful_builds.insert(job.id, successful);

            let last_inputs = st
                .builds
                .values()
                .filter(|r| r.build.job_id == Some(job.id) && !r.inputs.is_empty())
                .max_by_key(|r| r.build.id)
                .map(|r| r.inputs.clone())
                .unwrap_or_default();
            snapshot.last_inputs.insert(job.id, last_inputs);
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl BuildRepository for MemoryStore {
    async fn build(&self, id: BuildId) -> Result<Option<Build>> {
        Ok(self.lock().builds.get(&id).map(|r| r.build.clone()))
    }

    async fn pending_builds(&self, job_id: JobId) -> Result<Vec<Build>> {
        Ok(self
            .lock()
            .builds
            .values()
            .filter(|r| r.build.job_id == Some(job_id) && r.build.status == BuildStatus::Pending)
            .map(|r| r.build.clone())
            .collect())
    }

    async fn job_builds(&self, job_id: JobId) -> Result<Vec<Build>> {
        Ok(self
            .lock()
            .builds
            .values()
            .rev()
            .filter(|r| r.build.job_id == Some(job_id))
            .map(|r| r.build.clone())
            .collect())
    }

    async fn builds_to_track(&self) -> Result<Vec<Build>> {
        Ok(self
            .lock()
            .builds
            .values()
            .filter(|r| r.build.is_in_flight())
            .map(|r| r.build.clone())
            .collect())
    }

    async fn count_in_flight(&self, pipeline_id: PipelineId, serial_groups: &[String]) -> Result<usize> {
        let st = self.lock();
        Ok(st
            .builds
            .values()
            .filter(|r| r.build.pipeline_id == Some(pipeline_id) && r.build.is_in_flight())
            .filter(|r| {
                r.build
                    .job_id
                    .and_then(|id| st.jobs.get(&id))
                    .is_some_and(|job| job.shares_serial_group(serial_groups))
            })
            .count())
    }

    async fn schedule_build(&self, id: BuildId, inputs: &[BuildInput], plan: &Plan) -> Result<bool> {
        let mut st = self.lock();
        let (job_id, schedulable) = {
            let row = st.build_mut(id)?;
            (
                row.build.job_id,
                row.build.status == BuildStatus::Pending && !row.build.scheduled,
            )
        };
        if !schedulable {
            return Ok(false);
        }
        let inputs: Vec<BuildInput> = inputs
            .iter()
            .map(|input| {
                let seen = st.builds.values().any(|r| {
                    r.build.id != id
                        && r.build.job_id == job_id
                        && r.inputs.iter().any(|i| i.name == input.name && i.version_id == input.version_id)
                });
                BuildInput {
                    first_occurrence: !seen,
                    ..input.clone()
                }
            })
            .collect();
        let row = st.build_mut(id)?;
        row.build.scheduled = true;
        row.build.inputs_determined = true;
        row.build.public_plan = Some(plan.public());
        row.build.private_plan = Some(plan.clone());
        row.inputs = inputs;
        Ok(true)
    }

    async fn start_build(&self, id: BuildId) -> Result<bool> {
        {
            let mut st = self.lock();
            let row = st.build_mut(id)?;
            if row.build.status != BuildStatus::Pending || !row.build.scheduled {
                return Ok(false);
            }
            row.build.status = BuildStatus::Started;
            row.build.start_time = Some(Utc::now());
            if let Some(job_id) = row.build.job_id {
                st.refresh_job_pointers(job_id);
            }
        }
        self.bus.notify(channels::BUILD_STARTED).await?;
        Ok(true)
    }

    async fn finish_build(&self, id: BuildId, status: BuildStatus) -> Result<()> {
        let mut st = self.lock();
        let row = st.build_mut(id)?;
        if row.build.status.is_terminal() {
            return Ok(());
        }
        row.build.status = status;
        row.build.end_time = Some(Utc::now());
        let (job_id, pipeline_id) = (row.build.job_id, row.build.pipeline_id);
        if let Some(job_id) = job_id {
            st.refresh_job_pointers(job_id);
        }
        if let Some(pipeline_id) = pipeline_id {
            st.request_pipeline_schedule(pipeline_id);
        }
        st.touch();
        Ok(())
    }

    async fn request_abort(&self, id: BuildId) -> Result<()> {
        {
            let mut st = self.lock();
            let row = st.build_mut(id)?;
            row.build.abort_requested = true;
            // Nothing is driving a pending build; abort it in place.
            if row.build.status == BuildStatus::Pending {
                row.build.status = BuildStatus::Aborted;
                row.build.end_time = Some(Utc::now());
                if let Some(job_id) = row.build.job_id {
                    st.refresh_job_pointers(job_id);
                }
            }
        }
        self.bus.notify(&channels::build_abort(id)).await
    }

    async fn inputs(&self, id: BuildId) -> Result<Vec<BuildInput>> {
        Ok(self.lock().builds.get(&id).map(|r| r.inputs.clone()).unwrap_or_default())
    }

    async fn outputs(&self, id: BuildId) -> Result<Vec<BuildOutput>> {
        Ok(self.lock().builds.get(&id).map(|r| r.outputs.clone()).unwrap_or_default())
    }

    async fn save_output(&self, id: BuildId, resource_id: ResourceId, version_id: VersionId) -> Result<()> {
        let mut st = self.lock();
        let version = st
            .versions
            .get(&version_id)
            .map(|v| v.version.clone())
            .ok_or(Error::VersionNotAvailable)?;
        let row = st.build_mut(id)?;
        if !row.outputs.iter().any(|o| o.resource_id == resource_id && o.version_id == version_id) {
            row.outputs.push(BuildOutput {
                resource_id,
                version_id,
                version,
            });
        }
        st.touch();
        Ok(())
    }

    async fn latest_inputs(&self, job_id: JobId) -> Result<Vec<BuildInput>> {
        Ok(self
            .lock()
            .builds
            .values()
            .rev()
            .find(|r| r.build.job_id == Some(job_id) && !r.inputs.is_empty())
            .map(|r| r.inputs.clone())
            .unwrap_or_default())
    }

    async fn interceptible_finished_builds(&self) -> Result<Vec<Build>> {
        Ok(self
            .lock()
            .builds
            .values()
            .filter(|r| r.build.interceptible && r.build.status.is_terminal())
            .map(|r| r.build.clone())
            .collect())
    }

    async fn set_interceptible(&self, id: BuildId, interceptible: bool) -> Result<()> {
        self.lock().build_mut(id)?.build.interceptible = interceptible;
        Ok(())
    }

    async fn reapable_builds(&self, job_id: JobId) -> Result<Vec<Build>> {
        Ok(self
            .lock()
            .builds
            .values()
            .rev()
            .filter(|r| r.build.job_id == Some(job_id) && r.build.status.is_terminal() && r.build.reap_time.is_none())
            .map(|r| r.build.clone())
            .collect())
    }

    async fn mark_reaped(&self, ids: &[BuildId]) -> Result<()> {
        let mut st = self.lock();
        let now = Utc::now();
        for id in ids {
            if let Some(row) = st.builds.get_mut(id) {
                row.build.reap_time = Some(now);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BuildCreator for MemoryStore {
    async fn create_started_build(&self, team_id: TeamId, pipeline_id: Option<PipelineId>, plan: &Plan) -> Result<Build> {
        plan.validate()?;
        let build = {
            let mut st = self.lock();
            st.one_off_seq += 1;
            let name = st.one_off_seq.to_string();
            let mut build = st.new_build(team_id, pipeline_id, None, name);
            build.status = BuildStatus::Started;
            build.scheduled = true;
            build.inputs_determined = true;
            build.manually_triggered = true;
            build.start_time = Some(Utc::now());
            build.public_plan = Some(plan.public());
            build.private_plan = Some(plan.clone());
            st.insert_build(build.clone(), Vec::new());
            build
        };
        EventStore::initialize(self, &build).await?;
        EventStore::put(self, &build, vec![Event::status(BuildStatus::Started)]).await?;
        self.bus.notify(channels::BUILD_STARTED).await?;
        Ok(build)
    }

    async fn create_build(&self, job: &Job) -> Result<Build> {
        let build = {
            let mut st = self.lock();
            let stored = st.job_mut(job.id)?;
            stored.build_number_seq += 1;
            let name = stored.build_number_seq.to_string();
            let mut build = st.new_build(job.team_id, Some(job.pipeline_id), Some(job.id), name);
            build.manually_triggered = true;
            st.insert_build(build.clone(), Vec::new());
            st.refresh_job_pointers(job.id);
            st.request_schedule(job.id);
            build
        };
        EventStore::initialize(self, &build).await?;
        Ok(build)
    }

    async fn rerun_build(&self, job: &Job, source: &Build) -> Result<Build> {
        let build = {
            let mut st = self.lock();
            let original_id = source.rerun_of.unwrap_or(source.id);
            let original = st
                .builds
                .get(&original_id)
                .ok_or_else(|| Error::BuildNotFound(original_id.to_string()))?;
            let original_name = original.build.name.clone();
            let inputs = st.builds.get(&source.id).map(|r| r.inputs.clone()).unwrap_or_default();
            let n = 1 + st
                .builds
                .values()
                .filter(|r| r.build.rerun_of == Some(original_id))
                .count() as i32;
            let mut build = st.new_build(job.team_id, Some(job.pipeline_id), Some(job.id), rerun_name(&original_name, n));
            build.rerun_of = Some(original_id);
            build.rerun_number = n;
            build.inputs_determined = !inputs.is_empty();
            st.insert_build(build.clone(), inputs);
            st.refresh_job_pointers(job.id);
            st.request_schedule(job.id);
            build
        };
        EventStore::initialize(self, &build).await?;
        Ok(build)
    }

    async fn ensure_pending_build_exists(&self, job: &Job) -> Result<Option<Build>> {
        let build = {
            let mut st = self.lock();
            // Any pending build counts, scheduled or rerun alike.
            let exists = st
                .builds
                .values()
                .any(|r| r.build.job_id == Some(job.id) && r.build.status == BuildStatus::Pending);
            if exists {
                return Ok(None);
            }
            let stored = st.job_mut(job.id)?;
            stored.build_number_seq += 1;
            let name = stored.build_number_seq.to_string();
            let build = st.new_build(job.team_id, Some(job.pipeline_id), Some(job.id), name);
            st.insert_build(build.clone(), Vec::new());
            st.refresh_job_pointers(job.id);
            build
        };
        EventStore::initialize(self, &build).await?;
        Ok(Some(build))
    }
}

#[async_trait]
impl CheckRepository for MemoryStore {
    async fn create_check(&self, config_id: ResourceConfigId, target: CheckTarget, plan: &CheckPlan) -> Result<Option<Check>> {
        let mut st = self.lock();
        if st
            .checks
            .values()
            .any(|c| c.resource_config_id == config_id && c.status == CheckStatus::Started)
        {
            return Ok(None);
        }
        let check = Check {
            id: CheckId::new(st.id()),
            resource_config_id: config_id,
            target,
            from_version: plan.from_version.clone(),
            plan: plan.clone(),
            status: CheckStatus::Started,
            check_error: None,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
        };
        st.checks.insert(check.id, check.clone());
        Ok(Some(check))
    }

    async fn pending_checks(&self, limit: usize) -> Result<Vec<Check>> {
        Ok(self
            .lock()
            .checks
            .values()
            .filter(|c| c.status == CheckStatus::Started && !c.is_claimed())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim_check(&self, id: CheckId) -> Result<bool> {
        let mut st = self.lock();
        match st.checks.get_mut(&id) {
            Some(check) if !check.is_claimed() && check.status == CheckStatus::Started => {
                check.start_time = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_check(&self, id: CheckId, status: CheckStatus, error: Option<String>) -> Result<()> {
        if let Some(check) = self.lock().checks.get_mut(&id) {
            check.status = status;
            check.check_error = error;
            check.end_time = Some(Utc::now());
        }
        Ok(())
    }

    async fn delete_check(&self, id: CheckId) -> Result<()> {
        self.lock().checks.remove(&id);
        Ok(())
    }

    async fn expire_checks(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut st = self.lock();
        let now = Utc::now();
        let mut expired = 0;
        for check in st
            .checks
            .values_mut()
            .filter(|c| c.status == CheckStatus::Started && c.create_time < cutoff)
        {
            check.status = CheckStatus::Errored;
            check.check_error = Some("timeout exceeded".to_string());
            check.end_time = Some(now);
            expired += 1;
        }
        Ok(expired)
    }

    async fn delete_checks_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut st = self.lock();
        let before = st.checks.len();
        st.checks
            .retain(|_, c| c.status == CheckStatus::Started || c.end_time.is_none_or(|end| end >= cutoff));
        Ok(before - st.checks.len())
    }
}

#[async_trait]
impl WorkerRepository for MemoryStore {
    async fn save_worker(&self, worker: &Worker) -> Result<()> {
        {
            let mut st = self.lock();
            let mut worker = worker.clone();
            worker.last_heartbeat = Utc::now();
            // Re-registration keeps the count of tasks builds hold on it.
            if let Some(existing) = st.workers.get(&worker.name) {
                worker.active_tasks = existing.active_tasks;
            }
            st.workers.insert(worker.name.clone(), worker);
        }
        self.bus.notify(channels::WORKER_STATE_CHANGED).await
    }

    async fn heartbeat_worker(&self, name: &str) -> Result<()> {
        let revived = {
            let mut st = self.lock();
            let worker = st
                .workers
                .get_mut(name)
                .ok_or_else(|| Error::WorkerNotFound(name.to_string()))?;
            worker.last_heartbeat = Utc::now();
            if worker.state == WorkerState::Stalled {
                worker.state = WorkerState::Running;
                true
            } else {
                false
            }
        };
        if revived {
            self.bus.notify(channels::WORKER_STATE_CHANGED).await?;
        }
        Ok(())
    }

    async fn workers(&self) -> Result<Vec<Worker>> {
        Ok(self.lock().workers.values().cloned().collect())
    }

    async fn worker(&self, name: &str) -> Result<Option<Worker>> {
        Ok(self.lock().workers.get(name).cloned())
    }

    async fn set_worker_state(&self, name: &str, state: WorkerState) -> Result<()> {
        {
            let mut st = self.lock();
            let worker = st
                .workers
                .get_mut(name)
                .ok_or_else(|| Error::WorkerNotFound(name.to_string()))?;
            worker.state = worker.state.transition(state)?;
        }
        self.bus.notify(channels::WORKER_STATE_CHANGED).await
    }

    async fn delete_worker(&self, name: &str) -> Result<()> {
        {
            let mut st = self.lock();
            st.workers.remove(name);
            st.containers.retain(|_, c| c.worker_name != name);
            st.volumes.retain(|_, v| v.worker_name != name);
        }
        self.bus.notify(channels::WORKER_STATE_CHANGED).await
    }

    async fn increase_active_tasks(&self, name: &str) -> Result<i32> {
        let mut st = self.lock();
        let worker = st
            .workers
            .get_mut(name)
            .ok_or_else(|| Error::WorkerNotFound(name.to_string()))?;
        worker.active_tasks += 1;
        Ok(worker.active_tasks)
    }

    async fn decrease_active_tasks(&self, name: &str) -> Result<i32> {
        let active = {
            let mut st = self.lock();
            let worker = st
                .workers
                .get_mut(name)
                .ok_or_else(|| Error::WorkerNotFound(name.to_string()))?;
            worker.active_tasks = (worker.active_tasks - 1).max(0);
            worker.active_tasks
        };
        self.bus.notify(channels::WORKER_STATE_CHANGED).await?;
        Ok(active)
    }
}

#[async_trait]
impl ContainerRepository for MemoryStore {
    async fn create_container(&self, worker_name: &str, owner: &ContainerOwner) -> Result<Container> {
        let mut st = self.lock();
        if !st.workers.contains_key(worker_name) {
            return Err(Error::WorkerNotFound(worker_name.to_string()));
        }
        let container = Container {
            handle: ContainerHandle::generate(),
            worker_name: worker_name.to_string(),
            owner: Some(owner.clone()),
            state: ContainerState::Creating,
            hijacked: false,
            last_hijack: None,
            created_at: Utc::now(),
        };
        st.containers.insert(container.handle.clone(), container.clone());
        Ok(container)
    }

    async fn find_container(&self, worker_name: &str, owner: &ContainerOwner) -> Result<Option<Container>> {
        Ok(self
            .lock()
            .containers
            .values()
            .find(|c| c.worker_name == worker_name && c.owner.as_ref() == Some(owner))
            .cloned())
    }

    async fn find_check_container(&self, config_id: ResourceConfigId) -> Result<Option<Container>> {
        let now = Utc::now();
        Ok(self
            .lock()
            .containers
            .values()
            .find(|c| {
                c.state == ContainerState::Created
                    && matches!(&c.owner, Some(ContainerOwner::CheckSession { resource_config_id, expires_at })
                        if *resource_config_id == config_id && *expires_at > now)
            })
            .cloned())
    }

    async fn mark_container_created(&self, handle: &ContainerHandle) -> Result<()> {
        if let Some(c) = self.lock().containers.get_mut(handle) {
            c.state = ContainerState::Created;
        }
        Ok(())
    }

    async fn mark_container_destroying(&self, handle: &ContainerHandle) -> Result<()> {
        if let Some(c) = self.lock().containers.get_mut(handle) {
            c.state = ContainerState::Destroying;
        }
        Ok(())
    }

    async fn mark_hijacked(&self, handle: &ContainerHandle) -> Result<()> {
        if let Some(c) = self.lock().containers.get_mut(handle) {
            c.hijacked = true;
            c.last_hijack = Some(Utc::now());
        }
        Ok(())
    }

    async fn delete_container(&self, handle: &ContainerHandle) -> Result<()> {
        {
            let mut st = self.lock();
            st.containers.remove(handle);
            for volume in st.volumes.values_mut().filter(|v| v.container_handle.as_ref() == Some(handle)) {
                volume.container_handle = None;
            }
        }
        self.bus.notify(channels::WORKER_STATE_CHANGED).await
    }

    async fn containers(&self) -> Result<Vec<Container>> {
        Ok(self.lock().containers.values().cloned().collect())
    }

    async fn expire_check_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut st = self.lock();
        let mut expired = 0;
        for container in st.containers.values_mut() {
            if matches!(&container.owner, Some(ContainerOwner::CheckSession { expires_at, .. }) if *expires_at <= now) {
                container.owner = None;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn release_finished_build_containers(&self, cutoff: DateTime<Utc>, hijack_cutoff: DateTime<Utc>) -> Result<usize> {
        let mut st = self.lock();
        let finished: HashMap<BuildId, Option<DateTime<Utc>>> = st
            .builds
            .values()
            .filter(|r| r.build.status.is_terminal())
            .map(|r| (r.build.id, r.build.end_time))
            .collect();
        let known: HashSet<BuildId> = st.builds.keys().copied().collect();
        let mut released = 0;
        for container in st.containers.values_mut() {
            let Some(build_id) = container.owner.as_ref().and_then(ContainerOwner::build_id) else {
                continue;
            };
            let done = match finished.get(&build_id) {
                Some(end) => end.is_none_or(|end| end < cutoff),
                None => !known.contains(&build_id),
            };
            let hijack_expired = !container.hijacked || container.last_hijack.is_none_or(|at| at < hijack_cutoff);
            if done && hijack_expired {
                container.owner = None;
                released += 1;
            }
        }
        Ok(released)
    }
}

#[async_trait]
impl VolumeRepository for MemoryStore {
    async fn create_volume(&self, request: &VolumeRequest) -> Result<Volume> {
        let mut st = self.lock();
        let volume = Volume {
            handle: VolumeHandle::generate(),
            worker_name: request.worker_name.clone(),
            team_id: request.team_id,
            state: VolumeState::Creating,
            association: request.association.clone(),
            container_handle: request.container_handle.clone(),
            parent_handle: request.parent_handle.clone(),
            path: request.path.clone(),
            created_at: Utc::now(),
        };
        st.volumes.insert(volume.handle.clone(), volume.clone());
        Ok(volume)
    }

    async fn mark_volume_created(&self, handle: &VolumeHandle) -> Result<()> {
        if let Some(v) = self.lock().volumes.get_mut(handle) {
            v.state = VolumeState::Created;
        }
        Ok(())
    }

    async fn set_volume_association(&self, handle: &VolumeHandle, association: Option<VolumeAssociation>) -> Result<()> {
        if let Some(v) = self.lock().volumes.get_mut(handle) {
            v.association = association;
        }
        Ok(())
    }

    async fn volume(&self, handle: &VolumeHandle) -> Result<Option<Volume>> {
        Ok(self.lock().volumes.get(handle).cloned())
    }

    async fn find_cache_volume(&self, worker_name: &str, cache_id: ResourceCacheId) -> Result<Option<Volume>> {
        Ok(self
            .lock()
            .volumes
            .values()
            .find(|v| {
                v.worker_name == worker_name
                    && v.state == VolumeState::Created
                    && v.association == Some(VolumeAssociation::ResourceCache { cache_id })
            })
            .cloned())
    }

    async fn find_task_cache_volume(&self, worker_name: &str, job_id: JobId, step_name: &str, path: &str) -> Result<Option<Volume>> {
        Ok(self
            .lock()
            .volumes
            .values()
            .find(|v| {
                v.worker_name == worker_name
                    && v.state == VolumeState::Created
                    && matches!(&v.association, Some(VolumeAssociation::TaskCache { job_id: j, step_name: s, path: p })
                        if *j == job_id && s == step_name && p == path)
            })
            .cloned())
    }

    async fn volumes(&self) -> Result<Vec<Volume>> {
        Ok(self.lock().volumes.values().cloned().collect())
    }

    async fn mark_volume_destroying(&self, handle: &VolumeHandle) -> Result<bool> {
        let mut st = self.lock();
        let has_children = st
            .volumes
            .values()
            .any(|v| v.parent_handle.as_ref() == Some(handle) && v.state != VolumeState::Destroyed);
        if has_children {
            return Ok(false);
        }
        match st.volumes.get_mut(handle) {
            Some(v) => {
                v.state = VolumeState::Destroying;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_volume(&self, handle: &VolumeHandle) -> Result<()> {
        self.lock().volumes.remove(handle);
        self.bus.notify(channels::WORKER_STATE_CHANGED).await
    }
}

#[async_trait]
impl ArtifactRepository for MemoryStore {
    async fn create_artifact(&self, name: &str, build_id: Option<BuildId>, worker_name: Option<&str>) -> Result<WorkerArtifact> {
        let mut st = self.lock();
        let artifact = WorkerArtifact {
            id: ArtifactId::new(st.id()),
            name: name.to_string(),
            build_id,
            worker_name: worker_name.map(str::to_string),
            association: None,
            initialized: false,
            created_at: Utc::now(),
        };
        st.artifacts.insert(artifact.id, artifact.clone());
        Ok(artifact)
    }

    async fn initialize_artifact(&self, id: ArtifactId, association: Option<ArtifactAssociation>) -> Result<()> {
        if let Some(a) = self.lock().artifacts.get_mut(&id) {
            a.initialized = true;
            a.association = association;
        }
        Ok(())
    }

    async fn artifacts(&self) -> Result<Vec<WorkerArtifact>> {
        Ok(self.lock().artifacts.values().cloned().collect())
    }

    async fn remove_expired_artifacts(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut st = self.lock();
        let before = st.artifacts.len();
        st.artifacts.retain(|_, a| a.initialized || a.created_at >= cutoff);
        Ok(before - st.artifacts.len())
    }

    async fn remove_orphaned_artifacts(&self) -> Result<usize> {
        let mut st = self.lock();
        let done: HashSet<BuildId> = st
            .artifacts
            .values()
            .filter_map(|a| a.build_id)
            .filter(|id| st.build_is_done(*id))
            .collect();
        for artifact in st.artifacts.values_mut() {
            if artifact.build_id.is_some_and(|id| done.contains(&id)) {
                artifact.build_id = None;
            }
        }
        let reachable: HashSet<String> = st
            .workers
            .values()
            .filter(|w| w.state.is_reachable())
            .map(|w| w.name.clone())
            .collect();
        let before = st.artifacts.len();
        st.artifacts.retain(|_, a| {
            let orphan = a.initialized && a.build_id.is_none() && a.association.is_none();
            let on_live_worker = a.worker_name.as_ref().is_none_or(|w| reachable.contains(w));
            !(orphan && on_live_worker)
        });
        Ok(before - st.artifacts.len())
    }
}
