//! An in-memory control plane for scenario tests.

use anyhow::{Context, bail};
use chrono::Utc;
use skyway_component::LeaseManager;
use skyway_core::build::{Build, BuildStatus};
use skyway_core::check::CheckTarget;
use skyway_core::config::CoreConfig;
use skyway_core::events::{Event, LogPayload, Origin};
use skyway_core::ids::{BuildId, PlanId};
use skyway_core::job::Job;
use skyway_core::pipeline::{Pipeline, PipelineDefinition, Team};
use skyway_core::ports::*;
use skyway_core::resource::{Resource, ResourceConfigDescriptor, ResourceVersion, Version};
use skyway_core::vars::StaticVariables;
use skyway_core::worker::{Worker, WorkerResourceType, WorkerState};
use skyway_db::MemoryStore;
use skyway_engine::{Engine, EngineConfig, EngineContext, Tracker};
use skyway_gc::GcContext;
use skyway_scheduler::Scheduler;
use skyway_worker::{FakeWorkerClient, Pool, Provisioner};
use std::sync::Arc;
use std::time::Duration;

const WAIT_STEP: Duration = Duration::from_millis(5);
const WAIT_LIMIT: Duration = Duration::from_secs(30);

/// One node's worth of components over a shared [`MemoryStore`], with a
/// single running worker `w1` whose processes are scripted through
/// [`FakeWorkerClient`].
pub struct System {
    pub store: Arc<MemoryStore>,
    pub client: Arc<FakeWorkerClient>,
    pub ctx: Arc<EngineContext>,
    pub leases: Arc<LeaseManager>,
    pub team: Team,
    pub config: CoreConfig,
}

/// A running worker offering the `git` and `registry-image` base types.
pub fn worker(name: &str) -> Worker {
    let base = |type_name: &str| WorkerResourceType {
        type_name: type_name.to_string(),
        image: format!("/usr/local/skyway/resource-types/{type_name}/rootfs"),
        version: "1.0".to_string(),
        privileged: false,
    };
    Worker {
        name: name.to_string(),
        state: WorkerState::Running,
        platform: "linux".to_string(),
        tags: vec![],
        team_id: None,
        garden_addr: format!("{name}:7777"),
        baggageclaim_url: format!("http://{name}:7788"),
        version: "2.5".to_string(),
        resource_types: vec![base("git"), base("registry-image")],
        ephemeral: false,
        active_tasks: 0,
        start_time: Utc::now(),
        last_heartbeat: Utc::now(),
    }
}

/// A task step running `path` in a busybox rootfs, as pipeline JSON.
pub fn task_step(name: &str, path: &str) -> serde_json::Value {
    serde_json::json!({
        "task": {
            "name": name,
            "config": {
                "rootfs_uri": "docker:///busybox",
                "run": {"path": path}
            }
        }
    })
}

pub fn log(text: &str) -> Event {
    Event::Log(LogPayload {
        origin: Origin::stdout(PlanId::new("1")),
        time: Utc::now(),
        payload: text.to_string(),
    })
}

impl System {
    pub async fn new() -> anyhow::Result<Self> {
        let store = Arc::new(MemoryStore::new());
        store.save_worker(&worker("w1")).await?;
        let team = store.create_team("main").await?;
        let client = Arc::new(FakeWorkerClient::new());
        let leases = Arc::new(LeaseManager::new(store.clone()).with_owner("scenario"));

        let ctx = Arc::new(EngineContext {
            builds: store.clone(),
            events: store.clone(),
            pipelines: store.clone(),
            versions: store.clone(),
            configs: store.clone(),
            containers: store.clone(),
            volumes: store.clone(),
            artifacts: store.clone(),
            bus: store.bus(),
            pool: Arc::new(
                Pool::new(store.clone(), store.clone(), store.clone(), store.bus())
                    .with_wait_timeout(Duration::from_secs(1)),
            ),
            provisioner: Arc::new(Provisioner::new(client.clone(), store.clone(), store.clone())),
            leases: leases.clone(),
            vars: Arc::new(StaticVariables::default()),
        });

        Ok(Self {
            store,
            client,
            ctx,
            leases,
            team,
            config: CoreConfig::default(),
        })
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.store.clone(),
            self.store.clone(),
            self.store.clone(),
            self.store.clone(),
            self.store.clone(),
            self.leases.clone(),
            &self.config,
        )
    }

    pub fn engine(&self) -> Engine {
        Engine::new(self.ctx.clone(), EngineConfig::from_core(&self.config))
    }

    pub fn tracker(&self) -> Tracker {
        Tracker::new(Arc::new(self.engine()))
    }

    pub fn gc(&self) -> GcContext {
        GcContext {
            builds: self.store.clone(),
            events: self.store.clone(),
            pipelines: self.store.clone(),
            workers: self.store.clone(),
            containers: self.store.clone(),
            volumes: self.store.clone(),
            artifacts: self.store.clone(),
            configs: self.store.clone(),
            checks: self.store.clone(),
            provisioner: self.ctx.provisioner.clone(),
            var_sources: None,
        }
    }

    /// Save `config` as pipeline `name` of the `main` team, unpaused.
    pub async fn set_pipeline(&self, name: &str, config: serde_json::Value) -> anyhow::Result<Pipeline> {
        let config: PipelineDefinition = serde_json::from_value(config)?;
        let saved = self.store.save_pipeline(self.team.id, name, &config, None, false).await?;
        Ok(saved.pipeline)
    }

    pub async fn job(&self, pipeline: &Pipeline, name: &str) -> anyhow::Result<Job> {
        self.store
            .jobs(pipeline.id)
            .await?
            .into_iter()
            .find(|j| j.name == name)
            .with_context(|| format!("job {name} not found"))
    }

    pub async fn resource(&self, pipeline: &Pipeline, name: &str) -> anyhow::Result<Resource> {
        self.store
            .resources(pipeline.id)
            .await?
            .into_iter()
            .find(|r| r.name == name)
            .with_context(|| format!("resource {name} not found"))
    }

    /// Record what a check of `resource` would have found: `refs`, oldest
    /// first.
    pub async fn discover(&self, pipeline: &Pipeline, resource: &str, refs: &[&str]) -> anyhow::Result<Vec<ResourceVersion>> {
        let resource = self.resource(pipeline, resource).await?;
        let config = self
            .store
            .find_or_create_config(&ResourceConfigDescriptor::new(&resource.type_name, resource.source.clone()))
            .await?;
        self.store
            .set_resource_config(CheckTarget::Resource(resource.id), config.id)
            .await?;
        let versions: Vec<Version> = refs.iter().map(|r| Version::new().with("ref", *r)).collect();
        Ok(self.store.save_versions(config.id, &versions).await?)
    }

    pub async fn build(&self, id: BuildId) -> anyhow::Result<Build> {
        self.store
            .build(id)
            .await?
            .with_context(|| format!("build {id} not found"))
    }

    /// Poll until the build reaches `status`.
    pub async fn wait_for_status(&self, id: BuildId, status: BuildStatus) -> anyhow::Result<Build> {
        let waited = tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                let build = self.build(id).await?;
                if build.status == status {
                    return Ok::<_, anyhow::Error>(build);
                }
                if build.status.is_terminal() {
                    bail!("build {id} ended {} instead of {}", build.status.as_str(), status.as_str());
                }
                tokio::time::sleep(WAIT_STEP).await;
            }
        })
        .await;
        waited.with_context(|| format!("build {id} never reached {}", status.as_str()))?
    }

    /// Poll until a process at `path` has been started.
    pub async fn wait_for_call(&self, path: &str) -> anyhow::Result<()> {
        tokio::time::timeout(WAIT_LIMIT, async {
            while self.client.calls_to(path).is_empty() {
                tokio::time::sleep(WAIT_STEP).await;
            }
        })
        .await
        .with_context(|| format!("{path} was never run"))
    }

    /// Every event of the build, decoded, in order.
    pub async fn events(&self, build: &Build) -> anyhow::Result<Vec<Event>> {
        let page = EventStore::get(self.store.as_ref(), build, None, 10_000).await?;
        page.events
            .iter()
            .map(|e| Event::from_message(&e.message).map_err(Into::into))
            .collect()
    }
}
