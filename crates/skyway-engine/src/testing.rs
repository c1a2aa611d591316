//! In-memory fixture for engine tests.

use crate::context::{EngineConfig, EngineContext};
use crate::engine::Engine;
use chrono::Utc;
use skyway_component::LeaseManager;
use skyway_core::build::{Build, BuildStatus};
use skyway_core::events::Event;
use skyway_core::ids::{PlanId, TeamId};
use skyway_core::plan::{GetPlan, Plan, PlanKind, TaskPlan};
use skyway_core::ports::{BuildCreator, EventStore, TeamRepository, WorkerRepository};
use skyway_core::resource::Version;
use skyway_core::task::TaskConfig;
use skyway_core::vars::StaticVariables;
use skyway_core::worker::{Worker, WorkerResourceType, WorkerState};
use skyway_db::memory::MemoryStore;
use skyway_worker::{FakeWorkerClient, PlacementChain, Pool, Provisioner};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub(crate) const IN: &str = "/opt/resource/in";
pub(crate) const OUT: &str = "/opt/resource/out";

pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub client: Arc<FakeWorkerClient>,
    pub ctx: Arc<EngineContext>,
    pub team_id: TeamId,
}

pub(crate) fn worker(name: &str) -> Worker {
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

impl Harness {
    pub async fn new() -> Self {
        Self::with_chain(PlacementChain::default()).await
    }

    pub async fn with_chain(chain: PlacementChain) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.save_worker(&worker("w1")).await.unwrap();
        let team = store.create_team("main").await.unwrap();
        let client = Arc::new(FakeWorkerClient::new());

        let mut vars = serde_json::Map::new();
        vars.insert("token".into(), serde_json::json!("s3cr3t-token"));

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
                    .with_chain(chain)
                    .with_wait_timeout(Duration::from_secs(1)),
            ),
            provisioner: Arc::new(Provisioner::new(client.clone(), store.clone(), store.clone())),
            leases: Arc::new(LeaseManager::new(store.clone())),
            vars: Arc::new(StaticVariables::new(vars)),
        });
        Self {
            store,
            client,
            ctx,
            team_id: team.id,
        }
    }

    pub fn config() -> EngineConfig {
        EngineConfig {
            redact_secrets: true,
            abort_grace_period: Duration::from_secs(10),
            check_timeout: Duration::from_secs(60),
        }
    }

    pub fn engine(&self) -> Engine {
        Engine::new(self.ctx.clone(), Self::config())
    }

    pub async fn active_tasks(&self, worker: &str) -> i32 {
        self.store.worker(worker).await.unwrap().unwrap().active_tasks
    }

    pub async fn start(&self, plan: &Plan) -> Build {
        self.store.create_started_build(self.team_id, None, plan).await.unwrap()
    }

    /// Run `plan` as a one-off build to a terminal status.
    pub async fn run(&self, plan: &Plan) -> (Build, BuildStatus) {
        let build = self.start(plan).await;
        let status = self
            .engine()
            .run_build(build.clone(), CancellationToken::new())
            .await
            .unwrap()
            .expect("build released");
        (build, status)
    }

    pub async fn events(&self, build: &Build) -> Vec<Event> {
        let page = EventStore::get(self.store.as_ref(), build, None, 10_000).await.unwrap();
        page.events
            .iter()
            .map(|e| Event::from_message(&e.message).unwrap())
            .collect()
    }

    pub async fn wait_for_call(&self, path: &str) {
        while self.client.calls_to(path).is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Concatenated log output of one plan node.
    pub async fn logs(&self, build: &Build, plan_id: &str) -> String {
        self.events(build)
            .await
            .into_iter()
            .filter_map(|e| match e {
                Event::Log(log) if log.origin.id.as_str() == plan_id => Some(log.payload),
                _ => None,
            })
            .collect()
    }
}

pub(crate) fn task(id: &str, run_path: &str) -> Plan {
    task_with(id, &format!("rootfs_uri: docker:///busybox\nrun: {{path: {run_path}}}\n"))
}

pub(crate) fn task_with(id: &str, config_yaml: &str) -> Plan {
    let config: TaskConfig = serde_yaml::from_str(config_yaml).unwrap();
    Plan::new(
        id,
        PlanKind::Task(TaskPlan {
            name: id.to_string(),
            privileged: false,
            config: Some(config),
            config_path: None,
            params: Default::default(),
            image_artifact: None,
            input_mapping: Default::default(),
            output_mapping: Default::default(),
            tags: vec![],
            resource_types: vec![],
        }),
    )
}

pub(crate) fn get(id: &str, name: &str, version: Option<Version>) -> Plan {
    let mut source = serde_json::Map::new();
    source.insert("uri".into(), serde_json::json!("https://example.com/repo.git"));
    Plan::new(
        id,
        PlanKind::Get(GetPlan {
            name: name.to_string(),
            resource: None,
            type_name: "git".to_string(),
            source,
            params: Default::default(),
            version,
            tags: vec![],
            resource_types: vec![],
        }),
    )
}

pub(crate) fn seq(id: &str, steps: Vec<Plan>) -> Plan {
    Plan::new(id, PlanKind::Do(steps))
}

pub(crate) fn version_json(git_ref: &str) -> String {
    format!(r#"{{"version":{{"ref":"{git_ref}"}},"metadata":[{{"name":"author","value":"ci"}}]}}"#)
}

pub(crate) fn is_error_for(event: &Event, plan_id: &str, message: &str) -> bool {
    matches!(event, Event::Error(e)
        if e.origin.as_ref().map(|o| o.id.as_str()) == Some(plan_id) && e.message == message)
}

pub(crate) fn plan_id(id: &str) -> PlanId {
    PlanId::new(id)
}
