//! In-memory fixture shared by the scanner and checker tests.

use crate::{Checker, Scanner};
use chrono::Utc;
use skyway_component::LeaseManager;
use skyway_core::config::CoreConfig;
use skyway_core::ids::TeamId;
use skyway_core::pipeline::{Pipeline, PipelineDefinition};
use skyway_core::ports::{PipelineRepository, TeamRepository, WorkerRepository};
use skyway_core::resource::{Resource, Source};
use skyway_core::vars::StaticVariables;
use skyway_core::worker::{Worker, WorkerResourceType, WorkerState};
use skyway_db::MemoryStore;
use skyway_engine::EngineContext;
use skyway_worker::{FakeWorkerClient, Pool, Provisioner};
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct Fixture {
    pub store: Arc<MemoryStore>,
    pub client: Arc<FakeWorkerClient>,
    pub ctx: Arc<EngineContext>,
    pub team_id: TeamId,
}

pub(crate) fn repo_source() -> Source {
    let mut source = serde_json::Map::new();
    source.insert("uri".into(), serde_json::json!("https://example.com/repo.git"));
    source
}

fn worker() -> Worker {
    let base = |type_name: &str| WorkerResourceType {
        type_name: type_name.to_string(),
        image: format!("/usr/local/skyway/resource-types/{type_name}/rootfs"),
        version: "1.0".to_string(),
        privileged: false,
    };
    Worker {
        name: "w1".to_string(),
        state: WorkerState::Running,
        platform: "linux".to_string(),
        tags: vec![],
        team_id: None,
        garden_addr: "w1:7777".to_string(),
        baggageclaim_url: "http://w1:7788".to_string(),
        version: "2.5".to_string(),
        resource_types: vec![base("git"), base("registry-image")],
        ephemeral: false,
        active_tasks: 0,
        start_time: Utc::now(),
        last_heartbeat: Utc::now(),
    }
}

impl Fixture {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        store.save_worker(&worker()).await.unwrap();
        let team = store.create_team("main").await.unwrap();
        let client = Arc::new(FakeWorkerClient::new());

        let mut vars = serde_json::Map::new();
        vars.insert("repo_uri".into(), serde_json::json!("https://example.com/repo.git"));

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
            leases: Arc::new(LeaseManager::new(store.clone()).with_owner("lidar-test")),
            vars: Arc::new(StaticVariables::new(vars)),
        });
        Self {
            store,
            client,
            ctx,
            team_id: team.id,
        }
    }

    pub fn scanner(&self) -> Scanner {
        Scanner::new(
            self.store.clone(),
            self.store.clone(),
            self.store.clone(),
            self.store.clone(),
            self.ctx.vars.clone(),
            &CoreConfig::default(),
        )
    }

    pub fn checker(&self) -> Checker {
        Checker::new(self.ctx.clone(), self.store.clone(), 10)
    }

    pub async fn pipeline(&self, yaml: &str) -> Pipeline {
        let config: PipelineDefinition = serde_yaml::from_str(yaml).unwrap();
        self.store
            .save_pipeline(self.team_id, "main", &config, None, false)
            .await
            .unwrap()
            .pipeline
    }

    pub async fn resource(&self, pipeline: &Pipeline, name: &str) -> Resource {
        self.store
            .resources(pipeline.id)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.name == name)
            .unwrap()
    }
}
