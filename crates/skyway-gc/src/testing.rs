//! In-memory fixture for collector tests.

use crate::GcContext;
use chrono::Utc;
use skyway_core::build::{Build, BuildStatus};
use skyway_core::ids::{PlanId, TeamId};
use skyway_core::pipeline::{Pipeline, PipelineDefinition};
use skyway_core::plan::{Plan, PlanKind};
use skyway_core::ports::*;
use skyway_core::worker::{Container, ContainerOwner, Volume, Worker, WorkerState};
use skyway_db::MemoryStore;
use skyway_worker::{FakeWorkerClient, Provisioner};
use std::sync::Arc;

pub(crate) struct Fixture {
    pub store: Arc<MemoryStore>,
    pub client: Arc<FakeWorkerClient>,
    pub ctx: GcContext,
    pub team_id: TeamId,
}

pub(crate) fn worker(name: &str) -> Worker {
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

impl Fixture {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        store.save_worker(&worker("w1")).await.unwrap();
        let team = store.create_team("main").await.unwrap();
        let client = Arc::new(FakeWorkerClient::new());
        let ctx = GcContext {
            builds: store.clone(),
            events: store.clone(),
            pipelines: store.clone(),
            workers: store.clone(),
            containers: store.clone(),
            volumes: store.clone(),
            artifacts: store.clone(),
            configs: store.clone(),
            checks: store.clone(),
            provisioner: Arc::new(Provisioner::new(client.clone(), store.clone(), store.clone())),
            var_sources: None,
        };
        Self {
            store,
            client,
            ctx,
            team_id: team.id,
        }
    }

    /// A one-off build that already finished.
    pub async fn finished_build(&self) -> Build {
        let plan = Plan::new("root", PlanKind::Do(vec![]));
        let build = self.store.create_started_build(self.team_id, None, &plan).await.unwrap();
        self.store.finish_build(build.id, BuildStatus::Succeeded).await.unwrap();
        self.store.build(build.id).await.unwrap().unwrap()
    }

    pub async fn pipeline(&self, json: &str) -> Pipeline {
        let config: PipelineDefinition = serde_json::from_str(json).unwrap();
        self.store
            .save_pipeline(self.team_id, "main", &config, None, false)
            .await
            .unwrap()
            .pipeline
    }

    pub async fn build_container(&self, worker_name: &str, build: &Build) -> Container {
        let owner = ContainerOwner::BuildStep {
            build_id: build.id,
            plan_id: PlanId::new("root"),
            team_id: self.team_id,
        };
        let container = self.store.create_container(worker_name, &owner).await.unwrap();
        self.store.mark_container_created(&container.handle).await.unwrap();
        container
    }

    pub async fn volume(&self, worker_name: &str, parent: Option<&Volume>) -> Volume {
        let worker = self.store.worker(worker_name).await.unwrap().unwrap();
        self.ctx
            .provisioner
            .create_volume(
                &worker,
                VolumeRequest {
                    parent_handle: parent.map(|p| p.handle.clone()),
                    path: "/scratch".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }
}
