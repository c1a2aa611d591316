//! Wiring of the control-plane components.

use crate::config::ServerConfig;
use crate::stores::Stores;
use anyhow::Context;
use skyway_component::{ComponentRunner, ComponentSet, LeaseManager, Task};
use skyway_core::channels;
use skyway_core::component;
use skyway_core::vars::{StaticVariables, Variables};
use skyway_engine::{Engine, EngineConfig, EngineContext, Tracker};
use skyway_gc::GcContext;
use skyway_lidar::{Checker, Scanner};
use skyway_scheduler::Scheduler;
use skyway_secrets::{EnvProvider, FileProvider, ProviderVariables, VarSourcePool, VarSourcePoolConfig};
use skyway_worker::{PlacementChain, Pool, Provisioner, WorkerClient};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct App {
    config: ServerConfig,
    stores: Stores,
    ctx: Arc<EngineContext>,
    leases: Arc<LeaseManager>,
    tracker: Arc<Tracker>,
    var_sources: Option<Arc<VarSourcePool>>,
}

impl App {
    pub async fn new(config: ServerConfig, stores: Stores, client: Arc<dyn WorkerClient>) -> anyhow::Result<Self> {
        let core = &config.core;
        let leases = Arc::new(LeaseManager::new(stores.leases.clone()).with_heartbeat_fraction(core.lease_heartbeat_fraction));
        let chain = PlacementChain::from_config(core).context("invalid container placement strategy")?;
        let pool = Pool::new(
            stores.workers.clone(),
            stores.containers.clone(),
            stores.volumes.clone(),
            stores.bus.clone(),
        )
        .with_chain(chain)
        .with_wait_timeout(core.worker_wait_timeout());
        let provisioner = Provisioner::new(client, stores.containers.clone(), stores.volumes.clone());

        let var_sources = credential_sources(&config).await?;
        let vars: Arc<dyn Variables> = match &var_sources {
            Some(pool) => pool.clone(),
            None => Arc::new(StaticVariables::default()),
        };

        let ctx = Arc::new(EngineContext {
            builds: stores.builds.clone(),
            events: stores.events.clone(),
            pipelines: stores.pipelines.clone(),
            versions: stores.versions.clone(),
            configs: stores.configs.clone(),
            containers: stores.containers.clone(),
            volumes: stores.volumes.clone(),
            artifacts: stores.artifacts.clone(),
            bus: stores.bus.clone(),
            pool: Arc::new(pool),
            provisioner: Arc::new(provisioner),
            leases: leases.clone(),
            vars,
        });
        let engine = Arc::new(Engine::new(ctx.clone(), EngineConfig::from_core(core)));
        let tracker = Arc::new(Tracker::new(engine));

        Ok(Self {
            config,
            stores,
            ctx,
            leases,
            tracker,
            var_sources,
        })
    }

    /// One runner per component, named as stored in the components table.
    pub fn runners(&self) -> Vec<ComponentRunner> {
        let core = &self.config.core;
        let stores = &self.stores;
        let runner = |name: &str, interval: Duration, task: Arc<dyn Task>| {
            ComponentRunner::new(name, interval, task, stores.components.clone(), self.leases.clone())
        };

        let scanner = Scanner::new(
            stores.pipelines.clone(),
            stores.configs.clone(),
            stores.versions.clone(),
            stores.checks.clone(),
            self.ctx.vars.clone(),
            core,
        );
        let checker = Checker::new(self.ctx.clone(), stores.checks.clone(), core.checker_batch_size);
        let scheduler = Scheduler::new(
            stores.pipelines.clone(),
            stores.builds.clone(),
            stores.creator.clone(),
            stores.versions.clone(),
            stores.events.clone(),
            self.leases.clone(),
            core,
        );

        let interval = core.component_runner_interval();
        let mut runners = vec![
            runner(component::SCANNER, interval, Arc::new(scanner)),
            runner(component::CHECKER, interval, Arc::new(checker)),
            runner(component::SCHEDULER, interval, Arc::new(scheduler)),
            runner(component::BUILD_TRACKER, interval, self.tracker.clone())
                .with_trigger(stores.bus.clone(), channels::BUILD_STARTED),
        ];

        let gc = GcContext {
            builds: stores.builds.clone(),
            events: stores.events.clone(),
            pipelines: stores.pipelines.clone(),
            workers: stores.workers.clone(),
            containers: stores.containers.clone(),
            volumes: stores.volumes.clone(),
            artifacts: stores.artifacts.clone(),
            configs: stores.configs.clone(),
            checks: stores.checks.clone(),
            provisioner: self.ctx.provisioner.clone(),
            var_sources: self.var_sources.clone(),
        };
        for (name, task) in skyway_gc::collectors(&gc, core) {
            runners.push(runner(name, core.gc.interval(), task));
        }
        runners
    }

    /// Run every component until `shutdown` resolves, then drain: runners
    /// first, then the builds this node drives. Builds left unfinished stay
    /// started for another node to resume.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        let mut set = ComponentSet::new();
        for runner in self.runners() {
            set.spawn(runner);
        }
        info!(
            components = set.len(),
            dev_mode = self.config.dev_mode,
            "Control plane running"
        );

        shutdown.await;

        let drain = self.config.core.drain_timeout();
        if !set.shutdown(drain).await {
            warn!("Components did not drain in time");
        }
        let running = self.tracker.running().len();
        if !self.tracker.shutdown(drain).await {
            warn!(builds = running, "Builds did not release in time");
        }
        self.stores.close().await;
        info!("Control plane stopped");
        Ok(())
    }
}

/// The credential managers behind `((var))`, if any are configured.
async fn credential_sources(config: &ServerConfig) -> anyhow::Result<Option<Arc<VarSourcePool>>> {
    if !config.has_credential_sources() {
        return Ok(None);
    }
    let mut pool = VarSourcePool::new(VarSourcePoolConfig {
        cache_ttl: Duration::from_secs(config.var_source_cache_ttl_secs),
    });
    if let Some(path) = &config.secrets_file {
        let provider = FileProvider::load_from_file(path)
            .await
            .with_context(|| format!("failed to load secrets file {}", path.display()))?;
        pool.register(Arc::new(ProviderVariables::new(Arc::new(provider))));
    }
    if let Some(prefix) = &config.env_secrets_prefix {
        pool.register(Arc::new(ProviderVariables::new(Arc::new(EnvProvider::new(Some(prefix.clone()))))));
    }
    Ok(Some(Arc::new(pool)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use skyway_worker::FakeWorkerClient;
    use std::io::Write;

    async fn app(config: ServerConfig) -> App {
        App::new(config, Stores::memory(), Arc::new(FakeWorkerClient::new()))
            .await
            .unwrap()
    }

    fn names(app: &App) -> Vec<String> {
        app.runners().iter().map(|r| r.name().to_string()).collect()
    }

    #[tokio::test]
    async fn test_runs_every_component_once() {
        let app = app(ServerConfig::default()).await;
        let names = names(&app);

        assert_eq!(&names[..4], &["scanner", "checker", "scheduler", "tracker"]);
        assert!(names.contains(&component::COLLECTOR_VOLUMES.to_string()));
        assert!(!names.contains(&component::COLLECTOR_VAR_SOURCES.to_string()));
        let mut unique = names.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), names.len());
    }

    #[tokio::test]
    async fn test_credential_sources_add_their_collector() {
        let mut secrets = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        secrets.write_all(b"main/token: s3cret\n").unwrap();
        let config = ServerConfig {
            secrets_file: Some(secrets.path().to_path_buf()),
            ..ServerConfig::default()
        };

        let app = app(config).await;

        assert!(names(&app).contains(&component::COLLECTOR_VAR_SOURCES.to_string()));
        let var = skyway_core::vars::VarRef::parse("main/token");
        assert_eq!(
            app.ctx.vars.get(&var).await.unwrap(),
            Some(serde_json::json!("s3cret"))
        );
    }

    #[tokio::test]
    async fn test_missing_secrets_file_fails_startup() {
        let config = ServerConfig {
            secrets_file: Some("/nonexistent/secrets.yaml".into()),
            ..ServerConfig::default()
        };
        let result = App::new(config, Stores::memory(), Arc::new(FakeWorkerClient::new())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let app = app(ServerConfig::default()).await;
        let components = app.stores.components.clone();

        let stopped = tokio::time::timeout(
            Duration::from_secs(30),
            app.run(tokio::time::sleep(Duration::from_millis(50))),
        )
        .await;

        assert!(matches!(stopped, Ok(Ok(()))));
        assert!(components.get(component::SCHEDULER).await.unwrap().is_some());
    }
}
