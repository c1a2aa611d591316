//! Periodic singleton execution of component tasks.

use crate::lease::LeaseManager;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use skyway_core::Result;
use skyway_core::component::leases;
use skyway_core::ports::{ComponentRepository, NotificationBus, NotificationStream};
use skyway_trace::component_span;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

const DEFAULT_TICK: Duration = Duration::from_secs(10);

/// Work done by a component on each due tick.
#[async_trait]
pub trait Task: Send + Sync {
    /// `cancel` fires on shutdown or when the component's lease is lost.
    async fn run(&self, cancel: CancellationToken) -> Result<()>;
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Paused,
    NotDue,
    LeaseHeld,
    Ran,
    Failed,
}

/// Drives one [`Task`] under the lease named after its component.
pub struct ComponentRunner {
    name: String,
    interval: Duration,
    task: Arc<dyn Task>,
    components: Arc<dyn ComponentRepository>,
    leases: Arc<LeaseManager>,
    tick: Duration,
    trigger: Option<(Arc<dyn NotificationBus>, String)>,
}

impl ComponentRunner {
    /// `interval` is only the initial value; once registered, the stored
    /// interval wins so operators can retune a running fleet.
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        task: Arc<dyn Task>,
        components: Arc<dyn ComponentRepository>,
        leases: Arc<LeaseManager>,
    ) -> Self {
        Self {
            name: name.into(),
            interval,
            task,
            components,
            leases,
            tick: DEFAULT_TICK,
            trigger: None,
        }
    }

    /// How often the runner wakes to check whether the component is due.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Run immediately, ignoring the interval, whenever `channel` fires.
    pub fn with_trigger(mut self, bus: Arc<dyn NotificationBus>, channel: impl Into<String>) -> Self {
        self.trigger = Some((bus, channel.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluate the component once. `force` skips the interval check only.
    pub async fn tick(&self, cancel: &CancellationToken, force: bool) -> Result<TickOutcome> {
        let component = match self.components.get(&self.name).await? {
            Some(component) => component,
            None => self.components.register(&self.name, self.interval).await?,
        };

        if component.paused {
            debug!(component = %self.name, "Component paused");
            return Ok(TickOutcome::Paused);
        }
        if !force && !component.is_due(Utc::now()) {
            return Ok(TickOutcome::NotDue);
        }

        let run_cancel = cancel.child_token();
        let on_broken = run_cancel.clone();
        let lease = self
            .leases
            .acquire_with(&leases::component(&self.name), component.interval * 2, move || on_broken.cancel())
            .await?;
        let Some(lease) = lease else {
            debug!(component = %self.name, "Component running elsewhere");
            return Ok(TickOutcome::LeaseHeld);
        };

        let started = Instant::now();
        let outcome = match self.task.run(run_cancel).instrument(component_span(&self.name)).await {
            Ok(()) => {
                debug!(
                    component = %self.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Component run finished"
                );
                self.components
                    .update_last_run(&self.name, Utc::now())
                    .await
                    .map(|_| TickOutcome::Ran)
            }
            Err(e) => {
                error!(component = %self.name, error = %e, "Component run failed");
                Ok(TickOutcome::Failed)
            }
        };

        if let Err(e) = lease.release().await {
            warn!(component = %self.name, error = %e, "Failed to release component lease");
        }
        outcome
    }

    /// Tick until `cancel` fires. An in-flight run finishes first.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut trigger = match &self.trigger {
            Some((bus, channel)) => match bus.listen(channel).await {
                Ok(stream) => Some(stream),
                Err(e) => {
                    warn!(component = %self.name, channel = %channel, error = %e, "Failed to listen for triggers");
                    None
                }
            },
            None => None,
        };

        info!(component = %self.name, tick_ms = self.tick.as_millis() as u64, "Starting component");

        loop {
            let force = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => false,
                Some(()) = next_signal(&mut trigger) => true,
            };

            match self.tick(&cancel, force).await {
                Ok(outcome) => debug!(component = %self.name, ?outcome, "Component tick"),
                Err(e) => warn!(component = %self.name, error = %e, "Component tick failed"),
            }
        }

        info!(component = %self.name, "Component stopped");
    }
}

async fn next_signal(stream: &mut Option<NotificationStream>) -> Option<()> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// The set of runners owned by one process.
pub struct ComponentSet {
    cancel: CancellationToken,
    runners: JoinSet<()>,
}

impl Default for ComponentSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentSet {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            runners: JoinSet::new(),
        }
    }

    pub fn spawn(&mut self, runner: ComponentRunner) {
        let cancel = self.cancel.clone();
        self.runners.spawn(runner.run(cancel));
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Token cancelled when the set shuts down.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every runner and wait for them up to `drain_timeout`.
    /// Returns false if some had to be aborted.
    pub async fn shutdown(mut self, drain_timeout: Duration) -> bool {
        self.cancel.cancel();
        let drained = tokio::time::timeout(drain_timeout, async {
            while let Some(joined) = self.runners.join_next().await {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    error!(error = %e, "Component panicked");
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(remaining = self.runners.len(), "Drain timeout exceeded, aborting components");
            self.runners.abort_all();
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyway_db::{MemoryBus, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTask {
        runs: AtomicUsize,
        fail: bool,
    }

    impl CountingTask {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                fail,
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Task for CountingTask {
        async fn run(&self, _cancel: CancellationToken) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(skyway_core::Error::Internal("boom".into()));
            }
            Ok(())
        }
    }

    /// Blocks until cancelled.
    struct WaitingTask;

    #[async_trait]
    impl Task for WaitingTask {
        async fn run(&self, cancel: CancellationToken) -> Result<()> {
            cancel.cancelled().await;
            Ok(())
        }
    }

    fn runner(store: &Arc<MemoryStore>, task: Arc<dyn Task>) -> ComponentRunner {
        let leases = Arc::new(LeaseManager::new(store.clone()).with_owner("web-1"));
        ComponentRunner::new("scheduler", Duration::from_secs(10), task, store.clone(), leases)
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_records_last_run() {
        let store = Arc::new(MemoryStore::new());
        let task = CountingTask::new(false);
        let runner = runner(&store, task.clone());

        let outcome = runner.tick(&CancellationToken::new(), false).await.unwrap();
        assert_eq!(outcome, TickOutcome::Ran);
        assert_eq!(task.runs(), 1);

        let component = store.get("scheduler").await.unwrap().unwrap();
        assert!(component.last_run.is_some());
        assert_eq!(component.interval, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_due_until_interval_elapsed() {
        let store = Arc::new(MemoryStore::new());
        let task = CountingTask::new(false);
        let runner = runner(&store, task.clone());
        let cancel = CancellationToken::new();

        runner.tick(&cancel, false).await.unwrap();
        assert_eq!(runner.tick(&cancel, false).await.unwrap(), TickOutcome::NotDue);
        assert_eq!(runner.tick(&cancel, true).await.unwrap(), TickOutcome::Ran);

        store.set_component_last_run("scheduler", Some(Utc::now() - chrono::Duration::seconds(11)));
        assert_eq!(runner.tick(&cancel, false).await.unwrap(), TickOutcome::Ran);
        assert_eq!(task.runs(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_component_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        store.register("scheduler", Duration::from_secs(10)).await.unwrap();
        store.set_paused("scheduler", true).await.unwrap();
        let task = CountingTask::new(false);
        let runner = runner(&store, task.clone());

        assert_eq!(
            runner.tick(&CancellationToken::new(), true).await.unwrap(),
            TickOutcome::Paused
        );
        assert_eq!(task.runs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_run_does_not_advance_last_run() {
        let store = Arc::new(MemoryStore::new());
        let task = CountingTask::new(true);
        let runner = runner(&store, task.clone());

        assert_eq!(
            runner.tick(&CancellationToken::new(), false).await.unwrap(),
            TickOutcome::Failed
        );
        assert!(store.get("scheduler").await.unwrap().unwrap().last_run.is_none());

        // Lease was released, so the next tick can run again right away.
        assert_eq!(
            runner.tick(&CancellationToken::new(), false).await.unwrap(),
            TickOutcome::Failed
        );
        assert_eq!(task.runs(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skips_while_another_process_holds_lease() {
        let store = Arc::new(MemoryStore::new());
        let other = LeaseManager::new(store.clone()).with_owner("web-2");
        let held = other
            .acquire(&leases::component("scheduler"), Duration::from_secs(20))
            .await
            .unwrap()
            .unwrap();

        let task = CountingTask::new(false);
        let runner = runner(&store, task.clone());
        assert_eq!(
            runner.tick(&CancellationToken::new(), false).await.unwrap(),
            TickOutcome::LeaseHeld
        );
        assert_eq!(task.runs(), 0);

        held.release().await.unwrap();
        assert_eq!(
            runner.tick(&CancellationToken::new(), false).await.unwrap(),
            TickOutcome::Ran
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stored_interval_overrides_initial() {
        let store = Arc::new(MemoryStore::new());
        let task = CountingTask::new(false);
        let runner = runner(&store, task.clone());
        let cancel = CancellationToken::new();

        runner.tick(&cancel, false).await.unwrap();
        store.set_interval("scheduler", Duration::ZERO).await.unwrap();
        assert_eq!(runner.tick(&cancel, false).await.unwrap(), TickOutcome::Ran);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_forces_run() {
        let bus: Arc<dyn NotificationBus> = Arc::new(MemoryBus::new());
        let store = Arc::new(MemoryStore::with_bus(bus.clone()));
        let task = CountingTask::new(false);
        let runner = runner(&store, task.clone())
            .with_tick(Duration::from_secs(3600))
            .with_trigger(bus.clone(), "build_started");

        let mut set = ComponentSet::new();
        set.spawn(runner);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(task.runs(), 1);

        bus.notify("build_started").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(task.runs(), 2);

        assert!(set.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_in_flight_runs() {
        let store = Arc::new(MemoryStore::new());
        let mut set = ComponentSet::new();
        set.spawn(runner(&store, Arc::new(WaitingTask)));
        assert_eq!(set.len(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(set.shutdown(Duration::from_secs(5)).await);

        // The cancelled run still counts as a success.
        assert!(store.get("scheduler").await.unwrap().unwrap().last_run.is_some());
    }
}
