//! Recursive evaluation of a plan tree.
//!
//! Every node runs its body, then its hooks: exactly one of `on_success`,
//! `on_failure`, `on_error` or `on_abort` by outcome, then `ensure`. A hook
//! that does not succeed replaces the node's outcome. Once the build is
//! aborted, hooks run under a fresh token bounded by the abort grace
//! period so cleanup still happens.

use crate::context::RunState;
use crate::outcome::Outcome;
use crate::steps;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, stream};
use skyway_core::Error;
use skyway_core::events::Origin;
use skyway_core::ids::PlanId;
use skyway_core::plan::{Plan, PlanKind};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use skyway_trace::{CiAttributes, step_span};
use tracing::{Instrument, debug, error, warn};

pub struct Interpreter {
    state: RunState,
}

impl Interpreter {
    pub fn new(state: RunState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Run `plan` and its hooks to an outcome.
    pub fn run<'a>(&'a self, plan: &'a Plan, cancel: CancellationToken) -> BoxFuture<'a, Outcome> {
        async move {
            let outcome = self.body(plan, &cancel).await;
            self.hooks(plan, outcome, &cancel).await
        }
        .boxed()
    }

    async fn body(&self, plan: &Plan, cancel: &CancellationToken) -> Outcome {
        match &plan.kind {
            PlanKind::Do(steps) => {
                for step in steps {
                    if cancel.is_cancelled() {
                        return Outcome::Aborted;
                    }
                    let outcome = self.run(step, cancel.clone()).await;
                    if !outcome.is_success() {
                        return outcome;
                    }
                }
                Outcome::Succeeded
            }
            PlanKind::InParallel {
                steps,
                limit,
                fail_fast,
            } => self.in_parallel(steps, *limit, *fail_fast, cancel).await,
            PlanKind::Try(step) => match self.run(step, cancel.clone()).await {
                Outcome::Aborted => Outcome::Aborted,
                _ => Outcome::Succeeded,
            },
            PlanKind::Timeout { duration_secs, step } => {
                self.timeout(&plan.id, Duration::from_secs(*duration_secs), step, cancel)
                    .await
            }
            PlanKind::Retry { attempts, step } => self.retry(*attempts, step, cancel).await,
            _ => self.leaf(plan, cancel).await,
        }
    }

    async fn in_parallel(&self, steps: &[Plan], limit: usize, fail_fast: bool, cancel: &CancellationToken) -> Outcome {
        if steps.is_empty() {
            return Outcome::Succeeded;
        }
        let siblings = cancel.child_token();
        let width = if limit == 0 { steps.len() } else { limit };
        let branches: Vec<BoxFuture<'_, Outcome>> = steps.iter().map(|step| self.run(step, siblings.clone())).collect();
        let mut running = stream::iter(branches).buffer_unordered(width);

        let mut unsuccessful: Option<Outcome> = None;
        let mut aborted = false;
        while let Some(outcome) = running.next().await {
            match outcome {
                Outcome::Succeeded => {}
                Outcome::Aborted => aborted = true,
                other => {
                    unsuccessful = Some(unsuccessful.map_or(other, |o| o.worst(other)));
                    if fail_fast && !siblings.is_cancelled() {
                        debug!(build_id = %self.state.build().id, "Cancelling parallel siblings");
                        siblings.cancel();
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            Outcome::Aborted
        } else if let Some(outcome) = unsuccessful {
            outcome
        } else if aborted {
            Outcome::Aborted
        } else {
            Outcome::Succeeded
        }
    }

    async fn timeout(&self, id: &PlanId, limit: Duration, step: &Plan, cancel: &CancellationToken) -> Outcome {
        let child = cancel.child_token();
        let run = self.run(step, child.clone());
        tokio::pin!(run);
        tokio::select! {
            outcome = &mut run => outcome,
            _ = tokio::time::sleep(limit) => {
                child.cancel();
                run.await;
                if cancel.is_cancelled() {
                    return Outcome::Aborted;
                }
                self.step_error(id, &Error::StepTimeout).await;
                Outcome::Errored
            }
        }
    }

    async fn retry(&self, attempts: u32, step: &Plan, cancel: &CancellationToken) -> Outcome {
        let mut outcome = Outcome::Failed;
        for attempt in 1..=attempts {
            outcome = self.run(step, cancel.clone()).await;
            match outcome {
                Outcome::Succeeded | Outcome::Aborted => return outcome,
                _ if cancel.is_cancelled() => return Outcome::Aborted,
                _ => debug!(
                    build_id = %self.state.build().id,
                    plan_id = %step.id,
                    attempt,
                    attempts,
                    "Attempt did not succeed"
                ),
            }
        }
        outcome
    }

    async fn leaf(&self, plan: &Plan, cancel: &CancellationToken) -> Outcome {
        if cancel.is_cancelled() {
            return Outcome::Aborted;
        }
        let state = &self.state;
        let span = |kind: &str| step_span(&CiAttributes::new().build(state.build()).step(plan.id.as_str(), kind));
        let result = match &plan.kind {
            PlanKind::Get(get) => steps::get::run(state, &plan.id, get, cancel).instrument(span("get")).await,
            PlanKind::Put(put) => steps::put::run(state, &plan.id, put, cancel).instrument(span("put")).await,
            PlanKind::Task(task) => steps::task::run(state, &plan.id, task, cancel).instrument(span("task")).await,
            PlanKind::SetPipeline(sp) => {
                steps::set_pipeline::run(state, &plan.id, sp, cancel)
                    .instrument(span("set_pipeline"))
                    .await
            }
            PlanKind::Check(check) => steps::check::run(state, &plan.id, check, cancel).instrument(span("check")).await,
            _ => Err(Error::InvalidPlan(format!("plan {} is not a step", plan.id))),
        };

        match result {
            Ok(true) => Outcome::Succeeded,
            Ok(false) => Outcome::Failed,
            Err(e) => {
                self.step_error(&plan.id, &e).await;
                match e {
                    Error::Aborted => Outcome::Aborted,
                    e if e.is_user_error() => Outcome::Errored,
                    e => {
                        error!(build_id = %state.build().id, plan_id = %plan.id, error = %e, "Step errored");
                        Outcome::Errored
                    }
                }
            }
        }
    }

    async fn hooks(&self, plan: &Plan, outcome: Outcome, cancel: &CancellationToken) -> Outcome {
        let hooks = &plan.hooks;
        let terminal = match outcome {
            Outcome::Succeeded => hooks.on_success.as_deref(),
            Outcome::Failed => hooks.on_failure.as_deref(),
            Outcome::Errored => hooks.on_error.as_deref(),
            Outcome::Aborted => hooks.on_abort.as_deref(),
        };

        let mut result = outcome;
        for hook in terminal.into_iter().chain(hooks.ensure.as_deref()) {
            let hook_outcome = self.hook(hook, cancel).await;
            if !hook_outcome.is_success() {
                result = hook_outcome;
            }
        }
        result
    }

    async fn hook(&self, hook: &Plan, cancel: &CancellationToken) -> Outcome {
        if !cancel.is_cancelled() {
            return self.run(hook, cancel.clone()).await;
        }
        let grace = CancellationToken::new();
        let run = self.run(hook, grace.clone());
        tokio::pin!(run);
        tokio::select! {
            outcome = &mut run => outcome,
            _ = tokio::time::sleep(self.state.config.abort_grace_period) => {
                warn!(build_id = %self.state.build().id, plan_id = %hook.id, "Hook exceeded abort grace period");
                grace.cancel();
                run.await
            }
        }
    }

    async fn step_error(&self, id: &PlanId, err: &Error) {
        if let Err(e) = self.state.emitter.error(Some(Origin::new(id.clone())), err.to_string()).await {
            warn!(build_id = %self.state.build().id, plan_id = %id, error = %e, "Failed to record step error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use pretty_assertions::assert_eq;
    use skyway_core::build::BuildStatus;
    use skyway_core::events::Event;
    use skyway_core::ports::BuildRepository;
    use skyway_worker::FakeProcess;

    fn timeline(events: &[Event]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::InitializeTask(t) => Some(format!("initialize-task {}", t.origin.id.as_str())),
                Event::FinishTask(f) => Some(format!("finish-task {} {}", f.origin.id.as_str(), f.exit_status)),
                Event::Status(s) => Some(format!("status {}", s.status.as_str())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_failing_task_runs_on_failure_then_ensure() {
        let h = Harness::new().await;
        h.client.script("/bin/unit", FakeProcess::exit(1).stdout("1 test failed\n"));
        let mut unit = task("unit", "/bin/unit");
        unit.hooks.on_success = Some(Box::new(task("ship", "/bin/ship")));
        unit.hooks.on_failure = Some(Box::new(task("notify", "/bin/notify")));
        unit.hooks.ensure = Some(Box::new(task("cleanup", "/bin/cleanup")));

        let (build, status) = h.run(&seq("root", vec![unit])).await;

        assert_eq!(status, BuildStatus::Failed);
        assert_eq!(
            timeline(&h.events(&build).await),
            vec![
                "status started",
                "initialize-task unit",
                "finish-task unit 1",
                "initialize-task notify",
                "finish-task notify 0",
                "initialize-task cleanup",
                "finish-task cleanup 0",
                "status failed",
            ]
        );
        assert!(h.client.calls_to("/bin/ship").is_empty());
        assert_eq!(h.logs(&build, "unit").await, "1 test failed\n");
        let stored = h.store.build(build.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BuildStatus::Failed);
    }

    #[tokio::test]
    async fn test_failing_hook_replaces_outcome() {
        let h = Harness::new().await;
        h.client.script("/bin/cleanup", FakeProcess::exit(2));
        let mut unit = task("unit", "/bin/unit");
        unit.hooks.ensure = Some(Box::new(task("cleanup", "/bin/cleanup")));

        let (_, status) = h.run(&unit).await;
        assert_eq!(status, BuildStatus::Failed);
    }

    #[tokio::test]
    async fn test_do_stops_at_first_failure() {
        let h = Harness::new().await;
        h.client.script("/bin/first", FakeProcess::exit(1));
        let plan = seq("root", vec![task("first", "/bin/first"), task("second", "/bin/second")]);

        let (_, status) = h.run(&plan).await;
        assert_eq!(status, BuildStatus::Failed);
        assert!(h.client.calls_to("/bin/second").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast_cancels_siblings() {
        let h = Harness::new().await;
        h.client.script(
            "/bin/fails",
            FakeProcess::exit(1).with_delay(Duration::from_millis(50)),
        );
        h.client.script("/bin/hangs", FakeProcess::hanging());
        let plan = Plan::new(
            "par",
            PlanKind::InParallel {
                steps: vec![task("a", "/bin/fails"), task("b", "/bin/hangs")],
                limit: 0,
                fail_fast: true,
            },
        );

        let (build, status) = h.run(&plan).await;
        assert_eq!(status, BuildStatus::Failed);
        let events = h.events(&build).await;
        assert!(events.iter().any(|e| is_error_for(e, "b", "interrupted")));
    }

    #[tokio::test]
    async fn test_parallel_without_fail_fast_reports_worst() {
        let h = Harness::new().await;
        h.client.script("/bin/fails", FakeProcess::exit(1));
        let mut missing = task("b", "/bin/never");
        if let PlanKind::Task(t) = &mut missing.kind {
            t.config_path = Some("nowhere/task.yml".to_string());
            t.config = None;
        }
        let plan = Plan::new(
            "par",
            PlanKind::InParallel {
                steps: vec![task("a", "/bin/fails"), missing, task("c", "/bin/ok")],
                limit: 1,
                fail_fast: false,
            },
        );

        let (_, status) = h.run(&plan).await;
        assert_eq!(status, BuildStatus::Errored);
        assert_eq!(h.client.calls_to("/bin/ok").len(), 1);
    }

    #[tokio::test]
    async fn test_try_swallows_failure() {
        let h = Harness::new().await;
        h.client.script("/bin/flaky", FakeProcess::exit(1));
        let plan = Plan::new("try", PlanKind::Try(Box::new(task("flaky", "/bin/flaky"))));

        let (_, status) = h.run(&plan).await;
        assert_eq!(status, BuildStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_errors_step() {
        let h = Harness::new().await;
        h.client.script("/bin/slow", FakeProcess::hanging());
        let plan = Plan::new(
            "deadline",
            PlanKind::Timeout {
                duration_secs: 1,
                step: Box::new(task("slow", "/bin/slow")),
            },
        );

        let (build, status) = h.run(&plan).await;
        assert_eq!(status, BuildStatus::Errored);
        let events = h.events(&build).await;
        assert!(events.iter().any(|e| is_error_for(e, "deadline", "timeout exceeded")));
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let h = Harness::new().await;
        h.client.script("/bin/flaky", FakeProcess::exit(1));
        h.client.script("/bin/flaky", FakeProcess::exit(1));
        h.client.script("/bin/flaky", FakeProcess::exit(0));
        let plan = Plan::new(
            "retry",
            PlanKind::Retry {
                attempts: 5,
                step: Box::new(task("flaky", "/bin/flaky")),
            },
        );

        let (_, status) = h.run(&plan).await;
        assert_eq!(status, BuildStatus::Succeeded);
        assert_eq!(h.client.calls_to("/bin/flaky").len(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted_keeps_last_outcome() {
        let h = Harness::new().await;
        h.client.script("/bin/broken", FakeProcess::exit(1));
        let plan = Plan::new(
            "retry",
            PlanKind::Retry {
                attempts: 2,
                step: Box::new(task("broken", "/bin/broken")),
            },
        );

        let (_, status) = h.run(&plan).await;
        assert_eq!(status, BuildStatus::Failed);
        assert_eq!(h.client.calls_to("/bin/broken").len(), 2);
    }

    #[tokio::test]
    async fn test_abort_runs_on_abort_and_ensure() {
        let h = Harness::new().await;
        h.client.script("/bin/long", FakeProcess::hanging());
        let mut long = task("long", "/bin/long");
        long.hooks.on_abort = Some(Box::new(task("report", "/bin/report")));
        long.hooks.ensure = Some(Box::new(task("cleanup", "/bin/cleanup")));
        let build = h.start(&seq("root", vec![long, task("after", "/bin/after")])).await;

        let engine = h.engine();
        let run = tokio::spawn({
            let build = build.clone();
            async move { engine.run_build(build, CancellationToken::new()).await }
        });
        h.wait_for_call("/bin/long").await;
        h.store.request_abort(build.id).await.unwrap();

        let status = run.await.unwrap().unwrap();
        assert_eq!(status, Some(BuildStatus::Aborted));
        assert_eq!(h.client.calls_to("/bin/report").len(), 1);
        assert_eq!(h.client.calls_to("/bin/cleanup").len(), 1);
        assert!(h.client.calls_to("/bin/after").is_empty());
        let events = h.events(&build).await;
        assert!(events.iter().any(|e| is_error_for(e, "long", "interrupted")));
    }

    #[tokio::test]
    async fn test_stop_releases_build_unfinished() {
        let h = Harness::new().await;
        h.client.script("/bin/long", FakeProcess::hanging());
        let build = h.start(&task("long", "/bin/long")).await;

        let stop = CancellationToken::new();
        let engine = h.engine();
        let run = tokio::spawn({
            let (build, stop) = (build.clone(), stop.clone());
            async move { engine.run_build(build, stop).await }
        });
        h.wait_for_call("/bin/long").await;
        stop.cancel();

        assert_eq!(run.await.unwrap().unwrap(), None);
        let stored = h.store.build(build.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BuildStatus::Started);
    }
}
