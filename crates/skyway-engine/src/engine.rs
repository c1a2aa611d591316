//! Drives one build from `started` to a terminal status.

use crate::context::{EngineConfig, EngineContext, RunState};
use crate::interpreter::Interpreter;
use crate::outcome::Outcome;
use futures::StreamExt;
use skyway_core::build::{Build, BuildStatus};
use skyway_core::channels;
use skyway_core::ports::NotificationStream;
use skyway_core::{Error, Result};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use skyway_trace::{CiAttributes, build_span};
use tracing::{Instrument, debug, info, warn};

pub struct Engine {
    ctx: Arc<EngineContext>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(ctx: Arc<EngineContext>, config: EngineConfig) -> Self {
        Self { ctx, config }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Run `build` to completion. A pending build is started first; if
    /// another driver got there, or `stop` fires before the plan finishes,
    /// returns `None` and leaves the build for someone else.
    pub async fn run_build(&self, build: Build, stop: CancellationToken) -> Result<Option<BuildStatus>> {
        let span = build_span(&CiAttributes::new().build(&build));
        self.drive(build, stop).instrument(span).await
    }

    async fn drive(&self, build: Build, stop: CancellationToken) -> Result<Option<BuildStatus>> {
        let id = build.id;
        let starting = build.status == BuildStatus::Pending;
        if starting && !self.ctx.builds.start_build(id).await? {
            debug!(build_id = %id, "Build not startable");
            return Ok(None);
        }

        // Listen before re-reading so an abort in between is not missed.
        let mut abort_signals = match self.ctx.bus.listen(&channels::build_abort(id)).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(build_id = %id, error = %e, "Cannot listen for aborts");
                None
            }
        };
        let build = self
            .ctx
            .builds
            .build(id)
            .await?
            .ok_or_else(|| Error::BuildNotFound(id.to_string()))?;
        if build.status.is_terminal() {
            return Ok(Some(build.status));
        }

        let abort = CancellationToken::new();
        if build.abort_requested {
            abort.cancel();
        }
        let plan = build.private_plan.clone();
        let state = RunState::new(self.ctx.clone(), self.config.clone(), build);
        if starting {
            state.emitter.status(BuildStatus::Started).await?;
        }
        info!(build_id = %id, name = %state.build().name, "Running build");

        let outcome = match plan {
            None => {
                state.emitter.error(None, "build has no plan").await?;
                Outcome::Errored
            }
            Some(plan) => {
                let interpreter = Interpreter::new(state);
                let run = interpreter.run(&plan, abort.clone());
                tokio::pin!(run);
                let outcome = tokio::select! {
                    outcome = &mut run => outcome,
                    _ = stop.cancelled() => {
                        info!(build_id = %id, "Releasing build");
                        return Ok(None);
                    }
                    never = watch_abort(abort_signals.as_mut(), &abort) => match never {},
                };
                return self.finish(interpreter.state(), outcome).await.map(Some);
            }
        };
        self.finish(&state, outcome).await.map(Some)
    }

    async fn finish(&self, state: &RunState, outcome: Outcome) -> Result<BuildStatus> {
        let build = state.build();
        let status = outcome.build_status();
        state.emitter.status(status).await?;
        self.ctx.builds.finish_build(build.id, status).await?;
        state.emitter.finalize().await?;
        info!(build_id = %build.id, status = %status.as_str(), "Build finished");
        Ok(status)
    }
}

/// Cancels `abort` on the first signal, then never completes.
async fn watch_abort(signals: Option<&mut NotificationStream>, abort: &CancellationToken) -> Infallible {
    if let Some(signals) = signals
        && signals.next().await.is_some()
    {
        debug!("Abort requested");
        abort.cancel();
    }
    std::future::pending().await
}
