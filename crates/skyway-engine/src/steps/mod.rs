//! Leaf steps. Each returns `Ok(true)` on success, `Ok(false)` when the
//! step ran but failed, and `Err` when it could not run at all.

pub mod check;
pub(crate) mod fetch;
pub mod get;
pub mod put;
pub mod set_pipeline;
pub mod task;

use crate::context::RunState;
use chrono::Utc;
use skyway_core::Result;
use skyway_core::events::{Event, Origin, SelectedWorkerPayload, StepTime};
use skyway_core::ids::{PlanId, VolumeHandle};
use skyway_core::resource::Source;
use skyway_core::vars::interpolate_map;
use skyway_core::worker::{Worker, WorkerSpec};
use skyway_events::LogSink;
use skyway_worker::{OutputChunk, OutputStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub(crate) const OUTPUT_BUFFER: usize = 64;

pub(crate) fn step_time(plan_id: &PlanId) -> StepTime {
    StepTime {
        origin: Origin::new(plan_id.clone()),
        time: Utc::now(),
    }
}

/// Resolve `((vars))` in a source or params map and remember the resolved
/// values for redaction.
pub(crate) async fn interpolate(state: &RunState, map: &Source) -> Result<Source> {
    let (resolved, secrets) = interpolate_map(map, state.ctx.vars.as_ref()).await?;
    state.emitter.track_secrets(secrets);
    Ok(resolved)
}

pub(crate) async fn select_worker(
    state: &RunState,
    plan_id: &PlanId,
    spec: &WorkerSpec,
    inputs: &[VolumeHandle],
    cancel: &CancellationToken,
) -> Result<Worker> {
    let worker = state.ctx.pool.choose_for(spec, inputs, cancel).await?;
    announce_worker(state, plan_id, &worker).await?;
    Ok(worker)
}

pub(crate) async fn announce_worker(state: &RunState, plan_id: &PlanId, worker: &Worker) -> Result<()> {
    state
        .emitter
        .emit(Event::SelectedWorker(SelectedWorkerPayload {
            origin: Origin::new(plan_id.clone()),
            worker_name: worker.name.clone(),
            time: Utc::now(),
        }))
        .await?;
    Ok(())
}

/// Copy process output into the step's log until every sender is gone.
/// Write failures are logged and draining continues so the process is
/// never blocked on its output.
pub(crate) async fn pump_output(mut rx: mpsc::Receiver<OutputChunk>, mut stdout: LogSink, mut stderr: LogSink) {
    while let Some(chunk) = rx.recv().await {
        let sink = match chunk.stream {
            OutputStream::Stdout => &mut stdout,
            OutputStream::Stderr => &mut stderr,
        };
        if let Err(e) = sink.write(&chunk.data).await {
            warn!(error = %e, "Failed to record step output");
        }
    }
    for sink in [&mut stdout, &mut stderr] {
        if let Err(e) = sink.flush().await {
            warn!(error = %e, "Failed to flush step output");
        }
    }
}
