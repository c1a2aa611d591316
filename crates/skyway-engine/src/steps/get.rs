//! The `get` step.

use super::fetch::{self, Caller, FetchRequest};
use super::{OUTPUT_BUFFER, announce_worker, interpolate, pump_output, step_time};
use crate::context::RunState;
use crate::image::required_base_type;
use chrono::Utc;
use skyway_core::events::{Event, FinishGetPayload, Origin};
use skyway_core::ids::PlanId;
use skyway_core::plan::GetPlan;
use skyway_core::resource::Version;
use skyway_core::worker::Worker;
use skyway_core::{Error, Result};
use skyway_worker::{ArtifactVolume, resolve_resource_image};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub async fn run(state: &RunState, plan_id: &PlanId, plan: &GetPlan, cancel: &CancellationToken) -> Result<bool> {
    let ctx = &state.ctx;
    state.emitter.emit(Event::InitializeGet(step_time(plan_id))).await?;

    let source = interpolate(state, &plan.source).await?;
    let params = interpolate(state, &plan.params).await?;
    if let Some(version) = &plan.version {
        ensure_enabled(state, plan, version).await?;
    }

    let caller = Caller::Step {
        build_id: state.build().id,
        plan_id: plan_id.clone(),
        team_id: state.build().team_id,
    };
    let request = FetchRequest {
        type_name: &plan.type_name,
        source: &source,
        params: &params,
        version: plan.version.clone(),
        resource_types: &plan.resource_types,
    };

    let worker = choose_worker(state, &caller, &request, plan, cancel).await?;
    announce_worker(state, plan_id, &worker).await?;
    state.emitter.emit(Event::StartGet(step_time(plan_id))).await?;

    let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
    let pump = pump_output(rx, state.emitter.stdout(plan_id), state.emitter.stderr(plan_id));
    let (fetched, ()) = tokio::join!(fetch::fetch(ctx, &caller, request, &worker, Some(tx), cancel), pump);

    let fetched = match fetched {
        Ok(fetched) => fetched,
        Err(Error::ResourceScriptFailed { exit_status, .. }) => {
            finish(state, plan_id, exit_status, None, Vec::new()).await?;
            return Ok(false);
        }
        Err(e) => return Err(e),
    };

    state.artifacts.register(
        plan.name.clone(),
        ArtifactVolume {
            handle: fetched.volume.clone(),
            worker_name: worker.name.clone(),
        },
    );
    if plan.resource.is_some() && !fetched.cache_hit {
        ctx.versions
            .update_metadata(fetched.config_id, &fetched.version, &fetched.metadata)
            .await?;
    }

    finish(state, plan_id, 0, Some(fetched.version), fetched.metadata).await?;
    Ok(true)
}

async fn finish(
    state: &RunState,
    plan_id: &PlanId,
    exit_status: i32,
    version: Option<Version>,
    metadata: Vec<skyway_core::resource::MetadataField>,
) -> Result<()> {
    state
        .emitter
        .emit(Event::FinishGet(FinishGetPayload {
            origin: Origin::new(plan_id.clone()),
            time: Utc::now(),
            exit_status,
            version,
            metadata,
        }))
        .await?;
    Ok(())
}

/// A pinned or scheduled version of a pipeline resource may have been
/// disabled since the plan was made.
async fn ensure_enabled(state: &RunState, plan: &GetPlan, version: &Version) -> Result<()> {
    let (Some(name), Some(pipeline_id)) = (&plan.resource, state.build().pipeline_id) else {
        return Ok(());
    };
    let ctx = &state.ctx;
    let resources = ctx.pipelines.resources(pipeline_id).await?;
    let Some(resource) = resources.iter().find(|r| &r.name == name) else {
        return Ok(());
    };
    let Some(config_id) = resource.resource_config_id else {
        return Ok(());
    };
    if let Some(found) = ctx.versions.find_version(config_id, version).await?
        && !ctx.versions.is_version_enabled(resource.id, found.id).await?
    {
        debug!(resource = %name, version_id = %found.id, "Version disabled");
        return Err(Error::VersionNotAvailable);
    }
    Ok(())
}

/// A worker already holding the cache wins; otherwise the pool decides.
async fn choose_worker(
    state: &RunState,
    caller: &Caller,
    request: &FetchRequest<'_>,
    plan: &GetPlan,
    cancel: &CancellationToken,
) -> Result<Worker> {
    let ctx = &state.ctx;
    let image = resolve_resource_image(&plan.type_name, &plan.resource_types)?;
    let spec = state.worker_spec(None, &plan.tags, required_base_type(&image)?);

    if let Some(version) = &request.version {
        let (_, cache) = fetch::find_cache(ctx, caller, request, version).await?;
        for worker in ctx.pool.satisfying(&spec).await? {
            if ctx.volumes.find_cache_volume(&worker.name, cache.id).await?.is_some() {
                debug!(worker = %worker.name, cache_id = %cache.id, "Worker already holds the cache");
                return Ok(worker);
            }
        }
    }
    ctx.pool.choose_for(&spec, &[], cancel).await
}
