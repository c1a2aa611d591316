//! The `task` step.

use super::fetch::Caller;
use super::{OUTPUT_BUFFER, announce_worker, interpolate, pump_output, step_time};
use crate::context::RunState;
use crate::image::{self, required_base_type};
use chrono::Utc;
use serde_json::Value;
use skyway_core::events::{Event, FinishTaskPayload, Origin};
use skyway_core::ids::{PlanId, VolumeHandle};
use skyway_core::plan::TaskPlan;
use skyway_core::ports::VolumeRequest;
use skyway_core::task::TaskConfig;
use skyway_core::worker::{ArtifactAssociation, VolumeAssociation, Worker};
use skyway_core::{Error, Result};
use skyway_worker::{
    ArtifactVolume, ContainerRequest, ImageSource, MountRequest, MountSource, ProcessSpec, resolve_task_image,
};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub(crate) const WORKDIR: &str = "/tmp/build/workdir";

pub async fn run(state: &RunState, plan_id: &PlanId, plan: &TaskPlan, cancel: &CancellationToken) -> Result<bool> {
    let ctx = &state.ctx;
    state.emitter.emit(Event::InitializeTask(step_time(plan_id))).await?;

    let mut config = load_config(state, plan).await?;
    let params = interpolate_params(state, &plan.params).await?;
    config.merge_params(&params);
    config.validate()?;

    let image_source = resolve_task_image(plan.image_artifact.as_deref(), &config, plan.privileged, &plan.resource_types)?;

    let mut inputs = Vec::new();
    for input in &config.inputs {
        let artifact_name = plan.input_mapping.get(&input.name).unwrap_or(&input.name);
        match state.artifacts.get(artifact_name) {
            Some(volume) => inputs.push((input.mount_path().to_string(), volume)),
            None if input.optional => debug!(input = %input.name, "Skipping missing optional input"),
            None => return Err(Error::MissingArtifact(artifact_name.clone())),
        }
    }
    let handles: Vec<VolumeHandle> = inputs.iter().map(|(_, v)| v.handle.clone()).collect();

    let spec = state.worker_spec(
        Some(config.platform.clone()),
        &plan.tags,
        required_base_type(&image_source)?,
    );
    let (worker, slot) = ctx.pool.choose_for_task(&spec, &handles, cancel).await?;
    let result = run_on(state, plan_id, plan, &config, &image_source, &inputs, &worker, cancel).await;
    if let Some(slot) = slot {
        slot.release().await;
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_on(
    state: &RunState,
    plan_id: &PlanId,
    plan: &TaskPlan,
    config: &TaskConfig,
    image_source: &ImageSource,
    inputs: &[(String, ArtifactVolume)],
    worker: &Worker,
    cancel: &CancellationToken,
) -> Result<bool> {
    let ctx = &state.ctx;
    let build = state.build();
    announce_worker(state, plan_id, worker).await?;

    let caller = Caller::Step {
        build_id: build.id,
        plan_id: plan_id.clone(),
        team_id: build.team_id,
    };
    let image = image::prepare(ctx, &caller, image_source, worker, Some(&state.artifacts), cancel).await?;

    let mut mounts = Vec::new();
    for (path, volume) in inputs {
        mounts.push(MountRequest {
            path: in_workdir(path),
            source: MountSource::Copy {
                worker: ctx.pool.find_worker(&volume.worker_name).await?,
                volume: volume.handle.clone(),
            },
        });
    }
    let first_output = mounts.len();
    for output in &config.outputs {
        mounts.push(MountRequest::empty(in_workdir(output.mount_path())));
    }
    for cache in &config.caches {
        let source = cache_volume(state, plan, worker, &cache.path).await?;
        mounts.push(MountRequest {
            path: in_workdir(&cache.path),
            source,
        });
    }

    let (container, volumes) = ctx
        .provisioner
        .create_with_mounts(
            worker,
            ContainerRequest {
                owner: state.step_owner(plan_id),
                rootfs: image.rootfs,
                privileged: plan.privileged,
                env: BTreeMap::new(),
                mounts: Vec::new(),
            },
            Some(build.team_id),
            mounts,
        )
        .await?;

    let process = ProcessSpec {
        path: config.run.path.clone(),
        args: config.run.args.clone(),
        dir: Some(config.run.dir.as_deref().map_or_else(|| WORKDIR.to_string(), in_workdir)),
        user: config.run.user.clone(),
        env: config.params.clone(),
        stdin: None,
    };

    state.emitter.emit(Event::StartTask(step_time(plan_id))).await?;
    info!(build_id = %build.id, task = %plan.name, worker = %worker.name, "Running task");

    let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
    let pump = pump_output(rx, state.emitter.stdout(plan_id), state.emitter.stderr(plan_id));
    let client = ctx.provisioner.client();
    let (status, ()) = tokio::join!(
        client.run_process(worker, &container, &process, tx, cancel.clone()),
        pump
    );

    // Outputs are registered whatever the exit status so hooks can use them.
    for (output, handle) in config.outputs.iter().zip(volumes.iter().skip(first_output)) {
        let name = plan.output_mapping.get(&output.name).unwrap_or(&output.name);
        state.artifacts.register(
            name.clone(),
            ArtifactVolume {
                handle: handle.clone(),
                worker_name: worker.name.clone(),
            },
        );
    }

    let status = status?;
    debug!(build_id = %build.id, task = %plan.name, exit_status = status, "Task exited");
    state
        .emitter
        .emit(Event::FinishTask(FinishTaskPayload {
            origin: Origin::new(plan_id.clone()),
            time: Utc::now(),
            exit_status: status,
        }))
        .await?;
    Ok(status == 0)
}

async fn load_config(state: &RunState, plan: &TaskPlan) -> Result<TaskConfig> {
    let Some(path) = &plan.config_path else {
        return plan
            .config
            .clone()
            .ok_or_else(|| Error::InvalidTaskConfig("neither config nor file given".to_string()));
    };
    let (artifact, file) = state
        .artifacts
        .resolve_path(path)
        .ok_or_else(|| Error::MissingArtifact(path.clone()))?;
    let worker = state.ctx.pool.find_worker(&artifact.worker_name).await?;
    let raw = state
        .ctx
        .provisioner
        .client()
        .read_file(&worker, &artifact.handle, file)
        .await?;
    TaskConfig::from_yaml(&raw)
}

async fn interpolate_params(state: &RunState, params: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
    let map = params
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let resolved = interpolate(state, &map).await?;
    Ok(resolved
        .into_iter()
        .map(|(k, v)| match v {
            Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect())
}

/// Job builds share a cache volume per job, step and path on each worker;
/// one-off builds start empty.
async fn cache_volume(state: &RunState, plan: &TaskPlan, worker: &Worker, path: &str) -> Result<MountSource> {
    let build = state.build();
    let Some(job_id) = build.job_id else {
        return Ok(MountSource::Empty);
    };
    let ctx = &state.ctx;
    if let Some(volume) = ctx
        .volumes
        .find_task_cache_volume(&worker.name, job_id, &plan.name, path)
        .await?
    {
        return Ok(MountSource::Existing(volume.handle));
    }

    let volume = ctx
        .provisioner
        .create_volume(
            worker,
            VolumeRequest {
                team_id: Some(build.team_id),
                association: Some(VolumeAssociation::TaskCache {
                    job_id,
                    step_name: plan.name.clone(),
                    path: path.to_string(),
                }),
                path: path.to_string(),
                ..VolumeRequest::default()
            },
        )
        .await?;
    let artifact = ctx
        .artifacts
        .create_artifact(path, Some(build.id), Some(&worker.name))
        .await?;
    ctx.artifacts
        .initialize_artifact(
            artifact.id,
            Some(ArtifactAssociation::TaskCache {
                job_id,
                step_name: plan.name.clone(),
            }),
        )
        .await?;
    debug!(job_id = %job_id, step = %plan.name, path, worker = %worker.name, "Created task cache");
    Ok(MountSource::Existing(volume.handle))
}

fn in_workdir(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{WORKDIR}/{}", path.trim_start_matches("./"))
    }
}
