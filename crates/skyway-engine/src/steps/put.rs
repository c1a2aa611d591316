//! The `put` step, and the implicit `get` of what it produced.

use super::fetch::{self, Caller, FetchRequest};
use super::{OUTPUT_BUFFER, interpolate, pump_output, select_worker, step_time};
use crate::context::RunState;
use crate::image::{self, required_base_type};
use chrono::Utc;
use skyway_core::events::{Event, FinishPutPayload, Origin};
use skyway_core::ids::PlanId;
use skyway_core::plan::PutPlan;
use skyway_core::resource::{MetadataField, ResourceConfigDescriptor, Version};
use skyway_core::{Error, Result};
use skyway_worker::{
    ArtifactVolume, ContainerRequest, MountRequest, MountSource, ScriptContext, ScriptRequest, resolve_resource_image,
};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const PUT_DIR: &str = "/tmp/build/put";

pub async fn run(state: &RunState, plan_id: &PlanId, plan: &PutPlan, cancel: &CancellationToken) -> Result<bool> {
    let ctx = &state.ctx;
    let build = state.build();
    state.emitter.emit(Event::InitializePut(step_time(plan_id))).await?;

    let source = interpolate(state, &plan.source).await?;
    let params = interpolate(state, &plan.params).await?;

    let inputs: Vec<(String, ArtifactVolume)> = match &plan.inputs {
        None => state.artifacts.all(),
        Some(names) => names
            .iter()
            .map(|name| {
                state
                    .artifacts
                    .get(name)
                    .map(|volume| (name.clone(), volume))
                    .ok_or_else(|| Error::MissingArtifact(name.clone()))
            })
            .collect::<Result<_>>()?,
    };
    let handles: Vec<_> = inputs.iter().map(|(_, v)| v.handle.clone()).collect();

    let image_source = resolve_resource_image(&plan.type_name, &plan.resource_types)?;
    let spec = state.worker_spec(None, &plan.tags, required_base_type(&image_source)?);
    let worker = select_worker(state, plan_id, &spec, &handles, cancel).await?;

    let caller = Caller::Step {
        build_id: build.id,
        plan_id: plan_id.clone(),
        team_id: build.team_id,
    };
    let image = image::prepare(ctx, &caller, &image_source, &worker, Some(&state.artifacts), cancel).await?;

    let mut mounts = Vec::with_capacity(inputs.len());
    for (name, volume) in &inputs {
        let source_worker = ctx.pool.find_worker(&volume.worker_name).await?;
        mounts.push(MountRequest {
            path: format!("{PUT_DIR}/{name}"),
            source: MountSource::Copy {
                worker: source_worker,
                volume: volume.handle.clone(),
            },
        });
    }
    let (container, _) = ctx
        .provisioner
        .create_with_mounts(
            &worker,
            ContainerRequest {
                owner: state.step_owner(plan_id),
                rootfs: image.rootfs,
                privileged: image.privileged,
                env: BTreeMap::new(),
                mounts: Vec::new(),
            },
            Some(build.team_id),
            mounts,
        )
        .await?;

    state.emitter.emit(Event::StartPut(step_time(plan_id))).await?;

    let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
    let pump = pump_output(rx, state.emitter.stdout(plan_id), state.emitter.stderr(plan_id));
    let request = ScriptRequest::new(source.clone()).with_params(params);
    let put = async move {
        let script = ScriptContext {
            client: ctx.provisioner.client().as_ref(),
            worker: &worker,
            container: &container,
            stderr: Some(tx),
            cancel: cancel.clone(),
        };
        let result = script.put(&request, PUT_DIR).await;
        (result, worker)
    };
    let ((result, worker), ()) = tokio::join!(put, pump);

    let produced = match result {
        Ok(produced) => produced,
        Err(Error::ResourceScriptFailed { exit_status, .. }) => {
            finish(state, plan_id, exit_status, None, Vec::new()).await?;
            return Ok(false);
        }
        Err(e) => return Err(e),
    };
    info!(build_id = %build.id, resource = %plan.resource, "Put produced a version");

    let config = ctx
        .configs
        .find_or_create_config(&ResourceConfigDescriptor::new(&plan.type_name, source.clone()))
        .await?;
    let saved = ctx
        .versions
        .save_versions(config.id, std::slice::from_ref(&produced.version))
        .await?;
    ctx.versions
        .update_metadata(config.id, &produced.version, &produced.metadata)
        .await?;
    if let Some(pipeline_id) = build.pipeline_id
        && let Some(resource) = ctx
            .pipelines
            .resources(pipeline_id)
            .await?
            .into_iter()
            .find(|r| r.name == plan.resource)
        && let Some(version) = saved.iter().find(|v| v.version == produced.version)
    {
        ctx.builds.save_output(build.id, resource.id, version.id).await?;
    }

    let (mut version, mut metadata) = (produced.version, produced.metadata);
    if plan.get_after {
        let get_params = interpolate(state, &plan.get_params).await?;
        let fetched = fetch::fetch(
            ctx,
            &caller,
            FetchRequest {
                type_name: &plan.type_name,
                source: &source,
                params: &get_params,
                version: Some(version.clone()),
                resource_types: &plan.resource_types,
            },
            &worker,
            None,
            cancel,
        )
        .await?;
        debug!(build_id = %build.id, name = %plan.name, "Fetched put result");
        state.artifacts.register(
            plan.name.clone(),
            ArtifactVolume {
                handle: fetched.volume,
                worker_name: worker.name.clone(),
            },
        );
        version = fetched.version;
        if !fetched.metadata.is_empty() {
            metadata = fetched.metadata;
        }
    }

    finish(state, plan_id, 0, Some(version), metadata).await?;
    Ok(true)
}

async fn finish(
    state: &RunState,
    plan_id: &PlanId,
    exit_status: i32,
    version: Option<Version>,
    metadata: Vec<MetadataField>,
) -> Result<()> {
    state
        .emitter
        .emit(Event::FinishPut(FinishPutPayload {
            origin: Origin::new(plan_id.clone()),
            time: Utc::now(),
            exit_status,
            version,
            metadata,
        }))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::testing::*;
    use pretty_assertions::assert_eq;
    use skyway_core::build::BuildStatus;
    use skyway_core::events::Event;
    use skyway_core::plan::{Plan, PlanKind, PutPlan};
    use skyway_core::ports::*;
    use skyway_core::resource::{ResourceConfigDescriptor, Version};
    use skyway_worker::FakeProcess;

    fn put(id: &str, inputs: Option<Vec<&str>>, get_after: bool) -> Plan {
        let mut source = serde_json::Map::new();
        source.insert("uri".into(), serde_json::json!("https://example.com/repo.git"));
        Plan::new(
            id,
            PlanKind::Put(PutPlan {
                name: "repo".to_string(),
                resource: "repo".to_string(),
                type_name: "git".to_string(),
                source,
                params: Default::default(),
                inputs: inputs.map(|names| names.into_iter().map(String::from).collect()),
                tags: vec![],
                resource_types: vec![],
                get_after,
                get_params: Default::default(),
            }),
        )
    }

    #[tokio::test]
    async fn test_put_stages_inputs_and_fetches_result() {
        let h = Harness::new().await;
        h.client.script(IN, FakeProcess::exit(0).stdout(version_json("abc")));
        h.client.script(IN, FakeProcess::exit(0).stdout(version_json("def")));
        h.client.script(OUT, FakeProcess::exit(0).stdout(version_json("def")).stderr("pushing\n"));

        let plan = seq(
            "do",
            vec![
                get("get", "repo", Some(Version::new().with("ref", "abc"))),
                put("put", Some(vec!["repo"]), true),
            ],
        );
        let (build, status) = h.run(&plan).await;
        assert_eq!(status, BuildStatus::Succeeded);

        let def = Version::new().with("ref", "def");
        let events = h.events(&build).await;
        assert!(
            events
                .iter()
                .any(|e| matches!(e, Event::FinishPut(f) if f.exit_status == 0 && f.version.as_ref() == Some(&def)))
        );
        assert_eq!(h.logs(&build, "put").await, "pushing\n");
        assert_eq!(h.client.calls_to(IN).len(), 2);

        let out = &h.client.calls_to(OUT)[0];
        let spec = h.client.container_spec(&out.container).unwrap();
        assert!(spec.mounts.iter().any(|m| m.path == "/tmp/build/put/repo"));

        let mut source = serde_json::Map::new();
        source.insert("uri".into(), serde_json::json!("https://example.com/repo.git"));
        let config = h
            .store
            .find_or_create_config(&ResourceConfigDescriptor::new("git", source))
            .await
            .unwrap();
        let latest = h.store.latest_version(config.id).await.unwrap().unwrap();
        assert_eq!(latest.version, def);
    }

    #[tokio::test]
    async fn test_put_script_failure_fails_step() {
        let h = Harness::new().await;
        h.client.script(OUT, FakeProcess::exit(1).stderr("rejected\n"));

        let (build, status) = h.run(&put("put", None, false)).await;
        assert_eq!(status, BuildStatus::Failed);
        let events = h.events(&build).await;
        assert!(
            events
                .iter()
                .any(|e| matches!(e, Event::FinishPut(f) if f.exit_status == 1 && f.version.is_none()))
        );
        assert!(h.client.calls_to(IN).is_empty());
    }

    #[tokio::test]
    async fn test_put_with_missing_input_errors() {
        let h = Harness::new().await;
        let (build, status) = h.run(&put("put", Some(vec!["nope"]), false)).await;
        assert_eq!(status, BuildStatus::Errored);
        assert!(h.client.calls_to(OUT).is_empty());
        let events = h.events(&build).await;
        assert!(events.iter().any(|e| is_error_for(e, "put", "missing artifact: nope")));
    }
}
