//! Resource checks, both as a build step and for the checker component.

use super::fetch::{Caller, check_session_expiry};
use super::{OUTPUT_BUFFER, interpolate, pump_output, step_time};
use crate::context::{EngineContext, RunState};
use crate::image::{self, required_base_type};
use chrono::Utc;
use skyway_core::events::Event;
use skyway_core::ids::{ContainerHandle, PlanId, ResourceConfigId, TeamId};
use skyway_core::plan::CheckPlan;
use skyway_core::resource::{ResourceConfigDescriptor, ResourceVersion};
use skyway_core::worker::{ContainerOwner, ContainerState, Worker, WorkerSpec};
use skyway_core::{Error, Result};
use skyway_worker::{ContainerRequest, OutputChunk, ScriptContext, ScriptRequest, resolve_resource_image};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Run the type's `check` for `config_id` and save what it reports, in
/// order. `plan.source` must already be interpolated. The whole check,
/// worker selection and image fetch included, is bounded by
/// `plan.timeout_secs`.
pub async fn run_check(
    ctx: &EngineContext,
    config_id: ResourceConfigId,
    team_id: Option<TeamId>,
    plan: &CheckPlan,
    stderr: Option<mpsc::Sender<OutputChunk>>,
    cancel: &CancellationToken,
) -> Result<Vec<ResourceVersion>> {
    let bounded = cancel.child_token();
    let check = check_in_container(ctx, config_id, team_id, plan, stderr, &bounded);
    tokio::pin!(check);
    tokio::select! {
        result = &mut check => result,
        _ = tokio::time::sleep(Duration::from_secs(plan.timeout_secs)) => {
            bounded.cancel();
            let _ = check.await;
            if cancel.is_cancelled() {
                Err(Error::Aborted)
            } else {
                warn!(config_id = %config_id, timeout_secs = plan.timeout_secs, "Check timed out");
                Err(Error::StepTimeout)
            }
        }
    }
}

async fn check_in_container(
    ctx: &EngineContext,
    config_id: ResourceConfigId,
    team_id: Option<TeamId>,
    plan: &CheckPlan,
    stderr: Option<mpsc::Sender<OutputChunk>>,
    cancel: &CancellationToken,
) -> Result<Vec<ResourceVersion>> {
    let (worker, container) = check_container(ctx, config_id, team_id, plan, cancel).await?;
    let script = ScriptContext {
        client: ctx.provisioner.client().as_ref(),
        worker: &worker,
        container: &container,
        stderr,
        cancel: cancel.clone(),
    };
    let request = ScriptRequest::new(plan.source.clone()).with_version(plan.from_version.clone());
    let found = script.check(&request).await?;
    debug!(config_id = %config_id, worker = %worker.name, versions = found.len(), "Check finished");
    ctx.versions.save_versions(config_id, &found).await
}

/// Reuse a live check container for the config, or make one.
async fn check_container(
    ctx: &EngineContext,
    config_id: ResourceConfigId,
    team_id: Option<TeamId>,
    plan: &CheckPlan,
    cancel: &CancellationToken,
) -> Result<(Worker, ContainerHandle)> {
    if let Some(existing) = ctx.containers.find_check_container(config_id).await?
        && existing.state == ContainerState::Created
    {
        match ctx.pool.find_worker(&existing.worker_name).await {
            Ok(worker) => return Ok((worker, existing.handle)),
            Err(e) => debug!(config_id = %config_id, error = %e, "Check container's worker is gone"),
        }
    }

    let image_source = resolve_resource_image(&plan.type_name, &plan.resource_types)?;
    let spec = WorkerSpec {
        platform: None,
        tags: plan.tags.clone(),
        team_id,
        resource_type: required_base_type(&image_source)?,
    };
    let worker = ctx.pool.choose_for(&spec, &[], cancel).await?;
    let caller = Caller::Check { config_id, team_id };
    let image = image::prepare(ctx, &caller, &image_source, &worker, None, cancel).await?;
    let handle = ctx
        .provisioner
        .find_or_create_container(
            &worker,
            ContainerRequest {
                owner: ContainerOwner::CheckSession {
                    resource_config_id: config_id,
                    expires_at: check_session_expiry(),
                },
                rootfs: image.rootfs,
                privileged: image.privileged,
                env: BTreeMap::new(),
                mounts: Vec::new(),
            },
        )
        .await?;
    Ok((worker, handle))
}

/// A `check` step inside a build.
pub async fn run(state: &RunState, plan_id: &PlanId, plan: &CheckPlan, cancel: &CancellationToken) -> Result<bool> {
    let ctx = &state.ctx;
    state.emitter.emit(Event::Initialize(step_time(plan_id))).await?;

    let source = interpolate(state, &plan.source).await?;
    let config = ctx
        .configs
        .find_or_create_config(&ResourceConfigDescriptor::new(&plan.type_name, source.clone()))
        .await?;
    let plan = CheckPlan {
        source,
        ..plan.clone()
    };

    state.emitter.emit(Event::Start(step_time(plan_id))).await?;
    let start = Utc::now();
    let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
    let pump = pump_output(rx, state.emitter.stdout(plan_id), state.emitter.stderr(plan_id));
    let (result, ()) = tokio::join!(
        run_check(ctx, config.id, Some(state.build().team_id), &plan, Some(tx), cancel),
        pump
    );
    ctx.configs
        .update_last_check(config.id, start, Utc::now(), result.is_ok())
        .await?;

    let succeeded = match result {
        Ok(_) => true,
        Err(Error::ResourceScriptFailed { .. }) => false,
        Err(e) => return Err(e),
    };
    state.emitter.emit(Event::Finish(step_time(plan_id))).await?;
    Ok(succeeded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use pretty_assertions::assert_eq;
    use skyway_core::build::BuildStatus;
    use skyway_core::plan::{Plan, PlanKind};
    use skyway_core::ports::*;
    use skyway_core::resource::Version;
    use skyway_worker::FakeProcess;

    const CHECK: &str = "/opt/resource/check";

    fn check_plan(timeout_secs: u64) -> CheckPlan {
        let mut source = serde_json::Map::new();
        source.insert("uri".into(), serde_json::json!("https://example.com/repo.git"));
        CheckPlan {
            type_name: "git".to_string(),
            source,
            from_version: None,
            timeout_secs,
            tags: vec![],
            resource_types: vec![],
        }
    }

    #[tokio::test]
    async fn test_check_step_saves_versions_in_order() {
        let h = Harness::new().await;
        h.client
            .script(CHECK, FakeProcess::exit(0).stdout(r#"[{"ref":"a"},{"ref":"b"}]"#));

        let (_, status) = h.run(&Plan::new("check", PlanKind::Check(check_plan(60)))).await;
        assert_eq!(status, BuildStatus::Succeeded);

        let plan = check_plan(60);
        let config = h
            .store
            .find_or_create_config(&ResourceConfigDescriptor::new("git", plan.source))
            .await
            .unwrap();
        let latest = h.store.latest_version(config.id).await.unwrap().unwrap();
        assert_eq!(latest.version, Version::new().with("ref", "b"));
        let config = h.store.config(config.id).await.unwrap().unwrap();
        assert!(config.last_check_succeeded);
    }

    #[tokio::test]
    async fn test_check_step_script_failure_fails_step() {
        let h = Harness::new().await;
        h.client.script(CHECK, FakeProcess::exit(1).stderr("auth failed\n"));

        let (build, status) = h.run(&Plan::new("check", PlanKind::Check(check_plan(60)))).await;
        assert_eq!(status, BuildStatus::Failed);
        assert_eq!(h.logs(&build, "check").await, "auth failed\n");
    }

    #[tokio::test]
    async fn test_check_reuses_session_container() {
        let h = Harness::new().await;
        let plan = check_plan(60);
        let config = h
            .store
            .find_or_create_config(&ResourceConfigDescriptor::new("git", plan.source.clone()))
            .await
            .unwrap();
        let cancel = CancellationToken::new();

        run_check(&h.ctx, config.id, None, &plan, None, &cancel).await.unwrap();
        run_check(&h.ctx, config.id, None, &plan, None, &cancel).await.unwrap();

        let calls = h.client.calls_to(CHECK);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].container, calls[1].container);
        assert_eq!(h.client.live_containers(), 1);
    }

    #[tokio::test]
    async fn test_check_passes_from_version() {
        let h = Harness::new().await;
        let mut plan = check_plan(60);
        plan.from_version = Some(Version::new().with("ref", "a"));
        let config = h
            .store
            .find_or_create_config(&ResourceConfigDescriptor::new("git", plan.source.clone()))
            .await
            .unwrap();

        run_check(&h.ctx, config.id, None, &plan, None, &CancellationToken::new())
            .await
            .unwrap();

        let stdin = h.client.calls_to(CHECK)[0].spec.stdin.clone().unwrap();
        let request: serde_json::Value = serde_json::from_slice(&stdin).unwrap();
        assert_eq!(request["version"], serde_json::json!({"ref": "a"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_check_times_out() {
        let h = Harness::new().await;
        h.client.script(CHECK, FakeProcess::hanging());
        let plan = check_plan(1);
        let config = h
            .store
            .find_or_create_config(&ResourceConfigDescriptor::new("git", plan.source.clone()))
            .await
            .unwrap();

        let err = run_check(&h.ctx, config.id, None, &plan, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StepTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_check_is_aborted() {
        let h = Harness::new().await;
        h.client.script(CHECK, FakeProcess::hanging());
        let plan = check_plan(60);
        let config = h
            .store
            .find_or_create_config(&ResourceConfigDescriptor::new("git", plan.source.clone()))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = run_check(&h.ctx, config.id, None, &plan, None, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Aborted));
    }
}
