//! The `set_pipeline` step: configure a pipeline from a file in an artifact.

use super::step_time;
use crate::context::RunState;
use serde_json::Value;
use skyway_core::events::Event;
use skyway_core::ids::PlanId;
use skyway_core::pipeline::PipelineDefinition;
use skyway_core::plan::SetPipelinePlan;
use skyway_core::validation;
use skyway_core::vars::{StaticVariables, interpolate};
use skyway_core::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub async fn run(state: &RunState, plan_id: &PlanId, plan: &SetPipelinePlan, _cancel: &CancellationToken) -> Result<bool> {
    let ctx = &state.ctx;
    let build = state.build();
    state.emitter.emit(Event::Initialize(step_time(plan_id))).await?;

    let (artifact, file) = state
        .artifacts
        .resolve_path(&plan.file)
        .ok_or_else(|| Error::MissingArtifact(plan.file.clone()))?;
    let worker = ctx.pool.find_worker(&artifact.worker_name).await?;
    let raw = ctx
        .provisioner
        .client()
        .read_file(&worker, &artifact.handle, file)
        .await?;

    let mut value: Value = serde_yaml::from_slice(&raw).map_err(|e| Error::InvalidPipeline(e.to_string()))?;
    if !plan.vars.is_empty() {
        let vars = StaticVariables::new(plan.vars.clone());
        value = interpolate(&value, &vars).await?.value;
    }
    let config: PipelineDefinition =
        serde_json::from_value(value).map_err(|e| Error::InvalidPipeline(e.to_string()))?;

    state.emitter.emit(Event::Start(step_time(plan_id))).await?;
    let mut stdout = state.emitter.stdout(plan_id);
    let mut stderr = state.emitter.stderr(plan_id);

    let report = validation::validate(&config);
    for warning in &report.warnings {
        stderr.write(&format!("WARNING: {warning}\n")).await?;
    }
    if !report.errors.is_empty() {
        stderr.write("invalid pipeline:\n").await?;
        for error in &report.errors {
            stderr.write(&format!("- {error}\n")).await?;
        }
        stderr.flush().await?;
        state.emitter.emit(Event::Finish(step_time(plan_id))).await?;
        return Ok(false);
    }

    let expected = ctx
        .pipelines
        .find_pipeline(build.team_id, &plan.name)
        .await?
        .map(|p| p.config_version);
    let saved = ctx
        .pipelines
        .save_pipeline(build.team_id, &plan.name, &config, expected, false)
        .await?;
    info!(
        build_id = %build.id,
        pipeline = %plan.name,
        created = saved.created,
        config_version = %saved.pipeline.config_version,
        "Pipeline set by build"
    );

    stdout
        .write(if saved.created { "pipeline created\n" } else { "pipeline updated\n" })
        .await?;
    stdout.flush().await?;
    stderr.flush().await?;
    state.emitter.emit(Event::Finish(step_time(plan_id))).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use crate::testing::*;
    use pretty_assertions::assert_eq;
    use skyway_core::build::BuildStatus;
    use skyway_core::plan::{Plan, PlanKind, SetPipelinePlan};
    use skyway_core::ports::*;
    use skyway_core::resource::Version;
    use skyway_worker::FakeProcess;

    const PIPELINE: &str = r#"
resources:
  - name: repo
    type: git
    source: {uri: "((repo_uri))"}
jobs:
  - name: unit
    plan:
      - get: {name: repo, trigger: true}
"#;

    const DUPLICATED: &str = r#"
resources:
  - name: repo
    type: git
  - name: repo
    type: git
jobs: []
"#;

    fn configure(vars: serde_json::Map<String, serde_json::Value>) -> Plan {
        seq(
            "do",
            vec![
                get("get", "ci", Some(Version::new().with("ref", "abc"))),
                Plan::new(
                    "set",
                    PlanKind::SetPipeline(SetPipelinePlan {
                        name: "app".to_string(),
                        file: "ci/pipeline.yml".to_string(),
                        vars,
                    }),
                ),
            ],
        )
    }

    fn script_file(h: &Harness, contents: &str) {
        h.client.script(
            IN,
            FakeProcess::exit(0)
                .stdout(version_json("abc"))
                .writes("/tmp/build/get/pipeline.yml", contents.to_string()),
        );
    }

    fn repo_vars() -> serde_json::Map<String, serde_json::Value> {
        let mut vars = serde_json::Map::new();
        vars.insert("repo_uri".into(), serde_json::json!("https://example.com/app.git"));
        vars
    }

    #[tokio::test]
    async fn test_creates_then_updates_pipeline() {
        let h = Harness::new().await;
        script_file(&h, PIPELINE);

        let (first, status) = h.run(&configure(repo_vars())).await;
        assert_eq!(status, BuildStatus::Succeeded);
        assert_eq!(h.logs(&first, "set").await, "pipeline created\n");

        let created = h.store.find_pipeline(h.team_id, "app").await.unwrap().unwrap();
        let resources = h.store.resources(created.id).await.unwrap();
        assert_eq!(
            resources[0].source.get("uri"),
            Some(&serde_json::json!("https://example.com/app.git"))
        );

        let (second, status) = h.run(&configure(repo_vars())).await;
        assert_eq!(status, BuildStatus::Succeeded);
        assert_eq!(h.logs(&second, "set").await, "pipeline updated\n");
        let updated = h.store.find_pipeline(h.team_id, "app").await.unwrap().unwrap();
        assert_eq!(updated.id, created.id);
        assert!(updated.config_version > created.config_version);
    }

    #[tokio::test]
    async fn test_invalid_pipeline_fails_without_saving() {
        let h = Harness::new().await;
        script_file(&h, DUPLICATED);

        let (build, status) = h.run(&configure(Default::default())).await;
        assert_eq!(status, BuildStatus::Failed);
        assert_eq!(
            h.logs(&build, "set").await,
            "WARNING: resource 'repo' is not used by any job\n\
             invalid pipeline:\n\
             - resource 'repo' is declared more than once\n"
        );
        assert!(h.store.find_pipeline(h.team_id, "app").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_file_errors() {
        let h = Harness::new().await;
        let plan = Plan::new(
            "set",
            PlanKind::SetPipeline(SetPipelinePlan {
                name: "app".to_string(),
                file: "ci/pipeline.yml".to_string(),
                vars: Default::default(),
            }),
        );
        let (build, status) = h.run(&plan).await;
        assert_eq!(status, BuildStatus::Errored);
        let events = h.events(&build).await;
        assert!(events.iter().any(|e| is_error_for(e, "set", "missing artifact: ci/pipeline.yml")));
    }
}
