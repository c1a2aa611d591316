//! Claims queued checks and runs them.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, stream};
use skyway_component::Task;
use skyway_core::check::{Check, CheckStatus, CheckTarget};
use skyway_core::component::leases;
use skyway_core::ids::TeamId;
use skyway_core::plan::CheckPlan;
use skyway_core::ports::CheckRepository;
use skyway_core::resource::ResourceVersion;
use skyway_core::vars::interpolate_map;
use skyway_core::{Error, Result};
use skyway_engine::{EngineContext, run_check};
use skyway_trace::{CiAttributes, check_span};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

/// Added to a check's own timeout for the config lease, so the lease
/// outlives the check it guards.
const LEASE_MARGIN: Duration = Duration::from_secs(30);

pub struct Checker {
    ctx: Arc<EngineContext>,
    checks: Arc<dyn CheckRepository>,
    batch_size: usize,
}

impl Checker {
    pub fn new(ctx: Arc<EngineContext>, checks: Arc<dyn CheckRepository>, batch_size: usize) -> Self {
        Self {
            ctx,
            checks,
            batch_size: batch_size.max(1),
        }
    }

    /// Run one queued check under its config's lease. Returns whether the
    /// check was run here.
    pub async fn process(&self, check: &Check, cancel: &CancellationToken) -> Result<bool> {
        let config_id = check.resource_config_id;
        let ttl = Duration::from_secs(check.plan.timeout_secs) + LEASE_MARGIN;
        let Some(lease) = self
            .ctx
            .leases
            .acquire(&leases::resource_config_check(config_id), ttl)
            .await?
        else {
            debug!(check_id = %check.id, config_id = %config_id, "Config is being checked elsewhere");
            return Ok(false);
        };

        let result = self.claim_and_run(check, cancel).await;
        if let Err(e) = lease.release().await {
            warn!(config_id = %config_id, error = %e, "Failed to release check lease");
        }
        result
    }

    async fn claim_and_run(&self, check: &Check, cancel: &CancellationToken) -> Result<bool> {
        if !self.checks.claim_check(check.id).await? {
            return Ok(false);
        }
        let Some(team_id) = self.owning_team(check.target).await? else {
            debug!(check_id = %check.id, "Dropping check of deleted resource");
            self.checks.delete_check(check.id).await?;
            return Ok(false);
        };

        let start = Utc::now();
        let mut attrs = CiAttributes::new().resource_config(check.resource_config_id.get());
        attrs.team_id = Some(team_id.get());
        let result = self.execute(check, team_id, cancel).instrument(check_span(&attrs)).await;
        let configs = &self.ctx.configs;
        configs
            .update_last_check(check.resource_config_id, start, Utc::now(), result.is_ok())
            .await?;

        match result {
            Ok(versions) => {
                self.ctx.pipelines.set_check_error(check.target, None).await?;
                self.checks.finish_check(check.id, CheckStatus::Succeeded, None).await?;
                if !versions.is_empty() {
                    self.ctx
                        .pipelines
                        .request_schedule_for_config(check.resource_config_id)
                        .await?;
                }
                debug!(check_id = %check.id, versions = versions.len(), "Check succeeded");
            }
            Err(e) => {
                let message = e.to_string();
                warn!(check_id = %check.id, config_id = %check.resource_config_id, error = %message, "Check errored");
                self.ctx
                    .pipelines
                    .set_check_error(check.target, Some(message.clone()))
                    .await?;
                self.checks
                    .finish_check(check.id, CheckStatus::Errored, Some(message))
                    .await?;
            }
        }
        Ok(true)
    }

    async fn owning_team(&self, target: CheckTarget) -> Result<Option<TeamId>> {
        let pipelines = &self.ctx.pipelines;
        Ok(match target {
            CheckTarget::Resource(id) => pipelines.resource(id).await?.map(|r| r.team_id),
            CheckTarget::ResourceType(id) => pipelines.resource_type(id).await?.map(|t| t.team_id),
        })
    }

    async fn execute(&self, check: &Check, team_id: TeamId, cancel: &CancellationToken) -> Result<Vec<ResourceVersion>> {
        let (source, _) = interpolate_map(&check.plan.source, self.ctx.vars.as_ref()).await?;
        let plan = CheckPlan {
            source,
            from_version: check.from_version.clone(),
            ..check.plan.clone()
        };
        run_check(&self.ctx, check.resource_config_id, Some(team_id), &plan, None, cancel).await
    }
}

#[async_trait]
impl Task for Checker {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let pending = self.checks.pending_checks(self.batch_size).await?;
        if pending.is_empty() {
            return Ok(());
        }

        let runs: Vec<BoxFuture<'_, bool>> = pending
            .iter()
            .map(|check| {
                let cancel = cancel.clone();
                async move {
                    match self.process(check, &cancel).await {
                        Ok(ran) => ran,
                        Err(Error::Aborted) => false,
                        Err(e) => {
                            warn!(check_id = %check.id, error = %e, "Check processing failed");
                            false
                        }
                    }
                }
                .boxed()
            })
            .collect();
        let ran = stream::iter(runs)
            .buffer_unordered(self.batch_size)
            .collect::<Vec<bool>>()
            .await
            .into_iter()
            .filter(|ran| *ran)
            .count();

        info!(pending = pending.len(), ran, "Ran resource checks");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use pretty_assertions::assert_eq;
    use skyway_core::ports::*;
    use skyway_core::resource::{ResourceConfigDescriptor, Version};
    use skyway_worker::FakeProcess;

    const CHECK: &str = "/opt/resource/check";

    const PIPELINE: &str = r#"
resources:
  - name: repo
    type: git
    source: {uri: "((repo_uri))"}
jobs: []
"#;

    async fn queued(f: &Fixture) -> Check {
        f.scanner().run(CancellationToken::new()).await.unwrap();
        f.store.pending_checks(10).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_runs_queued_check_with_resolved_source() {
        let f = Fixture::new().await;
        let pipeline = f.pipeline(PIPELINE).await;
        f.client
            .script(CHECK, FakeProcess::exit(0).stdout(r#"[{"ref":"a"},{"ref":"b"}]"#));
        let check = queued(&f).await;

        f.checker().run(CancellationToken::new()).await.unwrap();

        assert!(f.store.pending_checks(10).await.unwrap().is_empty());
        let stdin = f.client.calls_to(CHECK)[0].spec.stdin.clone().unwrap();
        let request: serde_json::Value = serde_json::from_slice(&stdin).unwrap();
        assert_eq!(request["source"]["uri"], serde_json::json!("https://example.com/repo.git"));

        let latest = f.store.latest_version(check.resource_config_id).await.unwrap().unwrap();
        assert_eq!(latest.version, Version::new().with("ref", "b"));
        let config = f.store.config(check.resource_config_id).await.unwrap().unwrap();
        assert!(config.last_check_succeeded);
        assert!(f.resource(&pipeline, "repo").await.check_error.is_none());
    }

    #[tokio::test]
    async fn test_failed_check_records_error() {
        let f = Fixture::new().await;
        let pipeline = f.pipeline(PIPELINE).await;
        f.client
            .script(CHECK, FakeProcess::exit(1).stderr("fatal: repository not found\n"));
        let check = queued(&f).await;

        f.checker().run(CancellationToken::new()).await.unwrap();

        let repo = f.resource(&pipeline, "repo").await;
        assert!(repo.check_error.unwrap().contains("repository not found"));
        let config = f.store.config(check.resource_config_id).await.unwrap().unwrap();
        assert!(!config.last_check_succeeded);
        assert!(config.last_check_end_time.is_some());
    }

    #[tokio::test]
    async fn test_success_clears_previous_error() {
        let f = Fixture::new().await;
        let pipeline = f.pipeline(PIPELINE).await;
        let repo = f.resource(&pipeline, "repo").await;
        f.store
            .set_check_error(CheckTarget::Resource(repo.id), Some("old failure".to_string()))
            .await
            .unwrap();
        queued(&f).await;

        f.checker().run(CancellationToken::new()).await.unwrap();

        assert!(f.resource(&pipeline, "repo").await.check_error.is_none());
    }

    #[tokio::test]
    async fn test_leased_config_stays_queued() {
        let f = Fixture::new().await;
        f.pipeline(PIPELINE).await;
        let check = queued(&f).await;
        assert!(
            f.store
                .try_acquire(
                    &leases::resource_config_check(check.resource_config_id),
                    "other-web",
                    Duration::from_secs(60),
                )
                .await
                .unwrap()
        );

        f.checker().run(CancellationToken::new()).await.unwrap();

        assert!(f.client.calls_to(CHECK).is_empty());
        assert_eq!(f.store.pending_checks(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_check_reports_from_latest_version() {
        let f = Fixture::new().await;
        f.pipeline(PIPELINE).await;
        let config = f
            .store
            .find_or_create_config(&ResourceConfigDescriptor::new("git", repo_source()))
            .await
            .unwrap();
        f.store
            .save_versions(config.id, &[Version::new().with("ref", "a")])
            .await
            .unwrap();
        let check = queued(&f).await;
        assert_eq!(check.from_version, Some(Version::new().with("ref", "a")));

        f.checker().run(CancellationToken::new()).await.unwrap();

        let stdin = f.client.calls_to(CHECK)[0].spec.stdin.clone().unwrap();
        let request: serde_json::Value = serde_json::from_slice(&stdin).unwrap();
        assert_eq!(request["version"], serde_json::json!({"ref": "a"}));
    }
}
