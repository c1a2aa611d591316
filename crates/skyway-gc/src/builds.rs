//! Build interceptibility and build log retention.

use crate::{GcContext, before};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skyway_component::Task;
use skyway_core::Result;
use skyway_core::build::Build;
use skyway_core::config::{CoreConfig, GcConfig};
use skyway_core::ids::BuildId;
use skyway_core::pipeline::BuildLogRetention;
use skyway_core::ports::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Marks finished builds non-interceptible once nothing can attach to
/// their containers any more.
pub struct BuildCollector {
    builds: Arc<dyn BuildRepository>,
    containers: Arc<dyn ContainerRepository>,
    one_off_grace: Duration,
    hijack_grace: Duration,
}

impl BuildCollector {
    pub fn new(builds: Arc<dyn BuildRepository>, containers: Arc<dyn ContainerRepository>, config: &GcConfig) -> Self {
        Self {
            builds,
            containers,
            one_off_grace: config.one_off_build_grace_period(),
            hijack_grace: config.hijack_grace_period(),
        }
    }
}

#[async_trait]
impl Task for BuildCollector {
    async fn run(&self, _cancel: CancellationToken) -> Result<()> {
        let builds = self.builds.interceptible_finished_builds().await?;
        if builds.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let hijack_cutoff = before(now, self.hijack_grace);
        let hijacked: HashSet<BuildId> = self
            .containers
            .containers()
            .await?
            .into_iter()
            .filter(|c| c.hijacked && c.last_hijack.is_some_and(|at| at >= hijack_cutoff))
            .filter_map(|c| c.owner.as_ref().and_then(|o| o.build_id()))
            .collect();

        let one_off_cutoff = before(now, self.one_off_grace);
        let mut marked = 0;
        for build in &builds {
            if hijacked.contains(&build.id) {
                continue;
            }
            if build.is_one_off() && build.end_time.is_some_and(|end| end >= one_off_cutoff) {
                continue;
            }
            self.builds.set_interceptible(build.id, false).await?;
            marked += 1;
        }

        if marked > 0 {
            info!(marked, "Marked builds non-interceptible");
        }
        Ok(())
    }
}

/// Deletes the event logs of builds that fell out of their job's
/// retention window.
pub struct BuildLogCollector {
    pipelines: Arc<dyn PipelineRepository>,
    builds: Arc<dyn BuildRepository>,
    events: Arc<dyn EventStore>,
    default_retention: BuildLogRetention,
    max_retention: BuildLogRetention,
    batch_size: usize,
}

impl BuildLogCollector {
    pub fn new(ctx: &GcContext, config: &CoreConfig) -> Self {
        Self {
            pipelines: ctx.pipelines.clone(),
            builds: ctx.builds.clone(),
            events: ctx.events.clone(),
            default_retention: config.default_retention(),
            max_retention: config.max_retention(),
            batch_size: config.gc.build_log_collector_batch_size.max(1),
        }
    }

    async fn reap(&self, builds: Vec<Build>) -> Result<usize> {
        let mut reaped = 0;
        for batch in builds.chunks(self.batch_size) {
            self.events.delete(batch).await?;
            let ids: Vec<BuildId> = batch.iter().map(|b| b.id).collect();
            self.builds.mark_reaped(&ids).await?;
            reaped += batch.len();
        }
        Ok(reaped)
    }
}

/// Builds to reap given the job's unreaped finished builds, newest first.
/// A build is kept only while it is inside both the count and the age
/// window; a zero limit does not constrain.
pub(crate) fn expired(builds: Vec<Build>, retention: BuildLogRetention, now: DateTime<Utc>) -> Vec<Build> {
    let age_cutoff = (retention.days > 0).then(|| before(now, Duration::from_secs(u64::from(retention.days) * 86_400)));
    builds
        .into_iter()
        .enumerate()
        .filter(|(position, build)| {
            let over_count = retention.builds > 0 && *position >= retention.builds as usize;
            let too_old = age_cutoff.is_some_and(|cutoff| build.end_time.is_some_and(|end| end < cutoff));
            over_count || too_old
        })
        .map(|(_, build)| build)
        .collect()
}

#[async_trait]
impl Task for BuildLogCollector {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let now = Utc::now();
        let mut reaped = 0;
        for pipeline in self.pipelines.pipelines().await? {
            for job in self.pipelines.jobs(pipeline.id).await? {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                let retention = job
                    .config
                    .effective_retention(self.default_retention, self.max_retention);
                if retention.builds == 0 && retention.days == 0 {
                    continue;
                }
                let doomed = expired(self.builds.reapable_builds(job.id).await?, retention, now);
                if doomed.is_empty() {
                    continue;
                }
                debug!(pipeline = %pipeline.name, job = %job.name, builds = doomed.len(), "Reaping build logs");
                reaped += self.reap(doomed).await?;
            }
        }

        if reaped > 0 {
            info!(reaped, "Reaped build logs");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use pretty_assertions::assert_eq;
    use skyway_core::build::BuildStatus;
    use skyway_core::events::{Event, StatusPayload};

    fn collector(f: &Fixture) -> BuildCollector {
        BuildCollector::new(f.store.clone(), f.store.clone(), &GcConfig::default())
    }

    #[tokio::test]
    async fn test_recent_one_off_build_stays_interceptible() {
        let f = Fixture::new().await;
        let build = f.finished_build().await;

        collector(&f).run(CancellationToken::new()).await.unwrap();

        assert!(f.store.build(build.id).await.unwrap().unwrap().interceptible);
    }

    #[tokio::test]
    async fn test_old_one_off_build_is_marked() {
        let f = Fixture::new().await;
        let build = f.finished_build().await;
        f.store
            .set_build_end_time(build.id, Utc::now() - chrono::Duration::minutes(10));

        collector(&f).run(CancellationToken::new()).await.unwrap();

        assert!(!f.store.build(build.id).await.unwrap().unwrap().interceptible);
        assert!(f.store.interceptible_finished_builds().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recently_hijacked_build_stays_interceptible() {
        let f = Fixture::new().await;
        let build = f.finished_build().await;
        f.store
            .set_build_end_time(build.id, Utc::now() - chrono::Duration::minutes(10));
        let container = f.build_container("w1", &build).await;
        f.store.mark_hijacked(&container.handle).await.unwrap();

        collector(&f).run(CancellationToken::new()).await.unwrap();

        assert!(f.store.build(build.id).await.unwrap().unwrap().interceptible);
    }

    const RETAINED: &str = r#"{"jobs": [{"name": "unit", "build_log_retention": {"builds": 2}, "plan": []}]}"#;

    async fn finished_job_builds(f: &Fixture, json: &str, count: usize) -> Vec<Build> {
        let pipeline = f.pipeline(json).await;
        let job = f.store.jobs(pipeline.id).await.unwrap().remove(0);
        let mut builds = Vec::new();
        for _ in 0..count {
            let build = f.store.create_build(&job).await.unwrap();
            f.store.finish_build(build.id, BuildStatus::Succeeded).await.unwrap();
            f.store
                .put(
                    &build,
                    vec![Event::Status(StatusPayload {
                        status: BuildStatus::Succeeded,
                        time: Utc::now(),
                    })],
                )
                .await
                .unwrap();
            builds.push(f.store.build(build.id).await.unwrap().unwrap());
        }
        builds
    }

    fn log_collector(f: &Fixture, config: &CoreConfig) -> BuildLogCollector {
        BuildLogCollector::new(&f.ctx, config)
    }

    #[tokio::test]
    async fn test_reaps_builds_beyond_count() {
        let f = Fixture::new().await;
        let builds = finished_job_builds(&f, RETAINED, 4).await;

        log_collector(&f, &CoreConfig::default())
            .run(CancellationToken::new())
            .await
            .unwrap();

        let reaped: Vec<bool> = futures::future::join_all(builds.iter().map(|b| f.store.build(b.id)))
            .await
            .into_iter()
            .map(|b| b.unwrap().unwrap().reap_time.is_some())
            .collect();
        assert_eq!(reaped, vec![true, true, false, false]);

        let page = EventStore::get(f.store.as_ref(), &builds[0], None, 100).await.unwrap();
        assert!(page.events.is_empty());
        let page = EventStore::get(f.store.as_ref(), &builds[3], None, 100).await.unwrap();
        assert!(!page.events.is_empty());
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let f = Fixture::new().await;
        let builds = finished_job_builds(&f, RETAINED, 3).await;
        let collector = log_collector(&f, &CoreConfig::default());

        collector.run(CancellationToken::new()).await.unwrap();
        let first = f.store.build(builds[0].id).await.unwrap().unwrap().reap_time;
        collector.run(CancellationToken::new()).await.unwrap();

        assert_eq!(f.store.build(builds[0].id).await.unwrap().unwrap().reap_time, first);
        assert!(f.store.build(builds[1].id).await.unwrap().unwrap().reap_time.is_none());
    }

    #[tokio::test]
    async fn test_unlimited_retention_keeps_everything() {
        let f = Fixture::new().await;
        let builds = finished_job_builds(&f, r#"{"jobs": [{"name": "unit", "plan": []}]}"#, 3).await;

        log_collector(&f, &CoreConfig::default())
            .run(CancellationToken::new())
            .await
            .unwrap();

        for build in builds {
            assert!(f.store.build(build.id).await.unwrap().unwrap().reap_time.is_none());
        }
    }

    #[tokio::test]
    async fn test_default_retention_applies_to_unconfigured_jobs() {
        let f = Fixture::new().await;
        let builds = finished_job_builds(&f, r#"{"jobs": [{"name": "unit", "plan": []}]}"#, 3).await;
        let config = CoreConfig {
            default_build_logs_to_retain: 1,
            ..CoreConfig::default()
        };

        log_collector(&f, &config).run(CancellationToken::new()).await.unwrap();

        assert!(f.store.build(builds[1].id).await.unwrap().unwrap().reap_time.is_some());
        assert!(f.store.build(builds[2].id).await.unwrap().unwrap().reap_time.is_none());
    }

    #[test]
    fn test_expired_by_age() {
        let now = Utc::now();
        let build = |days_ago: i64| Build {
            end_time: Some(now - chrono::Duration::days(days_ago)),
            ..test_build()
        };
        let doomed = expired(
            vec![build(0), build(1), build(5)],
            BuildLogRetention { builds: 0, days: 3 },
            now,
        );
        assert_eq!(doomed.len(), 1);
        assert_eq!(doomed[0].end_time, Some(now - chrono::Duration::days(5)));
    }

    fn test_build() -> Build {
        Build {
            id: BuildId::new(1),
            name: "1".to_string(),
            status: BuildStatus::Succeeded,
            scheduled: true,
            manually_triggered: false,
            inputs_determined: true,
            team_id: skyway_core::ids::TeamId::new(1),
            pipeline_id: None,
            job_id: None,
            rerun_of: None,
            rerun_number: 0,
            private_plan: None,
            public_plan: None,
            abort_requested: false,
            interceptible: true,
            create_time: Utc::now(),
            start_time: None,
            end_time: None,
            reap_time: None,
        }
    }
}
