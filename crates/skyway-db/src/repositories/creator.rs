//! PostgreSQL implementation of BuildCreator.

use super::build::{BUILD_COLUMNS, row_to_build, seal_plan};
use super::{notify, refresh_job_pointers};
use crate::db_err;
use async_trait::async_trait;
use skyway_core::build::{Build, BuildStatus, rerun_name};
use skyway_core::events::Event;
use skyway_core::ids::*;
use skyway_core::job::Job;
use skyway_core::plan::Plan;
use skyway_core::ports::{BuildCreator, EncryptionStrategy, EventStore};
use skyway_core::{Error, Result, channels};
use sqlx::{PgConnection, PgPool, Row};
use std::sync::Arc;
use tracing::debug;

/// Rerun names can collide when two reruns of one build race.
const RERUN_ATTEMPTS: usize = 5;

/// Creates builds and initializes their event streams.
pub struct PgBuildCreator {
    pool: PgPool,
    strategy: Arc<dyn EncryptionStrategy>,
    events: Arc<dyn EventStore>,
}

impl PgBuildCreator {
    pub fn new(pool: PgPool, strategy: Arc<dyn EncryptionStrategy>, events: Arc<dyn EventStore>) -> Self {
        Self { pool, strategy, events }
    }

    /// Bump the job's build counter and insert a pending build.
    async fn insert_job_build(&self, conn: &mut PgConnection, job: &Job, manually_triggered: bool) -> Result<Build> {
        let seq: i64 = sqlx::query(
            "UPDATE jobs SET build_number_seq = build_number_seq + 1 WHERE id = $1 RETURNING build_number_seq",
        )
        .bind(job.id.get())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::JobNotFound(job.id.to_string()))?
        .get("build_number_seq");

        let row = sqlx::query(&format!(
            "INSERT INTO builds (name, status, manually_triggered, team_id, pipeline_id, job_id) \
             VALUES ($1, 'pending', $2, $3, $4, $5) RETURNING {BUILD_COLUMNS}"
        ))
        .bind(seq.to_string())
        .bind(manually_triggered)
        .bind(job.team_id.get())
        .bind(job.pipeline_id.get())
        .bind(job.id.get())
        .fetch_one(&mut *conn)
        .await
        .map_err(db_err)?;

        refresh_job_pointers(conn, job.id).await?;
        row_to_build(self.strategy.as_ref(), &row)
    }

    async fn try_rerun(&self, job: &Job, source: &Build) -> Result<Build> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let original_id = source.rerun_of.unwrap_or(source.id);

        let original = sqlx::query(
            r#"SELECT name, (SELECT COALESCE(MAX(rerun_number), 0) + 1 FROM builds WHERE rerun_of = $1) AS n
               FROM builds WHERE id = $1"#,
        )
        .bind(original_id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::BuildNotFound(original_id.to_string()))?;
        let n: i32 = original.get("n");
        let name = rerun_name(&original.get::<String, _>("name"), n);

        let has_inputs = sqlx::query("SELECT 1 AS one FROM build_inputs WHERE build_id = $1 LIMIT 1")
            .bind(source.id.get())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .is_some();

        let row = sqlx::query(&format!(
            "INSERT INTO builds (name, status, team_id, pipeline_id, job_id, rerun_of, rerun_number, inputs_determined) \
             VALUES ($1, 'pending', $2, $3, $4, $5, $6, $7) RETURNING {BUILD_COLUMNS}"
        ))
        .bind(&name)
        .bind(job.team_id.get())
        .bind(job.pipeline_id.get())
        .bind(job.id.get())
        .bind(original_id.get())
        .bind(n)
        .bind(has_inputs)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let build = row_to_build(self.strategy.as_ref(), &row)?;

        sqlx::query(
            r#"INSERT INTO build_inputs (build_id, name, resource_id, version_id, first_occurrence)
               SELECT $1, name, resource_id, version_id, false FROM build_inputs WHERE build_id = $2"#,
        )
        .bind(build.id.get())
        .bind(source.id.get())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        refresh_job_pointers(&mut tx, job.id).await?;
        sqlx::query("UPDATE jobs SET schedule_requested = now() WHERE id = $1")
            .bind(job.id.get())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(build)
    }
}

#[async_trait]
impl BuildCreator for PgBuildCreator {
    async fn create_started_build(&self, team_id: TeamId, pipeline_id: Option<PipelineId>, plan: &Plan) -> Result<Build> {
        plan.validate()?;
        let (sealed, nonce) = seal_plan(self.strategy.as_ref(), plan)?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(&format!(
            "INSERT INTO builds (name, status, scheduled, inputs_determined, manually_triggered, team_id, \
                 pipeline_id, private_plan, nonce, public_plan, start_time) \
             VALUES (nextval('one_off_name')::text, 'started', true, true, true, $1, $2, $3, $4, $5, now()) \
             RETURNING {BUILD_COLUMNS}"
        ))
        .bind(team_id.get())
        .bind(pipeline_id.map(|p| p.get()))
        .bind(sealed)
        .bind(nonce)
        .bind(plan.public())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let build = row_to_build(self.strategy.as_ref(), &row)?;
        notify(&mut tx, channels::BUILD_STARTED).await?;
        tx.commit().await.map_err(db_err)?;

        self.events.initialize(&build).await?;
        self.events.put(&build, vec![Event::status(BuildStatus::Started)]).await?;
        debug!(build_id = %build.id, "One-off build started");
        Ok(build)
    }

    async fn create_build(&self, job: &Job) -> Result<Build> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let build = self.insert_job_build(&mut tx, job, true).await?;
        sqlx::query("UPDATE jobs SET schedule_requested = now() WHERE id = $1")
            .bind(job.id.get())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        self.events.initialize(&build).await?;
        Ok(build)
    }

    async fn rerun_build(&self, job: &Job, source: &Build) -> Result<Build> {
        let mut attempt = 0;
        let build = loop {
            attempt += 1;
            match self.try_rerun(job, source).await {
                Err(Error::UniqueViolation(msg)) if attempt < RERUN_ATTEMPTS => {
                    debug!(build_id = %source.id, attempt, error = %msg, "Rerun name collided, retrying");
                }
                other => break other?,
            }
        };

        self.events.initialize(&build).await?;
        Ok(build)
    }

    async fn ensure_pending_build_exists(&self, job: &Job) -> Result<Option<Build>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        // Serialize concurrent callers on the job row.
        sqlx::query("SELECT id FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job.id.get())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::JobNotFound(job.id.to_string()))?;

        // Any pending build counts, scheduled or rerun alike.
        let exists = sqlx::query("SELECT 1 AS one FROM builds WHERE job_id = $1 AND status = 'pending' LIMIT 1")
            .bind(job.id.get())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .is_some();
        if exists {
            return Ok(None);
        }

        let build = self.insert_job_build(&mut tx, job, false).await?;
        tx.commit().await.map_err(db_err)?;

        self.events.initialize(&build).await?;
        Ok(Some(build))
    }
}
