//! PostgreSQL implementation of BuildRepository.

use super::{from_json, notify, refresh_job_pointers, touch_versions};
use crate::db_err;
use async_trait::async_trait;
use skyway_core::build::{Build, BuildInput, BuildOutput, BuildStatus};
use skyway_core::channels;
use skyway_core::ids::*;
use skyway_core::pipeline::JobDefinition;
use skyway_core::plan::Plan;
use skyway_core::ports::{BuildRepository, EncryptionStrategy};
use skyway_core::{Error, Result};
use sqlx::{PgPool, Row};
use std::sync::Arc;

pub(crate) const BUILD_COLUMNS: &str = "id, name, status, scheduled, manually_triggered, inputs_determined, \
     team_id, pipeline_id, job_id, rerun_of, rerun_number, private_plan, nonce, public_plan, abort_requested, \
     interceptible, create_time, start_time, end_time, reap_time";

const IN_FLIGHT: &str = "(status = 'started' OR (status = 'pending' AND scheduled))";

/// Encrypt a plan for the `private_plan` column.
pub(crate) fn seal_plan(strategy: &dyn EncryptionStrategy, plan: &Plan) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
    let plaintext = serde_json::to_vec(plan).map_err(|e| Error::Serialization(e.to_string()))?;
    strategy.encrypt(&plaintext)
}

pub(crate) fn row_to_build(strategy: &dyn EncryptionStrategy, r: &sqlx::postgres::PgRow) -> Result<Build> {
    let status: String = r.get("status");
    let sealed: Option<Vec<u8>> = r.get("private_plan");
    let nonce: Option<Vec<u8>> = r.get("nonce");
    let private_plan = match sealed {
        Some(ciphertext) => {
            let plaintext = strategy.decrypt(&ciphertext, nonce.as_deref())?;
            Some(serde_json::from_slice(&plaintext).map_err(|e| Error::Serialization(e.to_string()))?)
        }
        None => None,
    };

    Ok(Build {
        id: BuildId::new(r.get("id")),
        name: r.get("name"),
        status: BuildStatus::parse(&status)
            .ok_or_else(|| Error::Database(format!("unknown build status '{status}'")))?,
        scheduled: r.get("scheduled"),
        manually_triggered: r.get("manually_triggered"),
        inputs_determined: r.get("inputs_determined"),
        team_id: TeamId::new(r.get("team_id")),
        pipeline_id: r.get::<Option<i64>, _>("pipeline_id").map(PipelineId::new),
        job_id: r.get::<Option<i64>, _>("job_id").map(JobId::new),
        rerun_of: r.get::<Option<i64>, _>("rerun_of").map(BuildId::new),
        rerun_number: r.get("rerun_number"),
        private_plan,
        public_plan: r.get("public_plan"),
        abort_requested: r.get("abort_requested"),
        interceptible: r.get("interceptible"),
        create_time: r.get("create_time"),
        start_time: r.get("start_time"),
        end_time: r.get("end_time"),
        reap_time: r.get("reap_time"),
    })
}

/// PostgreSQL implementation of BuildRepository. Private plans are sealed
/// with the configured encryption strategy.
pub struct PgBuildRepository {
    pool: PgPool,
    strategy: Arc<dyn EncryptionStrategy>,
}

impl PgBuildRepository {
    pub fn new(pool: PgPool, strategy: Arc<dyn EncryptionStrategy>) -> Self {
        Self { pool, strategy }
    }

    async fn fetch_builds(&self, sql: &str, id: i64) -> Result<Vec<Build>> {
        let rows = sqlx::query(sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(|r| row_to_build(self.strategy.as_ref(), r)).collect()
    }
}

#[async_trait]
impl BuildRepository for PgBuildRepository {
    async fn build(&self, id: BuildId) -> Result<Option<Build>> {
        let row = sqlx::query(&format!("SELECT {BUILD_COLUMNS} FROM builds WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(|r| row_to_build(self.strategy.as_ref(), r)).transpose()
    }

    async fn pending_builds(&self, job_id: JobId) -> Result<Vec<Build>> {
        self.fetch_builds(
            &format!("SELECT {BUILD_COLUMNS} FROM builds WHERE job_id = $1 AND status = 'pending' ORDER BY id"),
            job_id.get(),
        )
        .await
    }

    async fn job_builds(&self, job_id: JobId) -> Result<Vec<Build>> {
        self.fetch_builds(
            &format!("SELECT {BUILD_COLUMNS} FROM builds WHERE job_id = $1 ORDER BY id DESC"),
            job_id.get(),
        )
        .await
    }

    async fn builds_to_track(&self) -> Result<Vec<Build>> {
        let rows = sqlx::query(&format!("SELECT {BUILD_COLUMNS} FROM builds WHERE {IN_FLIGHT} ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(|r| row_to_build(self.strategy.as_ref(), r)).collect()
    }

    async fn count_in_flight(&self, pipeline_id: PipelineId, serial_groups: &[String]) -> Result<usize> {
        let rows = sqlx::query(&format!(
            "SELECT j.config FROM builds b JOIN jobs j ON j.id = b.job_id \
             WHERE b.pipeline_id = $1 AND {}",
            IN_FLIGHT.replace("status", "b.status").replace("scheduled", "b.scheduled")
        ))
        .bind(pipeline_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut count = 0;
        for r in &rows {
            let config: JobDefinition = from_json(r.get("config"))?;
            if config.serial_groups().iter().any(|g| serial_groups.contains(g)) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn schedule_build(&self, id: BuildId, inputs: &[BuildInput], plan: &Plan) -> Result<bool> {
        let (sealed, nonce) = seal_plan(self.strategy.as_ref(), plan)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            r#"UPDATE builds SET scheduled = true, inputs_determined = true,
                   private_plan = $2, nonce = $3, public_plan = $4
               WHERE id = $1 AND status = 'pending' AND NOT scheduled
               RETURNING job_id"#,
        )
        .bind(id.get())
        .bind(sealed)
        .bind(nonce)
        .bind(plan.public())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(false);
        };
        let job_id: Option<i64> = row.get("job_id");

        sqlx::query("DELETE FROM build_inputs WHERE build_id = $1")
            .bind(id.get())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for input in inputs {
            sqlx::query(
                r#"INSERT INTO build_inputs (build_id, name, resource_id, version_id, first_occurrence)
                   VALUES ($1, $2, $3, $4, NOT EXISTS (
                       SELECT 1 FROM build_inputs i JOIN builds b ON b.id = i.build_id
                       WHERE b.job_id = $5 AND b.id <> $1 AND i.name = $2 AND i.version_id = $4))"#,
            )
            .bind(id.get())
            .bind(&input.name)
            .bind(input.resource_id.get())
            .bind(input.version_id.get())
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn start_build(&self, id: BuildId) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(
            "UPDATE builds SET status = 'started', start_time = now() \
             WHERE id = $1 AND status = 'pending' AND scheduled RETURNING job_id",
        )
        .bind(id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(false);
        };
        if let Some(job_id) = row.get::<Option<i64>, _>("job_id") {
            refresh_job_pointers(&mut tx, JobId::new(job_id)).await?;
        }
        notify(&mut tx, channels::BUILD_STARTED).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn finish_build(&self, id: BuildId, status: BuildStatus) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(
            "UPDATE builds SET status = $2, end_time = now() \
             WHERE id = $1 AND status IN ('pending', 'started') RETURNING job_id, pipeline_id",
        )
        .bind(id.get())
        .bind(status.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(());
        };

        if let Some(job_id) = row.get::<Option<i64>, _>("job_id") {
            refresh_job_pointers(&mut tx, JobId::new(job_id)).await?;
        }
        if let Some(pipeline_id) = row.get::<Option<i64>, _>("pipeline_id") {
            sqlx::query("UPDATE jobs SET schedule_requested = now() WHERE pipeline_id = $1")
                .bind(pipeline_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        touch_versions(&mut tx).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn request_abort(&self, id: BuildId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        // Nothing is driving a pending build; abort it in place.
        let row = sqlx::query(
            r#"UPDATE builds SET abort_requested = true,
                   end_time = CASE WHEN status = 'pending' THEN now() ELSE end_time END,
                   status = CASE WHEN status = 'pending' THEN 'aborted' ELSE status END
               WHERE id = $1 RETURNING job_id"#,
        )
        .bind(id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::BuildNotFound(id.to_string()))?;

        if let Some(job_id) = row.get::<Option<i64>, _>("job_id") {
            refresh_job_pointers(&mut tx, JobId::new(job_id)).await?;
        }
        notify(&mut tx, &channels::build_abort(id)).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn inputs(&self, id: BuildId) -> Result<Vec<BuildInput>> {
        let rows = sqlx::query(
            r#"SELECT i.name, i.resource_id, i.version_id, i.first_occurrence, v.version
               FROM build_inputs i JOIN resource_config_versions v ON v.id = i.version_id
               WHERE i.build_id = $1 ORDER BY i.name"#,
        )
        .bind(id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|r| {
                Ok(BuildInput {
                    name: r.get("name"),
                    resource_id: ResourceId::new(r.get("resource_id")),
                    version_id: VersionId::new(r.get("version_id")),
                    version: from_json(r.get("version"))?,
                    first_occurrence: r.get("first_occurrence"),
                })
            })
            .collect()
    }

    async fn outputs(&self, id: BuildId) -> Result<Vec<BuildOutput>> {
        let rows = sqlx::query(
            r#"SELECT o.resource_id, o.version_id, v.version
               FROM build_outputs o JOIN resource_config_versions v ON v.id = o.version_id
               WHERE o.build_id = $1"#,
        )
        .bind(id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|r| {
                Ok(BuildOutput {
                    resource_id: ResourceId::new(r.get("resource_id")),
                    version_id: VersionId::new(r.get("version_id")),
                    version: from_json(r.get("version"))?,
                })
            })
            .collect()
    }

    async fn save_output(&self, id: BuildId, resource_id: ResourceId, version_id: VersionId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            "INSERT INTO build_outputs (build_id, resource_id, version_id) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(id.get())
        .bind(resource_id.get())
        .bind(version_id.get())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        touch_versions(&mut tx).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn latest_inputs(&self, job_id: JobId) -> Result<Vec<BuildInput>> {
        let row = sqlx::query(
            r#"SELECT id FROM builds b WHERE job_id = $1
                 AND EXISTS (SELECT 1 FROM build_inputs i WHERE i.build_id = b.id)
               ORDER BY id DESC LIMIT 1"#,
        )
        .bind(job_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(r) => self.inputs(BuildId::new(r.get("id"))).await,
            None => Ok(Vec::new()),
        }
    }

    async fn interceptible_finished_builds(&self) -> Result<Vec<Build>> {
        let rows = sqlx::query(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE interceptible \
             AND status IN ('succeeded', 'failed', 'errored', 'aborted')"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(|r| row_to_build(self.strategy.as_ref(), r)).collect()
    }

    async fn set_interceptible(&self, id: BuildId, interceptible: bool) -> Result<()> {
        sqlx::query("UPDATE builds SET interceptible = $2 WHERE id = $1")
            .bind(id.get())
            .bind(interceptible)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn reapable_builds(&self, job_id: JobId) -> Result<Vec<Build>> {
        self.fetch_builds(
            &format!(
                "SELECT {BUILD_COLUMNS} FROM builds WHERE job_id = $1 AND reap_time IS NULL \
                 AND status IN ('succeeded', 'failed', 'errored', 'aborted') ORDER BY id DESC"
            ),
            job_id.get(),
        )
        .await
    }

    async fn mark_reaped(&self, ids: &[BuildId]) -> Result<()> {
        let ids: Vec<i64> = ids.iter().map(BuildId::get).collect();
        sqlx::query("UPDATE builds SET reap_time = now() WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Reversing;

    impl EncryptionStrategy for Reversing {
        fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
            Ok((plaintext.iter().rev().copied().collect(), Some(vec![1])))
        }

        fn decrypt(&self, ciphertext: &[u8], nonce: Option<&[u8]>) -> Result<Vec<u8>> {
            match nonce {
                Some(_) => Ok(ciphertext.iter().rev().copied().collect()),
                None => Ok(ciphertext.to_vec()),
            }
        }
    }

    #[test]
    fn test_seal_plan_uses_strategy() {
        let plan = Plan::new("1", skyway_core::plan::PlanKind::Do(vec![]));
        let (sealed, nonce) = seal_plan(&Reversing, &plan).unwrap();
        assert_eq!(nonce, Some(vec![1]));
        let opened = Reversing.decrypt(&sealed, nonce.as_deref()).unwrap();
        let back: Plan = serde_json::from_slice(&opened).unwrap();
        assert_eq!(back, plan);
    }

    #[test]
    fn test_in_flight_predicate_rewrites_for_join() {
        let rewritten = IN_FLIGHT.replace("status", "b.status").replace("scheduled", "b.scheduled");
        assert_eq!(rewritten, "(b.status = 'started' OR (b.status = 'pending' AND b.scheduled))");
    }
}
