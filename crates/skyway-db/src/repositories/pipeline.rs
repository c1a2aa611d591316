//! PostgreSQL implementation of PipelineRepository.

use super::{from_json, from_ms, to_json, to_ms, touch_versions};
use crate::db_err;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skyway_core::check::CheckTarget;
use skyway_core::ids::*;
use skyway_core::job::Job;
use skyway_core::pipeline::{JobDefinition, Pipeline, PipelineDefinition};
use skyway_core::ports::{PipelineRepository, SavedPipeline};
use skyway_core::resource::{Resource, ResourceType, Version};
use skyway_core::{Error, Result};
use sqlx::{PgConnection, PgPool, Row};
use tracing::debug;

const PIPELINE_COLUMNS: &str =
    "id, team_id, name, config_version, config, paused, archived, public, last_scheduled, created_at";

const RESOURCE_COLUMNS: &str = "id, pipeline_id, team_id, name, type_name, source, check_every_ms, \
     check_timeout_ms, tags, pinned_version, webhook_token, icon, paused, public, check_error, resource_config_id";

const RESOURCE_TYPE_COLUMNS: &str = "id, pipeline_id, team_id, name, type_name, source, params, privileged, \
     check_every_ms, tags, check_error, resource_config_id";

const JOB_COLUMNS: &str = "id, pipeline_id, team_id, name, config, paused, build_number_seq, \
     schedule_requested, next_build_id, latest_completed_build_id";

/// PostgreSQL implementation of PipelineRepository. Also owns the
/// resources, resource types and jobs derived from a pipeline's config.
pub struct PgPipelineRepository {
    pool: PgPool,
}

impl PgPipelineRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_pipeline(r: &sqlx::postgres::PgRow) -> Result<Pipeline> {
        Ok(Pipeline {
            id: PipelineId::new(r.get("id")),
            team_id: TeamId::new(r.get("team_id")),
            name: r.get("name"),
            config_version: ConfigVersion::new(r.get("config_version")),
            config: from_json(r.get("config"))?,
            paused: r.get("paused"),
            archived: r.get("archived"),
            public: r.get("public"),
            last_scheduled: r.get("last_scheduled"),
            created_at: r.get("created_at"),
        })
    }

    fn row_to_resource(r: &sqlx::postgres::PgRow) -> Result<Resource> {
        let pinned: Option<serde_json::Value> = r.get("pinned_version");
        Ok(Resource {
            id: ResourceId::new(r.get("id")),
            pipeline_id: PipelineId::new(r.get("pipeline_id")),
            team_id: TeamId::new(r.get("team_id")),
            name: r.get("name"),
            type_name: r.get("type_name"),
            source: from_json(r.get("source"))?,
            check_every: from_ms(r.get("check_every_ms")),
            check_timeout: from_ms(r.get("check_timeout_ms")),
            tags: r.get("tags"),
            pinned_version: pinned.map(from_json).transpose()?,
            webhook_token: r.get("webhook_token"),
            icon: r.get("icon"),
            paused: r.get("paused"),
            public: r.get("public"),
            check_error: r.get("check_error"),
            resource_config_id: r.get::<Option<i64>, _>("resource_config_id").map(ResourceConfigId::new),
        })
    }

    fn row_to_resource_type(r: &sqlx::postgres::PgRow) -> Result<ResourceType> {
        Ok(ResourceType {
            id: ResourceTypeId::new(r.get("id")),
            pipeline_id: PipelineId::new(r.get("pipeline_id")),
            team_id: TeamId::new(r.get("team_id")),
            name: r.get("name"),
            type_name: r.get("type_name"),
            source: from_json(r.get("source"))?,
            params: from_json(r.get("params"))?,
            privileged: r.get("privileged"),
            check_every: from_ms(r.get("check_every_ms")),
            tags: r.get("tags"),
            check_error: r.get("check_error"),
            resource_config_id: r.get::<Option<i64>, _>("resource_config_id").map(ResourceConfigId::new),
        })
    }

    fn row_to_job(r: &sqlx::postgres::PgRow) -> Result<Job> {
        let config: JobDefinition = from_json(r.get("config"))?;
        Ok(Job {
            id: JobId::new(r.get("id")),
            pipeline_id: PipelineId::new(r.get("pipeline_id")),
            team_id: TeamId::new(r.get("team_id")),
            name: r.get("name"),
            config,
            paused: r.get("paused"),
            build_number_seq: r.get("build_number_seq"),
            schedule_requested_time: r.get("schedule_requested"),
            next_build_id: r.get::<Option<i64>, _>("next_build_id").map(BuildId::new),
            latest_completed_build_id: r.get::<Option<i64>, _>("latest_completed_build_id").map(BuildId::new),
        })
    }

    /// Upsert the resources, types and jobs a config declares and delete the
    /// ones it no longer does. Ids survive by name.
    async fn sync_children(conn: &mut PgConnection, pipeline: &Pipeline) -> Result<()> {
        let pid = pipeline.id.get();
        let team = pipeline.team_id.get();
        let config = &pipeline.config;

        for def in &config.resources {
            sqlx::query(
                r#"INSERT INTO resources (pipeline_id, team_id, name, type_name, source, check_every_ms,
                       check_timeout_ms, tags, pinned_version, webhook_token, icon, public)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                   ON CONFLICT (pipeline_id, name) DO UPDATE SET
                     resource_config_id = CASE
                       WHEN resources.type_name = EXCLUDED.type_name AND resources.source = EXCLUDED.source
                       THEN resources.resource_config_id END,
                     check_error = CASE
                       WHEN resources.type_name = EXCLUDED.type_name AND resources.source = EXCLUDED.source
                       THEN resources.check_error END,
                     type_name = EXCLUDED.type_name,
                     source = EXCLUDED.source,
                     check_every_ms = EXCLUDED.check_every_ms,
                     check_timeout_ms = EXCLUDED.check_timeout_ms,
                     tags = EXCLUDED.tags,
                     pinned_version = EXCLUDED.pinned_version,
                     webhook_token = EXCLUDED.webhook_token,
                     icon = EXCLUDED.icon,
                     public = EXCLUDED.public"#,
            )
            .bind(pid)
            .bind(team)
            .bind(&def.name)
            .bind(&def.type_name)
            .bind(to_json(&def.source)?)
            .bind(def.check_every.map(to_ms))
            .bind(def.check_timeout.map(to_ms))
            .bind(&def.tags)
            .bind(def.version.as_ref().map(to_json).transpose()?)
            .bind(&def.webhook_token)
            .bind(&def.icon)
            .bind(def.public)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        }
        let names: Vec<String> = config.resources.iter().map(|r| r.name.clone()).collect();
        sqlx::query("DELETE FROM resources WHERE pipeline_id = $1 AND NOT (name = ANY($2))")
            .bind(pid)
            .bind(&names)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;

        for def in &config.resource_types {
            sqlx::query(
                r#"INSERT INTO resource_types (pipeline_id, team_id, name, type_name, source, params,
                       privileged, check_every_ms, tags)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                   ON CONFLICT (pipeline_id, name) DO UPDATE SET
                     resource_config_id = CASE
                       WHEN resource_types.type_name = EXCLUDED.type_name AND resource_types.source = EXCLUDED.source
                       THEN resource_types.resource_config_id END,
                     check_error = CASE
                       WHEN resource_types.type_name = EXCLUDED.type_name AND resource_types.source = EXCLUDED.source
                       THEN resource_types.check_error END,
                     type_name = EXCLUDED.type_name,
                     source = EXCLUDED.source,
                     params = EXCLUDED.params,
                     privileged = EXCLUDED.privileged,
                     check_every_ms = EXCLUDED.check_every_ms,
                     tags = EXCLUDED.tags"#,
            )
            .bind(pid)
            .bind(team)
            .bind(&def.name)
            .bind(&def.type_name)
            .bind(to_json(&def.source)?)
            .bind(to_json(&def.params)?)
            .bind(def.privileged)
            .bind(def.check_every.map(to_ms))
            .bind(&def.tags)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        }
        let names: Vec<String> = config.resource_types.iter().map(|r| r.name.clone()).collect();
        sqlx::query("DELETE FROM resource_types WHERE pipeline_id = $1 AND NOT (name = ANY($2))")
            .bind(pid)
            .bind(&names)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;

        for def in &config.jobs {
            sqlx::query(
                r#"INSERT INTO jobs (pipeline_id, team_id, name, config) VALUES ($1, $2, $3, $4)
                   ON CONFLICT (pipeline_id, name) DO UPDATE SET
                     config = EXCLUDED.config,
                     schedule_requested = now()"#,
            )
            .bind(pid)
            .bind(team)
            .bind(&def.name)
            .bind(to_json(def)?)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        }
        let names: Vec<String> = config.jobs.iter().map(|j| j.name.clone()).collect();
        sqlx::query("DELETE FROM jobs WHERE pipeline_id = $1 AND NOT (name = ANY($2))")
            .bind(pid)
            .bind(&names)
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;

        Ok(())
    }

    async fn request_pipeline_schedule(&self, pipeline_id: PipelineId) -> Result<()> {
        sqlx::query("UPDATE jobs SET schedule_requested = now() WHERE pipeline_id = $1")
            .bind(pipeline_id.get())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl PipelineRepository for PgPipelineRepository {
    async fn save_pipeline(
        &self,
        team_id: TeamId,
        name: &str,
        config: &PipelineDefinition,
        expected: Option<ConfigVersion>,
        paused: bool,
    ) -> Result<SavedPipeline> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let team = sqlx::query("SELECT id FROM teams WHERE id = $1")
            .bind(team_id.get())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if team.is_none() {
            return Err(Error::TeamNotFound(team_id.to_string()));
        }

        let existing = sqlx::query("SELECT id, config_version FROM pipelines WHERE team_id = $1 AND name = $2 FOR UPDATE")
            .bind(team_id.get())
            .bind(name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

        let found = existing.as_ref().map_or(0, |r| r.get::<i64, _>("config_version"));
        if let Some(expected) = expected
            && expected.get() != found
        {
            return Err(Error::ConfigVersionConflict {
                expected: expected.get(),
                found,
            });
        }

        let config_json = to_json(config)?;
        let (row, created) = match existing {
            Some(r) => {
                let row = sqlx::query(&format!(
                    "UPDATE pipelines SET config = $2, config_version = config_version + 1, archived = false \
                     WHERE id = $1 RETURNING {PIPELINE_COLUMNS}"
                ))
                .bind(r.get::<i64, _>("id"))
                .bind(&config_json)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
                (row, false)
            }
            None => {
                let row = sqlx::query(&format!(
                    "INSERT INTO pipelines (team_id, name, config, paused) VALUES ($1, $2, $3, $4) \
                     RETURNING {PIPELINE_COLUMNS}"
                ))
                .bind(team_id.get())
                .bind(name)
                .bind(&config_json)
                .bind(paused)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;
                (row, true)
            }
        };
        let pipeline = Self::row_to_pipeline(&row)?;

        Self::sync_children(&mut tx, &pipeline).await?;
        touch_versions(&mut tx).await?;
        tx.commit().await.map_err(db_err)?;

        debug!(pipeline = %pipeline.name, version = %pipeline.config_version, created, "Pipeline saved");
        Ok(SavedPipeline { pipeline, created })
    }

    async fn pipeline(&self, id: PipelineId) -> Result<Option<Pipeline>> {
        let row = sqlx::query(&format!("SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(Self::row_to_pipeline).transpose()
    }

    async fn find_pipeline(&self, team_id: TeamId, name: &str) -> Result<Option<Pipeline>> {
        let row = sqlx::query(&format!(
            "SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE team_id = $1 AND name = $2"
        ))
        .bind(team_id.get())
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(Self::row_to_pipeline).transpose()
    }

    async fn pipelines(&self) -> Result<Vec<Pipeline>> {
        let rows = sqlx::query(&format!("SELECT {PIPELINE_COLUMNS} FROM pipelines ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(Self::row_to_pipeline).collect()
    }

    async fn pipelines_requesting_schedule(&self) -> Result<Vec<(Pipeline, DateTime<Utc>)>> {
        let rows = sqlx::query(
            r#"SELECT p.id, p.team_id, p.name, p.config_version, p.config, p.paused, p.archived, p.public,
                      p.last_scheduled, p.created_at, j.requested
               FROM pipelines p,
                    LATERAL (SELECT MAX(schedule_requested) AS requested FROM jobs WHERE pipeline_id = p.id) j
               WHERE NOT p.paused AND NOT p.archived AND j.requested IS NOT NULL
                 AND (p.last_scheduled IS NULL OR j.requested > p.last_scheduled)"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|r| Ok((Self::row_to_pipeline(r)?, r.get("requested"))))
            .collect()
    }

    async fn update_last_scheduled(&self, id: PipelineId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE pipelines SET last_scheduled = GREATEST(COALESCE(last_scheduled, $2), $2) WHERE id = $1")
            .bind(id.get())
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_pipeline_paused(&self, id: PipelineId, paused: bool) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let result = sqlx::query("UPDATE pipelines SET paused = $2 WHERE id = $1")
            .bind(id.get())
            .bind(paused)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::PipelineNotFound(id.to_string()));
        }
        if !paused {
            sqlx::query("UPDATE jobs SET schedule_requested = now() WHERE pipeline_id = $1")
                .bind(id.get())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        super::notify(&mut tx, &skyway_core::channels::pipeline_paused(id)).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn archive_pipeline(&self, id: PipelineId) -> Result<()> {
        sqlx::query("UPDATE pipelines SET archived = true, paused = true WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_pipeline(&self, id: PipelineId) -> Result<()> {
        sqlx::query("DELETE FROM pipelines WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn jobs(&self, pipeline_id: PipelineId) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE pipeline_id = $1 ORDER BY id"))
            .bind(pipeline_id.get())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn set_job_paused(&self, id: JobId, paused: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET paused = $2, schedule_requested = CASE WHEN $2 THEN schedule_requested ELSE now() END WHERE id = $1",
        )
        .bind(id.get())
        .bind(paused)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::JobNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn request_schedule(&self, job_id: JobId) -> Result<()> {
        sqlx::query("UPDATE jobs SET schedule_requested = now() WHERE id = $1")
            .bind(job_id.get())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn request_schedule_for_config(&self, config_id: ResourceConfigId) -> Result<()> {
        sqlx::query(
            r#"UPDATE jobs SET schedule_requested = now()
               WHERE pipeline_id IN (SELECT pipeline_id FROM resources WHERE resource_config_id = $1)"#,
        )
        .bind(config_id.get())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn resources(&self, pipeline_id: PipelineId) -> Result<Vec<Resource>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources WHERE pipeline_id = $1 ORDER BY id"
        ))
        .bind(pipeline_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(Self::row_to_resource).collect()
    }

    async fn resource(&self, id: ResourceId) -> Result<Option<Resource>> {
        let row = sqlx::query(&format!("SELECT {RESOURCE_COLUMNS} FROM resources WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(Self::row_to_resource).transpose()
    }

    async fn resource_types(&self, pipeline_id: PipelineId) -> Result<Vec<ResourceType>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESOURCE_TYPE_COLUMNS} FROM resource_types WHERE pipeline_id = $1 ORDER BY id"
        ))
        .bind(pipeline_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(Self::row_to_resource_type).collect()
    }

    async fn resource_type(&self, id: ResourceTypeId) -> Result<Option<ResourceType>> {
        let row = sqlx::query(&format!("SELECT {RESOURCE_TYPE_COLUMNS} FROM resource_types WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(Self::row_to_resource_type).transpose()
    }

    async fn active_resources(&self) -> Result<Vec<Resource>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESOURCE_COLUMNS} FROM resources WHERE pipeline_id IN \
             (SELECT id FROM pipelines WHERE NOT paused AND NOT archived) ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(Self::row_to_resource).collect()
    }

    async fn active_resource_types(&self) -> Result<Vec<ResourceType>> {
        let rows = sqlx::query(&format!(
            "SELECT {RESOURCE_TYPE_COLUMNS} FROM resource_types WHERE pipeline_id IN \
             (SELECT id FROM pipelines WHERE NOT paused AND NOT archived) ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(Self::row_to_resource_type).collect()
    }

    async fn set_resource_config(&self, target: CheckTarget, config_id: ResourceConfigId) -> Result<()> {
        let (sql, id) = match target {
            CheckTarget::Resource(id) => ("UPDATE resources SET resource_config_id = $2 WHERE id = $1", id.get()),
            CheckTarget::ResourceType(id) => {
                ("UPDATE resource_types SET resource_config_id = $2 WHERE id = $1", id.get())
            }
        };
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(sql)
            .bind(id)
            .bind(config_id.get())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        touch_versions(&mut tx).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn set_check_error(&self, target: CheckTarget, error: Option<String>) -> Result<()> {
        let (sql, id) = match target {
            CheckTarget::Resource(id) => ("UPDATE resources SET check_error = $2 WHERE id = $1", id.get()),
            CheckTarget::ResourceType(id) => ("UPDATE resource_types SET check_error = $2 WHERE id = $1", id.get()),
        };
        sqlx::query(sql)
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn pin_resource_version(&self, id: ResourceId, version: Option<Version>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query("UPDATE resources SET pinned_version = $2 WHERE id = $1 RETURNING pipeline_id")
            .bind(id.get())
            .bind(version.as_ref().map(to_json).transpose()?)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::ResourceNotFound(id.to_string()))?;
        touch_versions(&mut tx).await?;
        tx.commit().await.map_err(db_err)?;

        self.request_pipeline_schedule(PipelineId::new(row.get("pipeline_id"))).await
    }
}
