//! PostgreSQL implementations of ResourceConfigRepository and
//! VersionRepository.

use super::{from_json, to_json, touch_versions};
use crate::db_err;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skyway_core::Result;
use skyway_core::build::BuildInput;
use skyway_core::ids::*;
use skyway_core::ports::{BuildVersions, ResourceConfigRepository, VersionRepository, VersionsSnapshot};
use skyway_core::resource::*;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::time::Duration;

const CONFIG_COLUMNS: &str =
    "id, type_name, source_hash, last_check_start_time, last_check_end_time, last_check_succeeded, created_at";

const CACHE_COLUMNS: &str = "id, resource_config_id, version, params_hash, signature, created_at";

const VERSION_COLUMNS: &str = "id, resource_config_id, version, metadata, check_order";

fn row_to_config(r: &sqlx::postgres::PgRow) -> ResourceConfig {
    ResourceConfig {
        id: ResourceConfigId::new(r.get("id")),
        type_name: r.get("type_name"),
        source_hash: r.get("source_hash"),
        last_check_start_time: r.get("last_check_start_time"),
        last_check_end_time: r.get("last_check_end_time"),
        last_check_succeeded: r.get("last_check_succeeded"),
        created_at: r.get("created_at"),
    }
}

fn row_to_cache(r: &sqlx::postgres::PgRow) -> Result<ResourceCache> {
    Ok(ResourceCache {
        id: ResourceCacheId::new(r.get("id")),
        resource_config_id: ResourceConfigId::new(r.get("resource_config_id")),
        version: from_json(r.get("version"))?,
        params_hash: r.get("params_hash"),
        signature: r.get("signature"),
        created_at: r.get("created_at"),
    })
}

pub(crate) fn row_to_version(r: &sqlx::postgres::PgRow) -> Result<ResourceVersion> {
    Ok(ResourceVersion {
        id: VersionId::new(r.get("id")),
        resource_config_id: ResourceConfigId::new(r.get("resource_config_id")),
        version: from_json(r.get("version"))?,
        metadata: from_json(r.get("metadata"))?,
        check_order: r.get("check_order"),
    })
}

fn cache_user(user: CacheUser) -> (&'static str, i64) {
    match user {
        CacheUser::Build(id) => ("build", id.get()),
        CacheUser::Container(id) => ("check_session", id.get()),
    }
}

pub struct PgResourceConfigRepository {
    pool: PgPool,
}

impl PgResourceConfigRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResourceConfigRepository for PgResourceConfigRepository {
    async fn find_or_create_config(&self, descriptor: &ResourceConfigDescriptor) -> Result<ResourceConfig> {
        let row = sqlx::query(&format!(
            "INSERT INTO resource_configs (type_name, source_hash) VALUES ($1, $2) \
             ON CONFLICT (source_hash) DO UPDATE SET type_name = EXCLUDED.type_name \
             RETURNING {CONFIG_COLUMNS}"
        ))
        .bind(&descriptor.type_name)
        .bind(descriptor.signature())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row_to_config(&row))
    }

    async fn config(&self, id: ResourceConfigId) -> Result<Option<ResourceConfig>> {
        let row = sqlx::query(&format!("SELECT {CONFIG_COLUMNS} FROM resource_configs WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.as_ref().map(row_to_config))
    }

    async fn update_last_check(
        &self,
        id: ResourceConfigId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        succeeded: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE resource_configs SET last_check_start_time = $2, last_check_end_time = $3, \
             last_check_succeeded = $4 WHERE id = $1",
        )
        .bind(id.get())
        .bind(start)
        .bind(end)
        .bind(succeeded)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn find_or_create_cache(
        &self,
        user: CacheUser,
        config_id: ResourceConfigId,
        descriptor: &ResourceCacheDescriptor,
    ) -> Result<ResourceCache> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let params_hash = signature(&serde_json::Value::Object(descriptor.params.clone()));
        let row = sqlx::query(&format!(
            "INSERT INTO resource_caches (resource_config_id, version, params_hash, signature) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (signature) DO UPDATE SET signature = EXCLUDED.signature \
             RETURNING {CACHE_COLUMNS}"
        ))
        .bind(config_id.get())
        .bind(to_json(&descriptor.version)?)
        .bind(params_hash)
        .bind(descriptor.signature())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let cache = row_to_cache(&row)?;

        let (kind, user_id) = cache_user(user);
        sqlx::query(
            "INSERT INTO resource_cache_uses (user_kind, user_id, cache_id) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(kind)
        .bind(user_id)
        .bind(cache.id.get())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        Ok(cache)
    }

    async fn cache(&self, id: ResourceCacheId) -> Result<Option<ResourceCache>> {
        let row = sqlx::query(&format!("SELECT {CACHE_COLUMNS} FROM resource_caches WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(row_to_cache).transpose()
    }

    async fn release_finished_cache_uses(&self) -> Result<usize> {
        let result = sqlx::query(
            r#"DELETE FROM resource_cache_uses u
               WHERE (u.user_kind = 'build' AND NOT EXISTS (
                        SELECT 1 FROM builds b WHERE b.id = u.user_id AND b.status IN ('pending', 'started')))
                  OR (u.user_kind = 'check_session' AND NOT EXISTS (
                        SELECT 1 FROM containers c WHERE c.resource_config_id = u.user_id AND c.expires_at > now()))"#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() as usize)
    }

    async fn delete_unused_caches(&self, grace: Duration) -> Result<usize> {
        let deleted: i64 = sqlx::query_scalar(
            r#"WITH doomed AS (
                   DELETE FROM resource_caches c
                   WHERE c.created_at < now() - make_interval(secs => $1)
                     AND NOT EXISTS (SELECT 1 FROM resource_cache_uses u WHERE u.cache_id = c.id)
                   RETURNING c.id
               ), released AS (
                   UPDATE volumes v SET association = NULL
                   WHERE v.association->>'kind' = 'resource_cache'
                     AND (v.association->>'cache_id')::bigint IN (SELECT id FROM doomed)
                   RETURNING v.handle
               )
               SELECT count(*) FROM doomed"#,
        )
        .bind(grace.as_secs_f64())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(deleted as usize)
    }

    async fn delete_unused_configs(&self, grace: Duration) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let result = sqlx::query(
            r#"DELETE FROM resource_configs rc
               WHERE rc.created_at < now() - make_interval(secs => $1)
                 AND NOT EXISTS (SELECT 1 FROM resources r WHERE r.resource_config_id = rc.id)
                 AND NOT EXISTS (SELECT 1 FROM resource_types t WHERE t.resource_config_id = rc.id)
                 AND NOT EXISTS (SELECT 1 FROM resource_caches c WHERE c.resource_config_id = rc.id)
                 AND NOT EXISTS (SELECT 1 FROM checks k WHERE k.resource_config_id = rc.id AND k.status = 'started')"#,
        )
        .bind(grace.as_secs_f64())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() > 0 {
            touch_versions(&mut tx).await?;
        }
        tx.commit().await.map_err(db_err)?;

        Ok(result.rows_affected() as usize)
    }
}

pub struct PgVersionRepository {
    pool: PgPool,
}

impl PgVersionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VersionRepository for PgVersionRepository {
    async fn save_versions(&self, config_id: ResourceConfigId, versions: &[Version]) -> Result<Vec<ResourceVersion>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut saved = Vec::with_capacity(versions.len());
        let mut inserted = false;

        // Rows are inserted in the order given so check_order follows it.
        for version in versions {
            let row = sqlx::query(&format!(
                "INSERT INTO resource_config_versions (resource_config_id, version, version_digest, check_order) \
                 VALUES ($1, $2, $3, nextval('check_order_seq')) \
                 ON CONFLICT (resource_config_id, version_digest) DO NOTHING \
                 RETURNING {VERSION_COLUMNS}"
            ))
            .bind(config_id.get())
            .bind(to_json(version)?)
            .bind(version.digest())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

            let row = match row {
                Some(row) => {
                    inserted = true;
                    row
                }
                None => sqlx::query(&format!(
                    "SELECT {VERSION_COLUMNS} FROM resource_config_versions \
                     WHERE resource_config_id = $1 AND version_digest = $2"
                ))
                .bind(config_id.get())
                .bind(version.digest())
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?,
            };
            saved.push(row_to_version(&row)?);
        }

        if inserted {
            touch_versions(&mut tx).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(saved)
    }

    async fn latest_version(&self, config_id: ResourceConfigId) -> Result<Option<ResourceVersion>> {
        let row = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM resource_config_versions WHERE resource_config_id = $1 \
             ORDER BY check_order DESC LIMIT 1"
        ))
        .bind(config_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_version).transpose()
    }

    async fn find_version(&self, config_id: ResourceConfigId, version: &Version) -> Result<Option<ResourceVersion>> {
        let row = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM resource_config_versions \
             WHERE resource_config_id = $1 AND version_digest = $2"
        ))
        .bind(config_id.get())
        .bind(version.digest())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_version).transpose()
    }

    async fn version(&self, id: VersionId) -> Result<Option<ResourceVersion>> {
        let row = sqlx::query(&format!("SELECT {VERSION_COLUMNS} FROM resource_config_versions WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(row_to_version).transpose()
    }

    async fn update_metadata(&self, config_id: ResourceConfigId, version: &Version, metadata: &[MetadataField]) -> Result<()> {
        sqlx::query(
            "UPDATE resource_config_versions SET metadata = $3 WHERE resource_config_id = $1 AND version_digest = $2",
        )
        .bind(config_id.get())
        .bind(version.digest())
        .bind(to_json(&metadata)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_version_enabled(&self, resource_id: ResourceId, version_id: VersionId, enabled: bool) -> Result<()> {
        let sql = if enabled {
            "DELETE FROM resource_disabled_versions WHERE resource_id = $1 AND version_id = $2"
        } else {
            "INSERT INTO resource_disabled_versions (resource_id, version_id) VALUES ($1, $2) ON CONFLICT DO NOTHING"
        };
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(sql)
            .bind(resource_id.get())
            .bind(version_id.get())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        touch_versions(&mut tx).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn is_version_enabled(&self, resource_id: ResourceId, version_id: VersionId) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS one FROM resource_disabled_versions WHERE resource_id = $1 AND version_id = $2")
            .bind(resource_id.get())
            .bind(version_id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.is_none())
    }

    async fn versions_modified_at(&self, _pipeline_id: PipelineId) -> Result<DateTime<Utc>> {
        let row = sqlx::query("SELECT modified_at FROM versions_modified WHERE id = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.get("modified_at"))
    }

    async fn versions_snapshot(&self, pipeline_id: PipelineId, row_limit: usize) -> Result<VersionsSnapshot> {
        // One repeatable-read transaction so every table is seen at the
        // same instant as the sentinel.
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let cached_at: DateTime<Utc> = sqlx::query("SELECT modified_at FROM versions_modified WHERE id = 1")
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?
            .get("modified_at");
        let mut snapshot = VersionsSnapshot {
            cached_at: Some(cached_at),
            ..Default::default()
        };

        let resources = sqlx::query("SELECT id FROM resources WHERE pipeline_id = $1")
            .bind(pipeline_id.get())
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err)?;
        for r in &resources {
            snapshot.resource_versions.insert(ResourceId::new(r.get("id")), Vec::new());
        }

        let rows = sqlx::query(
            r#"SELECT r.id AS resource_id, v.id, v.resource_config_id, v.version, v.metadata, v.check_order
               FROM resources r
               JOIN resource_config_versions v ON v.resource_config_id = r.resource_config_id
               WHERE r.pipeline_id = $1
                 AND NOT EXISTS (
                     SELECT 1 FROM resource_disabled_versions d WHERE d.resource_id = r.id AND d.version_id = v.id)
               ORDER BY v.check_order DESC"#,
        )
        .bind(pipeline_id.get())
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        for r in &rows {
            snapshot
                .resource_versions
                .entry(ResourceId::new(r.get("resource_id")))
                .or_default()
                .push(row_to_version(r)?);
        }

        let builds = sqlx::query(
            r#"SELECT id, job_id FROM (
                   SELECT id, job_id, row_number() OVER (PARTITION BY job_id ORDER BY id DESC) AS n
                   FROM builds WHERE pipeline_id = $1 AND status = 'succeeded' AND job_id IS NOT NULL
               ) s WHERE n <= $2 ORDER BY id DESC"#,
        )
        .bind(pipeline_id.get())
        .bind(row_limit.max(1) as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        let build_ids: Vec<i64> = builds.iter().map(|r| r.get("id")).collect();

        let used = sqlx::query(
            r#"SELECT build_id, resource_id, version_id FROM build_inputs WHERE build_id = ANY($1)
               UNION ALL
               SELECT build_id, resource_id, version_id FROM build_outputs WHERE build_id = ANY($1)"#,
        )
        .bind(&build_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        let mut by_build: HashMap<i64, HashMap<ResourceId, Vec<VersionId>>> = HashMap::new();
        for r in &used {
            by_build
                .entry(r.get("build_id"))
                .or_default()
                .entry(ResourceId::new(r.get("resource_id")))
                .or_default()
                .push(VersionId::new(r.get("version_id")));
        }
        for r in &builds {
            let build_id: i64 = r.get("id");
            snapshot
                .successful_builds
                .entry(JobId::new(r.get("job_id")))
                .or_default()
                .push(BuildVersions {
                    build_id: BuildId::new(build_id),
                    versions: by_build.remove(&build_id).unwrap_or_default(),
                });
        }

        let inputs = sqlx::query(
            r#"SELECT b.job_id, i.name, i.resource_id, i.version_id, i.first_occurrence, v.version
               FROM (SELECT DISTINCT ON (job_id) job_id, id FROM builds
                     WHERE pipeline_id = $1 AND job_id IS NOT NULL
                       AND EXISTS (SELECT 1 FROM build_inputs x WHERE x.build_id = builds.id)
                     ORDER BY job_id, id DESC) b
               JOIN build_inputs i ON i.build_id = b.id
               JOIN resource_config_versions v ON v.id = i.version_id"#,
        )
        .bind(pipeline_id.get())
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        for r in &inputs {
            snapshot
                .last_inputs
                .entry(JobId::new(r.get("job_id")))
                .or_default()
                .push(BuildInput {
                    name: r.get("name"),
                    resource_id: ResourceId::new(r.get("resource_id")),
                    version_id: VersionId::new(r.get("version_id")),
                    version: from_json(r.get("version"))?,
                    first_occurrence: r.get("first_occurrence"),
                });
        }

        tx.commit().await.map_err(db_err)?;
        Ok(snapshot)
    }
}
