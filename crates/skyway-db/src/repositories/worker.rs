//! PostgreSQL implementations of the worker, container, volume and
//! artifact repositories.

use super::{from_json, notify, to_json};
use crate::db_err;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skyway_core::ids::*;
use skyway_core::ports::*;
use skyway_core::worker::*;
use skyway_core::{Error, Result, channels};
use sqlx::{PgPool, Row};

const WORKER_COLUMNS: &str = "name, state, platform, tags, team_id, garden_addr, baggageclaim_url, version, \
     resource_types, ephemeral, active_tasks, start_time, last_heartbeat";

const CONTAINER_COLUMNS: &str = "handle, worker_name, owner, state, hijacked, last_hijack, created_at";

const VOLUME_COLUMNS: &str =
    "handle, worker_name, team_id, state, association, container_handle, parent_handle, path, created_at";

const ARTIFACT_COLUMNS: &str = "id, name, build_id, worker_name, association, initialized, created_at";

fn row_to_worker(r: &sqlx::postgres::PgRow) -> Result<Worker> {
    let state: String = r.get("state");
    Ok(Worker {
        name: r.get("name"),
        state: WorkerState::parse(&state).ok_or_else(|| Error::Database(format!("unknown worker state '{state}'")))?,
        platform: r.get("platform"),
        tags: r.get("tags"),
        team_id: r.get::<Option<i64>, _>("team_id").map(TeamId::new),
        garden_addr: r.get("garden_addr"),
        baggageclaim_url: r.get("baggageclaim_url"),
        version: r.get("version"),
        resource_types: from_json(r.get("resource_types"))?,
        ephemeral: r.get("ephemeral"),
        active_tasks: r.get("active_tasks"),
        start_time: r.get("start_time"),
        last_heartbeat: r.get("last_heartbeat"),
    })
}

fn row_to_container(r: &sqlx::postgres::PgRow) -> Result<Container> {
    let state: String = r.get("state");
    let owner: Option<serde_json::Value> = r.get("owner");
    Ok(Container {
        handle: ContainerHandle::new(r.get::<String, _>("handle")),
        worker_name: r.get("worker_name"),
        owner: owner.map(from_json).transpose()?,
        state: ContainerState::parse(&state)
            .ok_or_else(|| Error::Database(format!("unknown container state '{state}'")))?,
        hijacked: r.get("hijacked"),
        last_hijack: r.get("last_hijack"),
        created_at: r.get("created_at"),
    })
}

fn row_to_volume(r: &sqlx::postgres::PgRow) -> Result<Volume> {
    let state: String = r.get("state");
    let association: Option<serde_json::Value> = r.get("association");
    Ok(Volume {
        handle: VolumeHandle::new(r.get::<String, _>("handle")),
        worker_name: r.get("worker_name"),
        team_id: r.get::<Option<i64>, _>("team_id").map(TeamId::new),
        state: VolumeState::parse(&state).ok_or_else(|| Error::Database(format!("unknown volume state '{state}'")))?,
        association: association.map(from_json).transpose()?,
        container_handle: r.get::<Option<String>, _>("container_handle").map(ContainerHandle::new),
        parent_handle: r.get::<Option<String>, _>("parent_handle").map(VolumeHandle::new),
        path: r.get("path"),
        created_at: r.get("created_at"),
    })
}

fn row_to_artifact(r: &sqlx::postgres::PgRow) -> Result<WorkerArtifact> {
    let association: Option<serde_json::Value> = r.get("association");
    Ok(WorkerArtifact {
        id: ArtifactId::new(r.get("id")),
        name: r.get("name"),
        build_id: r.get::<Option<i64>, _>("build_id").map(BuildId::new),
        worker_name: r.get("worker_name"),
        association: association.map(from_json).transpose()?,
        initialized: r.get("initialized"),
        created_at: r.get("created_at"),
    })
}

pub struct PgWorkerRepository {
    pool: PgPool,
}

impl PgWorkerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkerRepository for PgWorkerRepository {
    async fn save_worker(&self, worker: &Worker) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            r#"INSERT INTO workers (name, state, platform, tags, team_id, garden_addr, baggageclaim_url, version,
                   resource_types, ephemeral, active_tasks, start_time, last_heartbeat)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, now())
               ON CONFLICT (name) DO UPDATE SET
                 state = EXCLUDED.state, platform = EXCLUDED.platform, tags = EXCLUDED.tags,
                 team_id = EXCLUDED.team_id, garden_addr = EXCLUDED.garden_addr,
                 baggageclaim_url = EXCLUDED.baggageclaim_url, version = EXCLUDED.version,
                 resource_types = EXCLUDED.resource_types, ephemeral = EXCLUDED.ephemeral,
                 start_time = EXCLUDED.start_time,
                 last_heartbeat = now()"#,
        )
        .bind(&worker.name)
        .bind(worker.state.as_str())
        .bind(&worker.platform)
        .bind(&worker.tags)
        .bind(worker.team_id.map(|t| t.get()))
        .bind(&worker.garden_addr)
        .bind(&worker.baggageclaim_url)
        .bind(&worker.version)
        .bind(to_json(&worker.resource_types)?)
        .bind(worker.ephemeral)
        .bind(worker.active_tasks)
        .bind(worker.start_time)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        notify(&mut tx, channels::WORKER_STATE_CHANGED).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn heartbeat_worker(&self, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let previous: String = sqlx::query("SELECT state FROM workers WHERE name = $1 FOR UPDATE")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::WorkerNotFound(name.to_string()))?
            .get("state");

        // A heartbeat revives a stalled worker.
        sqlx::query(
            "UPDATE workers SET last_heartbeat = now(), \
             state = CASE WHEN state = 'stalled' THEN 'running' ELSE state END WHERE name = $1",
        )
        .bind(name)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if previous == WorkerState::Stalled.as_str() {
            notify(&mut tx, channels::WORKER_STATE_CHANGED).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn workers(&self) -> Result<Vec<Worker>> {
        let rows = sqlx::query(&format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY name"))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(row_to_worker).collect()
    }

    async fn worker(&self, name: &str) -> Result<Option<Worker>> {
        let row = sqlx::query(&format!("SELECT {WORKER_COLUMNS} FROM workers WHERE name = $1"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(row_to_worker).transpose()
    }

    async fn increase_active_tasks(&self, name: &str) -> Result<i32> {
        let row = sqlx::query("UPDATE workers SET active_tasks = active_tasks + 1 WHERE name = $1 RETURNING active_tasks")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::WorkerNotFound(name.to_string()))?;
        Ok(row.get("active_tasks"))
    }

    async fn decrease_active_tasks(&self, name: &str) -> Result<i32> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query(
            "UPDATE workers SET active_tasks = GREATEST(active_tasks - 1, 0) WHERE name = $1 RETURNING active_tasks",
        )
        .bind(name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::WorkerNotFound(name.to_string()))?;
        notify(&mut tx, channels::WORKER_STATE_CHANGED).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(row.get("active_tasks"))
    }

    async fn set_worker_state(&self, name: &str, state: WorkerState) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let row = sqlx::query("SELECT state FROM workers WHERE name = $1 FOR UPDATE")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::WorkerNotFound(name.to_string()))?;
        let current: String = row.get("state");
        let current =
            WorkerState::parse(&current).ok_or_else(|| Error::Database(format!("unknown worker state '{current}'")))?;
        let next = current.transition(state)?;

        sqlx::query("UPDATE workers SET state = $2 WHERE name = $1")
            .bind(name)
            .bind(next.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        notify(&mut tx, channels::WORKER_STATE_CHANGED).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete_worker(&self, name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM workers WHERE name = $1")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        notify(&mut tx, channels::WORKER_STATE_CHANGED).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}

pub struct PgContainerRepository {
    pool: PgPool,
}

impl PgContainerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContainerRepository for PgContainerRepository {
    async fn create_container(&self, worker_name: &str, owner: &ContainerOwner) -> Result<Container> {
        let (config_id, expires_at) = match owner {
            ContainerOwner::CheckSession {
                resource_config_id,
                expires_at,
            } => (Some(resource_config_id.get()), Some(*expires_at)),
            _ => (None, None),
        };
        let row = sqlx::query(&format!(
            "INSERT INTO containers (handle, worker_name, owner, build_id, resource_config_id, expires_at, state) \
             VALUES ($1, $2, $3, $4, $5, $6, 'creating') RETURNING {CONTAINER_COLUMNS}"
        ))
        .bind(ContainerHandle::generate().as_str())
        .bind(worker_name)
        .bind(to_json(owner)?)
        .bind(owner.build_id().map(|b| b.get()))
        .bind(config_id)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match db_err(e) {
            Error::Database(msg) if msg.contains("foreign key") => Error::WorkerNotFound(worker_name.to_string()),
            other => other,
        })?;

        row_to_container(&row)
    }

    async fn find_container(&self, worker_name: &str, owner: &ContainerOwner) -> Result<Option<Container>> {
        let row = sqlx::query(&format!(
            "SELECT {CONTAINER_COLUMNS} FROM containers WHERE worker_name = $1 AND owner = $2"
        ))
        .bind(worker_name)
        .bind(to_json(owner)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_container).transpose()
    }

    async fn find_check_container(&self, config_id: ResourceConfigId) -> Result<Option<Container>> {
        let row = sqlx::query(&format!(
            "SELECT {CONTAINER_COLUMNS} FROM containers \
             WHERE resource_config_id = $1 AND expires_at > now() AND state = 'created' LIMIT 1"
        ))
        .bind(config_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_container).transpose()
    }

    async fn mark_container_created(&self, handle: &ContainerHandle) -> Result<()> {
        sqlx::query("UPDATE containers SET state = 'created' WHERE handle = $1")
            .bind(handle.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn mark_container_destroying(&self, handle: &ContainerHandle) -> Result<()> {
        sqlx::query("UPDATE containers SET state = 'destroying' WHERE handle = $1")
            .bind(handle.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn mark_hijacked(&self, handle: &ContainerHandle) -> Result<()> {
        sqlx::query("UPDATE containers SET hijacked = true, last_hijack = now() WHERE handle = $1")
            .bind(handle.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_container(&self, handle: &ContainerHandle) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("UPDATE volumes SET container_handle = NULL WHERE container_handle = $1")
            .bind(handle.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM containers WHERE handle = $1")
            .bind(handle.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        notify(&mut tx, channels::WORKER_STATE_CHANGED).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn containers(&self) -> Result<Vec<Container>> {
        let rows = sqlx::query(&format!("SELECT {CONTAINER_COLUMNS} FROM containers ORDER BY created_at"))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(row_to_container).collect()
    }

    async fn expire_check_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE containers SET owner = NULL, resource_config_id = NULL, expires_at = NULL \
             WHERE expires_at IS NOT NULL AND expires_at <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() as usize)
    }

    async fn release_finished_build_containers(&self, cutoff: DateTime<Utc>, hijack_cutoff: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            r#"UPDATE containers c SET owner = NULL, build_id = NULL
               WHERE c.build_id IS NOT NULL
                 AND (NOT c.hijacked OR c.last_hijack IS NULL OR c.last_hijack < $2)
                 AND NOT EXISTS (
                     SELECT 1 FROM builds b WHERE b.id = c.build_id
                       AND (b.status IN ('pending', 'started') OR b.end_time >= $1))"#,
        )
        .bind(cutoff)
        .bind(hijack_cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() as usize)
    }
}

pub struct PgVolumeRepository {
    pool: PgPool,
}

impl PgVolumeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VolumeRepository for PgVolumeRepository {
    async fn create_volume(&self, request: &VolumeRequest) -> Result<Volume> {
        let row = sqlx::query(&format!(
            "INSERT INTO volumes (handle, worker_name, team_id, state, association, container_handle, parent_handle, path) \
             VALUES ($1, $2, $3, 'creating', $4, $5, $6, $7) RETURNING {VOLUME_COLUMNS}"
        ))
        .bind(VolumeHandle::generate().as_str())
        .bind(&request.worker_name)
        .bind(request.team_id.map(|t| t.get()))
        .bind(request.association.as_ref().map(to_json).transpose()?)
        .bind(request.container_handle.as_ref().map(|h| h.as_str().to_string()))
        .bind(request.parent_handle.as_ref().map(|h| h.as_str().to_string()))
        .bind(&request.path)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        row_to_volume(&row)
    }

    async fn mark_volume_created(&self, handle: &VolumeHandle) -> Result<()> {
        sqlx::query("UPDATE volumes SET state = 'created' WHERE handle = $1")
            .bind(handle.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_volume_association(&self, handle: &VolumeHandle, association: Option<VolumeAssociation>) -> Result<()> {
        sqlx::query("UPDATE volumes SET association = $2 WHERE handle = $1")
            .bind(handle.as_str())
            .bind(association.as_ref().map(to_json).transpose()?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn volume(&self, handle: &VolumeHandle) -> Result<Option<Volume>> {
        let row = sqlx::query(&format!("SELECT {VOLUME_COLUMNS} FROM volumes WHERE handle = $1"))
            .bind(handle.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.as_ref().map(row_to_volume).transpose()
    }

    async fn find_cache_volume(&self, worker_name: &str, cache_id: ResourceCacheId) -> Result<Option<Volume>> {
        let association = to_json(&VolumeAssociation::ResourceCache { cache_id })?;
        let row = sqlx::query(&format!(
            "SELECT {VOLUME_COLUMNS} FROM volumes \
             WHERE worker_name = $1 AND state = 'created' AND association = $2 LIMIT 1"
        ))
        .bind(worker_name)
        .bind(association)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_volume).transpose()
    }

    async fn find_task_cache_volume(&self, worker_name: &str, job_id: JobId, step_name: &str, path: &str) -> Result<Option<Volume>> {
        let association = to_json(&VolumeAssociation::TaskCache {
            job_id,
            step_name: step_name.to_string(),
            path: path.to_string(),
        })?;
        let row = sqlx::query(&format!(
            "SELECT {VOLUME_COLUMNS} FROM volumes \
             WHERE worker_name = $1 AND state = 'created' AND association = $2 LIMIT 1"
        ))
        .bind(worker_name)
        .bind(association)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(row_to_volume).transpose()
    }

    async fn volumes(&self) -> Result<Vec<Volume>> {
        let rows = sqlx::query(&format!("SELECT {VOLUME_COLUMNS} FROM volumes ORDER BY created_at"))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(row_to_volume).collect()
    }

    async fn mark_volume_destroying(&self, handle: &VolumeHandle) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE volumes SET state = 'destroying'
               WHERE handle = $1 AND NOT EXISTS (
                   SELECT 1 FROM volumes child WHERE child.parent_handle = $1 AND child.state <> 'destroyed')"#,
        )
        .bind(handle.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_volume(&self, handle: &VolumeHandle) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM volumes WHERE handle = $1")
            .bind(handle.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        notify(&mut tx, channels::WORKER_STATE_CHANGED).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}

pub struct PgArtifactRepository {
    pool: PgPool,
}

impl PgArtifactRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArtifactRepository for PgArtifactRepository {
    async fn create_artifact(&self, name: &str, build_id: Option<BuildId>, worker_name: Option<&str>) -> Result<WorkerArtifact> {
        let row = sqlx::query(&format!(
            "INSERT INTO worker_artifacts (name, build_id, worker_name) VALUES ($1, $2, $3) RETURNING {ARTIFACT_COLUMNS}"
        ))
        .bind(name)
        .bind(build_id.map(|b| b.get()))
        .bind(worker_name)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        row_to_artifact(&row)
    }

    async fn initialize_artifact(&self, id: ArtifactId, association: Option<ArtifactAssociation>) -> Result<()> {
        sqlx::query("UPDATE worker_artifacts SET initialized = true, association = $2 WHERE id = $1")
            .bind(id.get())
            .bind(association.as_ref().map(to_json).transpose()?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn artifacts(&self) -> Result<Vec<WorkerArtifact>> {
        let rows = sqlx::query(&format!("SELECT {ARTIFACT_COLUMNS} FROM worker_artifacts ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.iter().map(row_to_artifact).collect()
    }

    async fn remove_expired_artifacts(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query("DELETE FROM worker_artifacts WHERE NOT initialized AND created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected() as usize)
    }

    async fn remove_orphaned_artifacts(&self) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            r#"UPDATE worker_artifacts a SET build_id = NULL
               WHERE a.build_id IS NOT NULL AND NOT EXISTS (
                   SELECT 1 FROM builds b WHERE b.id = a.build_id AND b.status IN ('pending', 'started'))"#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        let result = sqlx::query(
            r#"DELETE FROM worker_artifacts a
               WHERE a.initialized AND a.build_id IS NULL AND a.association IS NULL
                 AND (a.worker_name IS NULL OR EXISTS (
                     SELECT 1 FROM workers w WHERE w.name = a.worker_name AND w.state IN ('running', 'landing', 'retiring')))"#,
        )
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        Ok(result.rows_affected() as usize)
    }
}
