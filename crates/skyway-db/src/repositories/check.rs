//! PostgreSQL implementation of CheckRepository.

use super::{from_json, to_json};
use crate::db_err;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skyway_core::check::{Check, CheckStatus, CheckTarget};
use skyway_core::ids::*;
use skyway_core::plan::CheckPlan;
use skyway_core::ports::CheckRepository;
use skyway_core::{Error, Result};
use sqlx::{PgPool, Row};

const CHECK_COLUMNS: &str = "id, resource_config_id, target_kind, target_id, from_version, plan, status, \
     check_error, create_time, start_time, end_time";

pub struct PgCheckRepository {
    pool: PgPool,
}

impl PgCheckRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn target_parts(target: CheckTarget) -> (&'static str, i64) {
        match target {
            CheckTarget::Resource(id) => ("resource", id.get()),
            CheckTarget::ResourceType(id) => ("resource_type", id.get()),
        }
    }

    fn row_to_check(r: &sqlx::postgres::PgRow) -> Result<Check> {
        let kind: String = r.get("target_kind");
        let target_id: i64 = r.get("target_id");
        let target = match kind.as_str() {
            "resource" => CheckTarget::Resource(ResourceId::new(target_id)),
            "resource_type" => CheckTarget::ResourceType(ResourceTypeId::new(target_id)),
            other => return Err(Error::Database(format!("unknown check target '{other}'"))),
        };
        let status: String = r.get("status");
        let from_version: Option<serde_json::Value> = r.get("from_version");

        Ok(Check {
            id: CheckId::new(r.get("id")),
            resource_config_id: ResourceConfigId::new(r.get("resource_config_id")),
            target,
            from_version: from_version.map(from_json).transpose()?,
            plan: from_json(r.get("plan"))?,
            status: CheckStatus::parse(&status)
                .ok_or_else(|| Error::Database(format!("unknown check status '{status}'")))?,
            check_error: r.get("check_error"),
            create_time: r.get("create_time"),
            start_time: r.get("start_time"),
            end_time: r.get("end_time"),
        })
    }
}

#[async_trait]
impl CheckRepository for PgCheckRepository {
    async fn create_check(&self, config_id: ResourceConfigId, target: CheckTarget, plan: &CheckPlan) -> Result<Option<Check>> {
        let (kind, target_id) = Self::target_parts(target);
        let row = sqlx::query(&format!(
            "INSERT INTO checks (resource_config_id, target_kind, target_id, from_version, plan, status) \
             VALUES ($1, $2, $3, $4, $5, 'started') \
             ON CONFLICT (resource_config_id) WHERE status = 'started' DO NOTHING \
             RETURNING {CHECK_COLUMNS}"
        ))
        .bind(config_id.get())
        .bind(kind)
        .bind(target_id)
        .bind(plan.from_version.as_ref().map(to_json).transpose()?)
        .bind(to_json(plan)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(Self::row_to_check).transpose()
    }

    async fn pending_checks(&self, limit: usize) -> Result<Vec<Check>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHECK_COLUMNS} FROM checks WHERE status = 'started' AND start_time IS NULL \
             ORDER BY id LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(Self::row_to_check).collect()
    }

    async fn claim_check(&self, id: CheckId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE checks SET start_time = now() WHERE id = $1 AND status = 'started' AND start_time IS NULL",
        )
        .bind(id.get())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn finish_check(&self, id: CheckId, status: CheckStatus, error: Option<String>) -> Result<()> {
        sqlx::query("UPDATE checks SET status = $2, check_error = $3, end_time = now() WHERE id = $1")
            .bind(id.get())
            .bind(status.as_str())
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_check(&self, id: CheckId) -> Result<()> {
        sqlx::query("DELETE FROM checks WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn expire_checks(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE checks SET status = 'errored', check_error = 'timeout exceeded', end_time = now() \
             WHERE status = 'started' AND create_time < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() as usize)
    }

    async fn delete_checks_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query("DELETE FROM checks WHERE status <> 'started' AND end_time < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected() as usize)
    }
}
