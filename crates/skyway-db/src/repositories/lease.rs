//! PostgreSQL implementation of LeaseRepository.

use super::to_ms;
use crate::db_err;
use async_trait::async_trait;
use skyway_core::Result;
use skyway_core::ports::LeaseRepository;
use sqlx::PgPool;
use std::time::Duration;

/// Named leases in the `leases` table. A lease is free when released or
/// when its heartbeat is older than its TTL.
pub struct PgLeaseRepository {
    pool: PgPool,
}

impl PgLeaseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseRepository for PgLeaseRepository {
    async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let row = sqlx::query(
            r#"INSERT INTO leases (name, owner, heartbeat, ttl_ms) VALUES ($1, $2, now(), $3)
               ON CONFLICT (name) DO UPDATE
                 SET owner = EXCLUDED.owner, heartbeat = now(), ttl_ms = EXCLUDED.ttl_ms
                 WHERE leases.heartbeat IS NULL
                    OR leases.heartbeat + leases.ttl_ms * interval '1 millisecond' < now()
               RETURNING name"#,
        )
        .bind(name)
        .bind(owner)
        .bind(to_ms(ttl))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.is_some())
    }

    async fn heartbeat(&self, name: &str, owner: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE leases SET heartbeat = now() WHERE name = $1 AND owner = $2 AND heartbeat IS NOT NULL",
        )
        .bind(name)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, name: &str, owner: &str) -> Result<()> {
        sqlx::query("UPDATE leases SET heartbeat = NULL WHERE name = $1 AND owner = $2")
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
