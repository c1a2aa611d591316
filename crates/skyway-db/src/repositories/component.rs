//! PostgreSQL implementation of ComponentRepository.

use super::{from_ms, to_ms};
use crate::db_err;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skyway_core::Result;
use skyway_core::component::Component;
use skyway_core::ports::ComponentRepository;
use sqlx::{PgPool, Row};
use std::time::Duration;

pub struct PgComponentRepository {
    pool: PgPool,
}

impl PgComponentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_component(r: &sqlx::postgres::PgRow) -> Component {
        Component {
            name: r.get("name"),
            interval: from_ms(Some(r.get("interval_ms"))).unwrap_or_default(),
            paused: r.get("paused"),
            last_run: r.get("last_run"),
        }
    }
}

#[async_trait]
impl ComponentRepository for PgComponentRepository {
    async fn register(&self, name: &str, interval: Duration) -> Result<Component> {
        // Existing rows keep their operator-set interval and pause state.
        let row = sqlx::query(
            r#"INSERT INTO components (name, interval_ms) VALUES ($1, $2)
               ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
               RETURNING name, interval_ms, paused, last_run"#,
        )
        .bind(name)
        .bind(to_ms(interval))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(Self::row_to_component(&row))
    }

    async fn get(&self, name: &str) -> Result<Option<Component>> {
        let row = sqlx::query("SELECT name, interval_ms, paused, last_run FROM components WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.as_ref().map(Self::row_to_component))
    }

    async fn update_last_run(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE components SET last_run = $2 WHERE name = $1")
            .bind(name)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_paused(&self, name: &str, paused: bool) -> Result<()> {
        sqlx::query("UPDATE components SET paused = $2 WHERE name = $1")
            .bind(name)
            .bind(paused)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_interval(&self, name: &str, interval: Duration) -> Result<()> {
        sqlx::query("UPDATE components SET interval_ms = $2 WHERE name = $1")
            .bind(name)
            .bind(to_ms(interval))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
