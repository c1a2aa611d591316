//! PostgreSQL implementation of TeamRepository.

use crate::db_err;
use async_trait::async_trait;
use skyway_core::Result;
use skyway_core::ids::TeamId;
use skyway_core::pipeline::Team;
use skyway_core::ports::TeamRepository;
use sqlx::{PgPool, Row};

pub struct PgTeamRepository {
    pool: PgPool,
}

impl PgTeamRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_team(r: &sqlx::postgres::PgRow) -> Team {
        Team {
            id: TeamId::new(r.get("id")),
            name: r.get("name"),
            created_at: r.get("created_at"),
        }
    }
}

#[async_trait]
impl TeamRepository for PgTeamRepository {
    async fn create_team(&self, name: &str) -> Result<Team> {
        let row = sqlx::query("INSERT INTO teams (name) VALUES ($1) RETURNING id, name, created_at")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(Self::row_to_team(&row))
    }

    async fn find_team(&self, name: &str) -> Result<Option<Team>> {
        let row = sqlx::query("SELECT id, name, created_at FROM teams WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.as_ref().map(Self::row_to_team))
    }

    async fn team(&self, id: TeamId) -> Result<Option<Team>> {
        let row = sqlx::query("SELECT id, name, created_at FROM teams WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.as_ref().map(Self::row_to_team))
    }

    /// Pipelines, jobs and builds cascade; event partitions are dropped by
    /// the event store.
    async fn delete_team(&self, id: TeamId) -> Result<()> {
        sqlx::query("DELETE FROM teams WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
