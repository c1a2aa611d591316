//! Stores for Skyway.
//!
//! [`Database`] owns the PostgreSQL pool; the `Pg*` repositories implement
//! the core ports on top of it. [`memory::MemoryStore`] implements the same
//! ports in process for dev mode and tests.

pub mod bus;
pub mod memory;
pub mod repositories;

pub use bus::{MemoryBus, PgBus};
pub use memory::MemoryStore;
pub use repositories::*;

use skyway_core::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run migrations. A database migrated by a newer release is fatal.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// The stored encryption canary as `(ciphertext, nonce)`.
    pub async fn encryption_canary(&self) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>> {
        sqlx::query_as("SELECT ciphertext, nonce FROM encryption_canary WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    /// Store the canary unless one exists. Returns false if another node
    /// stored it first.
    pub async fn store_encryption_canary(&self, ciphertext: &[u8], nonce: Option<&[u8]>) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO encryption_canary (id, ciphertext, nonce) VALUES (1, $1, $2) ON CONFLICT (id) DO NOTHING",
        )
        .bind(ciphertext)
        .bind(nonce)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }
}

/// Map a sqlx error onto the core taxonomy so callers can tell retryable
/// conflicts from hard failures.
pub(crate) fn db_err(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some("40001") | Some("40P01") => return Error::SerializationFailure(db.message().to_string()),
            Some("23505") => return Error::UniqueViolation(db.message().to_string()),
            _ => {}
        }
    }
    if matches!(err, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) {
        return Error::Network(err.to_string());
    }
    Error::Database(err.to_string())
}
