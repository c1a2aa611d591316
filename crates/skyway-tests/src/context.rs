//! Test context providing access to the containerized services.

use crate::containers::{NatsContainer, PostgresContainer};
use skyway_db::Database;
use skyway_nats::NatsBus;

/// PostgreSQL and NATS, both migrated and connected.
///
/// Drop this to stop all containers.
pub struct TestContext {
    pub postgres: PostgresContainer,
    pub nats: NatsContainer,
    pub db: Database,
    pub bus: NatsBus,
}

impl TestContext {
    /// Create a new test context with all containers running.
    pub async fn new() -> anyhow::Result<Self> {
        crate::init_test_logging();

        let (postgres, nats) = tokio::try_join!(PostgresContainer::start(), NatsContainer::start())?;

        let db = Database::connect(postgres.connection_string()).await?;
        db.migrate().await?;
        let bus = NatsBus::connect(nats.url()).await?;

        Ok(Self { postgres, nats, db, bus })
    }

    /// Create context with only PostgreSQL.
    pub async fn postgres_only() -> anyhow::Result<PostgresOnlyContext> {
        crate::init_test_logging();

        let postgres = PostgresContainer::start().await?;
        let db = Database::connect(postgres.connection_string()).await?;
        db.migrate().await?;

        Ok(PostgresOnlyContext { postgres, db })
    }

    /// Create context with only NATS.
    pub async fn nats_only() -> anyhow::Result<NatsOnlyContext> {
        crate::init_test_logging();

        let nats = NatsContainer::start().await?;
        let bus = NatsBus::connect(nats.url()).await?;

        Ok(NatsOnlyContext { nats, bus })
    }

    pub fn db_url(&self) -> &str {
        self.postgres.connection_string()
    }

    pub fn nats_url(&self) -> &str {
        self.nats.url()
    }
}

/// Minimal context with only PostgreSQL.
pub struct PostgresOnlyContext {
    pub postgres: PostgresContainer,
    pub db: Database,
}

impl PostgresOnlyContext {
    pub fn db_url(&self) -> &str {
        self.postgres.connection_string()
    }
}

/// Minimal context with only NATS.
pub struct NatsOnlyContext {
    pub nats: NatsContainer,
    pub bus: NatsBus,
}

impl NatsOnlyContext {
    pub fn nats_url(&self) -> &str {
        self.nats.url()
    }
}
