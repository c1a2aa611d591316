//! Repository implementations for PostgreSQL.

mod build;
mod check;
mod component;
mod creator;
mod events;
mod lease;
mod pipeline;
mod resource;
mod team;
mod worker;

pub use build::PgBuildRepository;
pub use check::PgCheckRepository;
pub use component::PgComponentRepository;
pub use creator::PgBuildCreator;
pub use events::PgEventStore;
pub use lease::PgLeaseRepository;
pub use pipeline::PgPipelineRepository;
pub use resource::{PgResourceConfigRepository, PgVersionRepository};
pub use team::PgTeamRepository;
pub use worker::{PgArtifactRepository, PgContainerRepository, PgVolumeRepository, PgWorkerRepository};

use crate::db_err;
use serde::Serialize;
use serde::de::DeserializeOwned;
use skyway_core::ids::JobId;
use skyway_core::{Error, Result};
use sqlx::PgConnection;
use std::time::Duration;

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| Error::Serialization(e.to_string()))
}

pub(crate) fn from_json<T: DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::Serialization(e.to_string()))
}

pub(crate) fn to_ms(duration: Duration) -> i64 {
    duration.as_millis().min(i64::MAX as u128) as i64
}

pub(crate) fn from_ms(ms: Option<i64>) -> Option<Duration> {
    ms.map(|ms| Duration::from_millis(ms.max(0) as u64))
}

/// Advance the sentinel the input algorithm uses to skip unchanged
/// pipelines. Strictly increasing even within one clock tick.
pub(crate) async fn touch_versions(conn: &mut PgConnection) -> Result<()> {
    sqlx::query(
        "UPDATE versions_modified SET modified_at = GREATEST(now(), modified_at + interval '1 microsecond') WHERE id = 1",
    )
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Recompute a job's next pending and latest completed build pointers.
pub(crate) async fn refresh_job_pointers(conn: &mut PgConnection, job_id: JobId) -> Result<()> {
    sqlx::query(
        r#"UPDATE jobs SET
             next_build_id = (SELECT MIN(id) FROM builds WHERE job_id = $1 AND status = 'pending'),
             latest_completed_build_id = (
                 SELECT MAX(id) FROM builds
                 WHERE job_id = $1 AND rerun_of IS NULL
                   AND status IN ('succeeded', 'failed', 'errored', 'aborted'))
           WHERE id = $1"#,
    )
    .bind(job_id.get())
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub(crate) async fn notify(conn: &mut PgConnection, channel: &str) -> Result<()> {
    sqlx::query("SELECT pg_notify($1, '')")
        .bind(channel)
        .execute(conn)
        .await
        .map_err(|e| Error::EventBus(e.to_string()))?;
    Ok(())
}
