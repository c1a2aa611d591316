//! PostgreSQL event store.
//!
//! Events live in child tables of `build_events`, one per pipeline and one
//! per team for one-off builds, so deleting a pipeline drops a table instead
//! of scanning. Ids are allocated from a per-build counter row, which also
//! serializes concurrent writers of one build.

use super::notify;
use crate::db_err;
use async_trait::async_trait;
use skyway_core::build::Build;
use skyway_core::events::{Event, EventKey, EventPage, Message, StoredEvent};
use skyway_core::ids::{PipelineId, TeamId};
use skyway_core::ports::EventStore;
use skyway_core::{Error, Result, channels};
use sqlx::{PgPool, Row};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn pipeline_table(id: PipelineId) -> String {
        format!("pipeline_build_events_{}", id.get())
    }

    fn team_table(id: TeamId) -> String {
        format!("team_build_events_{}", id.get())
    }

    fn table_for(pipeline_id: Option<PipelineId>, team_id: TeamId) -> String {
        match pipeline_id {
            Some(id) => Self::pipeline_table(id),
            None => Self::team_table(team_id),
        }
    }

    fn table(build: &Build) -> String {
        Self::table_for(build.pipeline_id, build.team_id)
    }

    fn cursor_id(cursor: Option<&EventKey>) -> Result<i64> {
        match cursor {
            Some(key) => key
                .to_event_id()
                .ok_or_else(|| Error::Serialization("malformed event key".to_string())),
            None => Ok(-1),
        }
    }

    async fn ensure_table(&self, table: &str) -> Result<()> {
        let statements = [
            format!("CREATE TABLE IF NOT EXISTS {table} () INHERITS (build_events)"),
            format!("CREATE UNIQUE INDEX IF NOT EXISTS {table}_build_event_idx ON {table} (build_id, event_id)"),
        ];
        for sql in &statements {
            match sqlx::query(sql).execute(&self.pool).await.map_err(db_err) {
                // Two builds racing to create one partition.
                Ok(_) | Err(Error::UniqueViolation(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn setup(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn initialize(&self, build: &Build) -> Result<()> {
        self.ensure_table(&Self::table(build)).await?;
        sqlx::query(
            "INSERT INTO build_event_streams (build_id, pipeline_id, team_id) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(build.id.get())
        .bind(build.pipeline_id.map(|p| p.get()))
        .bind(build.team_id.get())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn put(&self, build: &Build, events: Vec<Event>) -> Result<EventKey> {
        let messages = events.iter().map(Event::to_message).collect::<Result<Vec<_>>>()?;
        let count = messages.len() as i64;
        let table = Self::table(build);
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query(
            "UPDATE build_event_streams SET next_event_id = next_event_id + $2 \
             WHERE build_id = $1 AND NOT finalized RETURNING next_event_id",
        )
        .bind(build.id.get())
        .bind(count)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            let finalized = sqlx::query("SELECT finalized FROM build_event_streams WHERE build_id = $1")
                .bind(build.id.get())
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
            return Err(match finalized {
                Some(_) => Error::EventStreamFinalized(build.id.get()),
                None => Error::Internal(format!("event stream for build {} not initialized", build.id)),
            });
        };
        let end: i64 = row.get("next_event_id");
        let start = end - count;

        let insert = format!(
            "INSERT INTO {table} (build_id, event_id, event_type, version, payload) VALUES ($1, $2, $3, $4, $5)"
        );
        for (offset, message) in messages.into_iter().enumerate() {
            sqlx::query(&insert)
                .bind(build.id.get())
                .bind(start + offset as i64)
                .bind(&message.event_type)
                .bind(&message.version)
                .bind(&message.data)
                .execute(&mut *tx)
                .await
                .map_err(|e| match db_err(e) {
                    Error::UniqueViolation(_) => Error::DuplicateEventId {
                        build_id: build.id.get(),
                        event_id: start + offset as i64,
                    },
                    other => other,
                })?;
        }

        notify(&mut tx, &channels::build_events(build.id)).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(EventKey::from_event_id(end - 1))
    }

    async fn get(&self, build: &Build, cursor: Option<&EventKey>, max: usize) -> Result<EventPage> {
        let after = Self::cursor_id(cursor)?;
        let stream = sqlx::query("SELECT finalized FROM build_event_streams WHERE build_id = $1")
            .bind(build.id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(stream) = stream else {
            // Reaped: nothing more will ever arrive.
            return Ok(EventPage {
                events: Vec::new(),
                next: cursor.cloned(),
                finalized: true,
            });
        };
        let finalized: bool = stream.get("finalized");

        let rows = sqlx::query(&format!(
            "SELECT event_id, event_type, version, payload FROM {} \
             WHERE build_id = $1 AND event_id > $2 ORDER BY event_id LIMIT $3",
            Self::table(build)
        ))
        .bind(build.id.get())
        .bind(after)
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let events: Vec<StoredEvent> = rows
            .iter()
            .map(|r| {
                let event_id: i64 = r.get("event_id");
                StoredEvent {
                    event_id,
                    key: EventKey::from_event_id(event_id),
                    message: Message {
                        event_type: r.get("event_type"),
                        version: r.get("version"),
                        data: r.get("payload"),
                    },
                }
            })
            .collect();
        let next = events.last().map(|e| e.key.clone()).or_else(|| cursor.cloned());

        Ok(EventPage {
            events,
            next,
            finalized,
        })
    }

    async fn finalize(&self, build: &Build) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("UPDATE build_event_streams SET finalized = true WHERE build_id = $1")
            .bind(build.id.get())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        notify(&mut tx, &channels::build_events(build.id)).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete(&self, builds: &[Build]) -> Result<()> {
        let mut by_table: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        for build in builds {
            by_table.entry(Self::table(build)).or_default().push(build.id.get());
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for (table, ids) in &by_table {
            sqlx::query(&format!("DELETE FROM {table} WHERE build_id = ANY($1)"))
                .bind(ids)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        let ids: Vec<i64> = builds.iter().map(|b| b.id.get()).collect();
        sqlx::query("DELETE FROM build_event_streams WHERE build_id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for build in builds {
            notify(&mut tx, &channels::build_events(build.id)).await?;
        }
        tx.commit().await.map_err(db_err)?;

        debug!(count = builds.len(), "Deleted build events");
        Ok(())
    }

    async fn delete_pipeline(&self, pipeline_id: PipelineId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", Self::pipeline_table(pipeline_id)))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM build_event_streams WHERE pipeline_id = $1")
            .bind(pipeline_id.get())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn delete_team(&self, team_id: TeamId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let pipelines = sqlx::query(
            "SELECT DISTINCT pipeline_id FROM build_event_streams WHERE team_id = $1 AND pipeline_id IS NOT NULL",
        )
        .bind(team_id.get())
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;
        for r in &pipelines {
            let table = Self::pipeline_table(PipelineId::new(r.get("pipeline_id")));
            sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", Self::team_table(team_id)))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM build_event_streams WHERE team_id = $1")
            .bind(team_id.get())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    fn compare_keys(&self, a: &EventKey, b: &EventKey) -> Ordering {
        a.to_event_id().cmp(&b.to_event_id())
    }
}
