//! Notification buses: PostgreSQL LISTEN/NOTIFY and an in-process bus.

use async_trait::async_trait;
use futures::StreamExt;
use skyway_core::ports::{NotificationBus, NotificationStream};
use skyway_core::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Bus over `pg_notify`. Each `listen` holds its own connection.
#[derive(Clone)]
pub struct PgBus {
    pool: PgPool,
}

impl PgBus {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationBus for PgBus {
    async fn notify(&self, channel: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, '')")
            .bind(channel)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::EventBus(e.to_string()))?;
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<NotificationStream> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| Error::EventBus(e.to_string()))?;
        listener
            .listen(channel)
            .await
            .map_err(|e| Error::EventBus(e.to_string()))?;
        debug!(channel = %channel, "Listening");

        let channel = channel.to_string();
        let stream = listener.into_stream().filter_map(move |n| {
            let channel = channel.clone();
            async move {
                match n {
                    Ok(_) => Some(()),
                    Err(e) => {
                        // The listener reconnects on its own; a spurious
                        // wakeup is harmless.
                        warn!(channel = %channel, error = %e, "Notification listener error");
                        Some(())
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

/// In-process bus for dev mode and tests.
#[derive(Default)]
pub struct MemoryBus {
    channels: Mutex<HashMap<String, broadcast::Sender<()>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<()> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

#[async_trait]
impl NotificationBus for MemoryBus {
    async fn notify(&self, channel: &str) -> Result<()> {
        // No listeners is not an error.
        let _ = self.sender(channel).send(());
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<NotificationStream> {
        let rx = self.sender(channel).subscribe();
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                // Lagged receivers still owe the caller one wakeup.
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Some(((), rx)),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(Box::pin(stream))
    }
}
