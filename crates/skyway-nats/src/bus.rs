//! Notification bus over core NATS subjects.

use async_trait::async_trait;
use futures::StreamExt;
use skyway_core::ports::{NotificationBus, NotificationStream};
use skyway_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::NatsConfig;
use crate::health::HealthCheck;
use crate::metrics::NatsMetrics;

/// Bus mapping channel `c` to subject `<prefix>.notify.c`.
#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
    config: NatsConfig,
    metrics: Arc<NatsMetrics>,
}

impl NatsBus {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(NatsConfig::new(url)).await
    }

    pub async fn connect_with_config(config: NatsConfig) -> Result<Self> {
        info!(urls = %config.urls.join(","), "Connecting notification bus to NATS");
        let metrics = NatsMetrics::new();
        let client = config.connect(&metrics).await?;
        Ok(Self::from_client(client, config, metrics))
    }

    /// Share an existing connection (the plugin client uses the same one).
    pub fn from_client(client: async_nats::Client, config: NatsConfig, metrics: Arc<NatsMetrics>) -> Self {
        Self { client, config, metrics }
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn metrics(&self) -> &Arc<NatsMetrics> {
        &self.metrics
    }

    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    pub fn health_check(&self) -> HealthCheck {
        HealthCheck::from_metrics(&self.metrics, self.is_connected())
    }

    /// Flush pending publishes and close the connection.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Draining NATS connection");
        if let Err(e) = self.client.drain().await {
            error!(error = %e, "Error draining NATS connection");
        }
        self.metrics.set_connected(false);
        Ok(())
    }
}

#[async_trait]
impl NotificationBus for NatsBus {
    async fn notify(&self, channel: &str) -> Result<()> {
        let subject = self.config.notify_subject(channel);
        match self.client.publish(subject.clone(), Vec::new().into()).await {
            Ok(()) => {
                self.metrics.record_publish(0);
                Ok(())
            }
            Err(e) => {
                self.metrics.record_publish_failure();
                Err(Error::EventBus(format!("Failed to publish to {}: {}", subject, e)))
            }
        }
    }

    async fn listen(&self, channel: &str) -> Result<NotificationStream> {
        let subject = self.config.notify_subject(channel);
        let subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| Error::EventBus(format!("Failed to subscribe to {}: {}", subject, e)))?;
        // The server must have registered the subscription before the
        // caller reads, or a notify racing the read is lost.
        self.client
            .flush()
            .await
            .map_err(|e| Error::EventBus(format!("Failed to flush subscription: {}", e)))?;
        debug!(subject = %subject, "Listening");

        let metrics = self.metrics.clone();
        let stream = subscriber.map(move |_| metrics.record_receive());
        Ok(Box::pin(stream))
    }
}
