//! Configuration for the NATS transport.

use std::time::Duration;

/// Configuration for the NATS connection.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URLs (comma-separated for cluster).
    pub urls: Vec<String>,
    /// Prefix of every subject Skyway publishes on.
    pub subject_prefix: String,
    /// Maximum reconnection attempts.
    pub max_reconnect_attempts: Option<usize>,
    /// Connection timeout.
    pub connection_timeout: Duration,
    /// Timeout of plugin request/reply calls.
    pub request_timeout: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            urls: vec!["nats://localhost:4222".to_string()],
            subject_prefix: "skyway".to_string(),
            max_reconnect_attempts: None, // Unlimited
            connection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl NatsConfig {
    /// Create a new config with a single URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    /// Set multiple server URLs for cluster support.
    pub fn with_urls(mut self, urls: Vec<String>) -> Self {
        self.urls = urls;
        self
    }

    pub fn with_subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.subject_prefix = prefix.into();
        self
    }

    /// Set max reconnection attempts.
    pub fn with_max_reconnects(mut self, max: usize) -> Self {
        self.max_reconnect_attempts = Some(max);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Subject a notification channel maps to.
    pub fn notify_subject(&self, channel: &str) -> String {
        format!("{}.notify.{}", self.subject_prefix, channel)
    }

    /// Subject of one event store plugin method.
    pub fn plugin_subject(&self, method: &str) -> String {
        format!("{}.eventstore.{}", self.subject_prefix, method)
    }

    pub(crate) async fn connect(&self, metrics: &std::sync::Arc<crate::NatsMetrics>) -> skyway_core::Result<async_nats::Client> {
        let urls = self.urls.join(",");
        let events = metrics.clone();
        let mut options = async_nats::ConnectOptions::new()
            .connection_timeout(self.connection_timeout)
            .request_timeout(Some(self.request_timeout))
            .retry_on_initial_connect()
            .event_callback(move |event| {
                let metrics = events.clone();
                async move {
                    match event {
                        async_nats::Event::Connected => metrics.set_connected(true),
                        async_nats::Event::Disconnected => {
                            metrics.set_connected(false);
                            metrics.record_reconnect();
                        }
                        _ => {}
                    }
                }
            });
        if let Some(max) = self.max_reconnect_attempts {
            options = options.max_reconnects(max);
        }

        let client = options
            .connect(&urls)
            .await
            .map_err(|e| skyway_core::Error::EventBus(format!("Failed to connect to NATS: {}", e)))?;
        metrics.set_connected(true);
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = NatsConfig::new("nats://localhost:4222")
            .with_subject_prefix("ci")
            .with_max_reconnects(5)
            .with_request_timeout(Duration::from_secs(1));

        assert_eq!(config.subject_prefix, "ci");
        assert_eq!(config.max_reconnect_attempts, Some(5));
        assert_eq!(config.request_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_subjects() {
        let config = NatsConfig::default();
        assert_eq!(config.notify_subject("build_events_7"), "skyway.notify.build_events_7");
        assert_eq!(config.plugin_subject("put"), "skyway.eventstore.put");
    }
}
