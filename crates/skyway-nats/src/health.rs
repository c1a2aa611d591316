//! Health of the NATS connection.

use crate::metrics::NatsMetrics;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Connected, but operations have failed.
    Degraded { reason: String },
    Unhealthy { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Healthy or degraded.
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded { .. })
    }
}

#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub connected: bool,
    pub reconnect_attempts: u64,
    pub messages_published: u64,
    pub requests: u64,
    pub failures: u64,
}

impl HealthCheck {
    pub fn from_metrics(metrics: &Arc<NatsMetrics>, connected: bool) -> Self {
        let snapshot = metrics.snapshot();
        let failures = snapshot.publish_failures + snapshot.request_failures;

        let status = if !connected {
            HealthStatus::Unhealthy {
                reason: "Not connected to NATS".to_string(),
            }
        } else if failures > 0 {
            HealthStatus::Degraded {
                reason: format!("{} failed operations recorded", failures),
            }
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            connected,
            reconnect_attempts: snapshot.reconnect_attempts,
            messages_published: snapshot.messages_published,
            requests: snapshot.requests,
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_from_metrics() {
        let metrics = NatsMetrics::new();
        assert!(HealthCheck::from_metrics(&metrics, true).status.is_healthy());

        metrics.record_publish_failure();
        let degraded = HealthCheck::from_metrics(&metrics, true);
        assert!(degraded.status.is_operational());
        assert!(!degraded.status.is_healthy());

        let down = HealthCheck::from_metrics(&metrics, false);
        assert!(!down.status.is_operational());
    }
}
