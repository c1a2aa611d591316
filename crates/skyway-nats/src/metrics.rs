//! Counters for the NATS transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct NatsMetrics {
    /// Notifications published.
    pub messages_published: AtomicU64,
    /// Notifications received by listeners.
    pub messages_received: AtomicU64,
    pub publish_failures: AtomicU64,
    /// Plugin requests sent.
    pub requests: AtomicU64,
    pub request_failures: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    /// Current connection state (0 = disconnected, 1 = connected).
    pub connected: AtomicU64,
    pub bytes_published: AtomicU64,
}

impl NatsMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_publish(&self, bytes: u64) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        self.bytes_published.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_receive(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request(&self, bytes: u64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_published.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_request_failure(&self) {
        self.request_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            request_failures: self.request_failures.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed) == 1,
            bytes_published: self.bytes_published.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_published: u64,
    pub messages_received: u64,
    pub publish_failures: u64,
    pub requests: u64,
    pub request_failures: u64,
    pub reconnect_attempts: u64,
    pub connected: bool,
    pub bytes_published: u64,
}

impl MetricsSnapshot {
    /// Share of failed operations among all attempted ones.
    pub fn failure_ratio(&self) -> f64 {
        let failures = self.publish_failures + self.request_failures;
        let attempts = self.messages_published + self.requests + failures;
        if attempts == 0 {
            0.0
        } else {
            failures as f64 / attempts as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = NatsMetrics::new();
        metrics.record_publish(10);
        metrics.record_request(5);
        metrics.record_request_failure();
        metrics.set_connected(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_published, 1);
        assert_eq!(snapshot.requests, 1);
        assert_eq!(snapshot.bytes_published, 15);
        assert!(snapshot.connected);
        assert!((snapshot.failure_ratio() - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_failure_ratio_without_traffic() {
        assert_eq!(MetricsSnapshot::default().failure_ratio(), 0.0);
    }
}
