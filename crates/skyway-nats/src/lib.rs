//! NATS transport for Skyway: a notification bus and the client side of
//! the out-of-process event store plugin.

mod bus;
pub mod config;
pub mod health;
pub mod metrics;
pub mod plugin;

pub use bus::NatsBus;
pub use config::NatsConfig;
pub use health::{HealthCheck, HealthStatus};
pub use metrics::{MetricsSnapshot, NatsMetrics};
pub use plugin::{NatsTransport, PluginEventStore, PluginServer, PluginTransport};
