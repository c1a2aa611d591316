//! Integration tests for skyway-nats.
//!
//! These tests require a running NATS server.
//! Run with: `cargo test -p skyway-nats --features integration`
//!
//! To start NATS: `docker run -p 4222:4222 nats:latest`

#![cfg(feature = "integration")]

use futures::StreamExt;
use skyway_core::plan::{Plan, PlanKind};
use skyway_core::ports::{BuildCreator, EventStore, NotificationBus, TeamRepository};
use skyway_db::MemoryStore;
use skyway_nats::{NatsBus, NatsConfig, PluginEventStore, PluginServer};
use std::sync::Arc;
use std::time::Duration;

const NATS_URL: &str = "nats://localhost:4222";

#[tokio::test]
async fn test_notify_reaches_listener() {
    let bus = NatsBus::connect(NATS_URL).await.expect("connect");

    let mut stream = bus.listen("build_events_1").await.expect("listen");
    bus.notify("build_events_1").await.expect("notify");

    let got = tokio::time::timeout(Duration::from_secs(5), stream.next()).await;
    assert_eq!(got.expect("notification"), Some(()));
    assert_eq!(bus.metrics().snapshot().messages_published, 1);
}

#[tokio::test]
async fn test_health_check() {
    let bus = NatsBus::connect(NATS_URL).await.expect("connect");

    let health = bus.health_check();
    assert!(health.status.is_healthy());
    assert!(health.connected);
}

#[tokio::test]
async fn test_plugin_round_trip() {
    let config = NatsConfig::new(NATS_URL).with_subject_prefix("skyway-it");
    let server_bus = NatsBus::connect_with_config(config.clone()).await.expect("connect");
    let client_bus = NatsBus::connect_with_config(config.clone()).await.expect("connect");

    let store = Arc::new(MemoryStore::new());
    let team = store.create_team("main").await.expect("team");
    let build = store
        .create_started_build(team.id, None, &Plan::new("1", PlanKind::Do(vec![])))
        .await
        .expect("build");

    let server = PluginServer::new(store.clone());
    let server_client = server_bus.client().clone();
    let server_config = config.clone();
    let serving = tokio::spawn(async move { server.serve(server_client, &server_config).await });

    let plugin = PluginEventStore::over_nats(client_bus.client().clone(), config, client_bus.metrics().clone());
    plugin.setup().await.expect("setup");

    let page = plugin.get(&build, None, 10).await.expect("get");
    assert_eq!(page.events.len(), 1);
    assert_eq!(page.events[0].message.event_type, "status");

    serving.abort();
}

#[tokio::test]
async fn test_graceful_shutdown() {
    let bus = NatsBus::connect(NATS_URL).await.expect("connect");
    assert!(bus.is_connected());

    bus.shutdown().await.expect("shutdown");
    assert!(!bus.metrics().snapshot().connected);
}
