//! NATS integration tests: the notification bus and the event store plugin.
//!
//! Run with: `cargo test -p skyway-tests --test nats_tests --features integration -- --ignored`

#![cfg(feature = "integration")]

use futures::StreamExt;
use pretty_assertions::assert_eq;
use skyway_core::events::Event;
use skyway_core::plan::{Plan, PlanKind};
use skyway_core::ports::*;
use skyway_db::MemoryStore;
use skyway_nats::{NatsBus, NatsConfig, PluginEventStore, PluginServer};
use skyway_tests::{context::TestContext, log};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
#[ignore = "requires docker"]
async fn test_notify_reaches_listener() {
    let ctx = TestContext::nats_only().await.expect("Failed to create context");

    let mut stream = ctx.bus.listen("build_started").await.expect("Failed to listen");
    ctx.bus.notify("build_started").await.expect("Failed to notify");

    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("Notification not delivered")
        .expect("Stream ended");
    assert!(ctx.bus.metrics().snapshot().messages_published >= 1);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_channels_are_isolated() {
    let ctx = TestContext::nats_only().await.expect("Failed to create context");

    let mut quiet = ctx.bus.listen("build_abort_1").await.expect("Failed to listen");
    ctx.bus.notify("build_abort_2").await.expect("Failed to notify");

    let woke = tokio::time::timeout(Duration::from_millis(300), quiet.next()).await;
    assert!(woke.is_err());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_plugin_event_store_over_nats() {
    let ctx = TestContext::nats_only().await.expect("Failed to create context");
    let config = NatsConfig::new(ctx.nats_url());

    let backing = Arc::new(MemoryStore::new());
    let team = backing.create_team("main").await.expect("Failed to create team");
    let plan = Plan::new("1", PlanKind::Do(vec![]));
    let build = backing
        .create_started_build(team.id, None, &plan)
        .await
        .expect("Failed to create build");

    let server = PluginServer::new(backing.clone());
    let server_client = ctx.bus.client().clone();
    let server_config = config.clone();
    let serving = tokio::spawn(async move { server.serve(server_client, &server_config).await });

    let plugin_bus = NatsBus::connect(ctx.nats_url()).await.expect("Failed to connect");
    let store = PluginEventStore::over_nats(plugin_bus.client().clone(), config, plugin_bus.metrics().clone());
    store.setup().await.expect("Plugin handshake failed");
    store.put(&build, vec![log("a"), log("b")]).await.expect("Failed to put events");

    let page = store.get(&build, None, 10).await.expect("Failed to get events");
    let types: Vec<&str> = page.events.iter().map(|e| e.message.event_type.as_str()).collect();
    assert_eq!(types, vec!["status", "log", "log"]);
    let Ok(Event::Log(last)) = page.events[2].event() else {
        panic!("expected a log event");
    };
    assert_eq!(last.payload, "b");

    // Writes went to the plugin's own store.
    let local = EventStore::get(backing.as_ref(), &build, None, 10).await.expect("Failed to read backing store");
    assert_eq!(local.events.len(), 3);

    serving.abort();
}
