//! PostgreSQL integration tests.
//!
//! Run with: `cargo test -p skyway-tests --test database_tests --features integration -- --ignored`

#![cfg(feature = "integration")]

use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;
use skyway_core::Error;
use skyway_core::build::BuildStatus;
use skyway_core::events::Event;
use skyway_core::pipeline::PipelineDefinition;
use skyway_core::plan::{Plan, PlanKind};
use skyway_core::ports::*;
use skyway_db::{
    PgBuildCreator, PgBuildRepository, PgBus, PgEventStore, PgLeaseRepository, PgPipelineRepository, PgTeamRepository,
    PgWorkerRepository,
};
use skyway_secrets::encryption::{seal_canary, verify_canary};
use skyway_secrets::{AesGcmStrategy, NoEncryption};
use skyway_tests::{context::TestContext, log, worker};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
#[ignore = "requires docker"]
async fn test_event_store_round_trip_and_finalize() {
    let ctx = TestContext::postgres_only().await.expect("Failed to create context");
    let pool = ctx.db.pool().clone();
    let events = Arc::new(PgEventStore::new(pool.clone()));
    events.setup().await.expect("Failed to set up event store");
    let creator = PgBuildCreator::new(pool.clone(), Arc::new(NoEncryption), events.clone());
    let team = PgTeamRepository::new(pool)
        .create_team("main")
        .await
        .expect("Failed to create team");

    let plan = Plan::new("1", PlanKind::Do(vec![]));
    let build = creator
        .create_started_build(team.id, None, &plan)
        .await
        .expect("Failed to create build");
    events
        .put(&build, vec![log("a"), log("b")])
        .await
        .expect("Failed to put events");

    let page = events.get(&build, None, 100).await.expect("Failed to get events");
    let ids: Vec<i64> = page.events.iter().map(|e| e.event_id).collect();
    assert_eq!(ids, (0..ids.len() as i64).collect::<Vec<_>>());
    let types: Vec<String> = page.events.iter().map(|e| e.message.event_type.clone()).collect();
    assert_eq!(types.last().map(String::as_str), Some("log"));
    let Ok(Event::Log(last)) = page.events[page.events.len() - 1].event() else {
        panic!("expected a log event");
    };
    assert_eq!(last.payload, "b");

    events.finalize(&build).await.expect("Failed to finalize");
    let late = events.put(&build, vec![log("late")]).await;
    assert!(matches!(late, Err(Error::EventStreamFinalized(_))));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_rerun_names_derive_from_the_original() {
    let ctx = TestContext::postgres_only().await.expect("Failed to create context");
    let pool = ctx.db.pool().clone();
    let events = Arc::new(PgEventStore::new(pool.clone()));
    events.setup().await.expect("Failed to set up event store");
    let creator = PgBuildCreator::new(pool.clone(), Arc::new(NoEncryption), events);
    let pipelines = PgPipelineRepository::new(pool.clone());
    let team = PgTeamRepository::new(pool)
        .create_team("main")
        .await
        .expect("Failed to create team");
    let config: PipelineDefinition =
        serde_json::from_value(json!({"jobs": [{"name": "j", "plan": []}]})).expect("Invalid pipeline");
    let pipeline = pipelines
        .save_pipeline(team.id, "p", &config, None, false)
        .await
        .expect("Failed to save pipeline")
        .pipeline;
    let job = pipelines
        .jobs(pipeline.id)
        .await
        .expect("Failed to list jobs")
        .remove(0);

    let original = creator.create_build(&job).await.expect("Failed to create build");
    let first = creator.rerun_build(&job, &original).await.expect("Failed to rerun");
    let second = creator.rerun_build(&job, &first).await.expect("Failed to rerun");

    assert_eq!(original.name, "1");
    assert!(original.manually_triggered);
    assert_eq!(first.name, "1.1");
    assert_eq!(second.name, "1.2");
    assert_eq!(second.rerun_of, Some(original.id));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_plans_are_stored_encrypted_and_read_back() {
    let ctx = TestContext::postgres_only().await.expect("Failed to create context");
    let pool = ctx.db.pool().clone();
    let strategy = Arc::new(AesGcmStrategy::from_master_key("correct horse battery staple"));
    let events = Arc::new(PgEventStore::new(pool.clone()));
    events.setup().await.expect("Failed to set up event store");
    let creator = PgBuildCreator::new(pool.clone(), strategy.clone(), events);
    let builds = PgBuildRepository::new(pool.clone(), strategy);
    let team = PgTeamRepository::new(pool)
        .create_team("main")
        .await
        .expect("Failed to create team");

    let plan = Plan::new("1", PlanKind::Do(vec![]));
    let build = creator
        .create_started_build(team.id, None, &plan)
        .await
        .expect("Failed to create build");
    let stored = builds
        .build(build.id)
        .await
        .expect("Failed to read build")
        .expect("Build not found");

    assert_eq!(stored.status, BuildStatus::Started);
    assert_eq!(stored.private_plan, Some(plan));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_encryption_canary_detects_a_changed_key() {
    let ctx = TestContext::postgres_only().await.expect("Failed to create context");
    let original = AesGcmStrategy::from_master_key("first key");
    let (ciphertext, nonce) = seal_canary(&original).expect("Failed to seal canary");

    assert!(
        ctx.db
            .store_encryption_canary(&ciphertext, nonce.as_deref())
            .await
            .expect("Failed to store canary")
    );
    assert!(
        !ctx.db
            .store_encryption_canary(&ciphertext, nonce.as_deref())
            .await
            .expect("Failed to store canary")
    );

    let (ciphertext, nonce) = ctx
        .db
        .encryption_canary()
        .await
        .expect("Failed to read canary")
        .expect("Canary missing");
    verify_canary(&original, &ciphertext, nonce.as_deref()).expect("Original key rejected");
    let rotated = AesGcmStrategy::from_master_key("second key");
    assert!(verify_canary(&rotated, &ciphertext, nonce.as_deref()).is_err());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_leases_are_exclusive_until_released() {
    let ctx = TestContext::postgres_only().await.expect("Failed to create context");
    let leases = PgLeaseRepository::new(ctx.db.pool().clone());
    let ttl = Duration::from_secs(30);

    assert!(leases.try_acquire("scheduler", "web-1", ttl).await.expect("Failed to acquire"));
    assert!(!leases.try_acquire("scheduler", "web-2", ttl).await.expect("Failed to acquire"));
    assert!(leases.heartbeat("scheduler", "web-1").await.expect("Failed to heartbeat"));
    assert!(!leases.heartbeat("scheduler", "web-2").await.expect("Failed to heartbeat"));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_pg_bus_delivers_notifications() {
    let ctx = TestContext::postgres_only().await.expect("Failed to create context");
    let bus = PgBus::new(ctx.db.pool().clone());

    let mut stream = bus.listen("build_events_1").await.expect("Failed to listen");
    bus.notify("build_events_1").await.expect("Failed to notify");

    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("Notification not delivered")
        .expect("Stream ended");
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_active_task_count_never_goes_negative() {
    let ctx = TestContext::postgres_only().await.expect("Failed to create context");
    let workers = PgWorkerRepository::new(ctx.db.pool().clone());
    workers.save_worker(&worker("w1")).await.expect("Failed to save worker");

    assert_eq!(workers.increase_active_tasks("w1").await.expect("Failed to increase"), 1);
    assert_eq!(workers.increase_active_tasks("w1").await.expect("Failed to increase"), 2);
    workers.save_worker(&worker("w1")).await.expect("Failed to re-register worker");
    assert_eq!(workers.decrease_active_tasks("w1").await.expect("Failed to decrease"), 1);
    assert_eq!(workers.decrease_active_tasks("w1").await.expect("Failed to decrease"), 0);
    assert_eq!(workers.decrease_active_tasks("w1").await.expect("Failed to decrease"), 0);
    assert!(matches!(
        workers.increase_active_tasks("gone").await,
        Err(Error::WorkerNotFound(_))
    ));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_scheduled_pending_build_blocks_another() {
    let ctx = TestContext::postgres_only().await.expect("Failed to create context");
    let pool = ctx.db.pool().clone();
    let events = Arc::new(PgEventStore::new(pool.clone()));
    events.setup().await.expect("Failed to set up event store");
    let creator = PgBuildCreator::new(pool.clone(), Arc::new(NoEncryption), events);
    let builds = PgBuildRepository::new(pool.clone(), Arc::new(NoEncryption));
    let pipelines = PgPipelineRepository::new(pool.clone());
    let team = PgTeamRepository::new(pool)
        .create_team("main")
        .await
        .expect("Failed to create team");
    let config: PipelineDefinition =
        serde_json::from_value(json!({"jobs": [{"name": "j", "plan": []}]})).expect("Invalid pipeline");
    let pipeline = pipelines
        .save_pipeline(team.id, "p", &config, None, false)
        .await
        .expect("Failed to save pipeline")
        .pipeline;
    let job = pipelines
        .jobs(pipeline.id)
        .await
        .expect("Failed to list jobs")
        .remove(0);

    let build = creator.create_build(&job).await.expect("Failed to create build");
    let plan = Plan::new("1", PlanKind::Do(vec![]));
    assert!(builds.schedule_build(build.id, &[], &plan).await.expect("Failed to schedule"));

    let created = creator
        .ensure_pending_build_exists(&job)
        .await
        .expect("Failed to ensure pending build");
    assert!(created.is_none());
    assert_eq!(builds.pending_builds(job.id).await.expect("Failed to list pending").len(), 1);
}
