//! Test infrastructure for Skyway.
//!
//! [`fixtures::System`] wires the scheduler, engine and collectors over the
//! in-memory store and a scripted worker client; the scenario tests in
//! `tests/` drive whole pipelines through it. [`TestContext`] starts
//! PostgreSQL and NATS in containers for the tests behind the
//! `integration` feature.
//!
//! # Usage
//!
//! ```ignore
//! use skyway_tests::TestContext;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::postgres_only().await.unwrap();
//!     // Use ctx.db
//! }
//! ```

pub mod containers;
pub mod context;
pub mod fixtures;

pub use context::TestContext;
pub use fixtures::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,skyway_tests=debug")))
        .with_test_writer()
        .try_init();
}
