//! Build execution for Skyway.
//!
//! The [`Interpreter`] walks a build's plan tree: `do`, `in_parallel`,
//! `try`, `timeout` and `retry` nodes compose the leaf steps in [`steps`],
//! and every node may carry hooks. The [`Tracker`] component attaches an
//! [`Engine`] run to each in-flight build under a per-build lease.

pub mod context;
pub mod engine;
pub mod image;
pub mod interpreter;
pub mod outcome;
pub mod steps;
#[cfg(test)]
mod testing;
pub mod tracker;

pub use context::{EngineConfig, EngineContext};
pub use engine::Engine;
pub use interpreter::Interpreter;
pub use outcome::Outcome;
pub use steps::check::run_check;
pub use tracker::Tracker;
