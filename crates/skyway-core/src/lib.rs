//! Skyway Core
//!
//! Domain types, port traits, and error handling for the Skyway CI control
//! plane. Every other crate speaks this vocabulary; adapters (Postgres,
//! NATS, in-memory) implement the traits in [`ports`].

pub mod build;
pub mod channels;
pub mod check;
pub mod component;
pub mod config;
pub mod duration;
pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod pipeline;
pub mod plan;
pub mod ports;
pub mod resource;
pub mod task;
pub mod validation;
pub mod vars;
pub mod worker;

pub use error::{Error, Result};
pub use ids::*;
