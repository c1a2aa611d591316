//! Fleet-wide singleton execution.
//!
//! [`LeaseManager`] hands out named, heartbeated leases; [`ComponentRunner`]
//! drives a [`Task`] on a period under the lease named after it.

pub mod lease;
pub mod runner;

pub use lease::{Lease, LeaseManager};
pub use runner::{ComponentRunner, ComponentSet, Task, TickOutcome};
