//! Build scheduling for Skyway.
//!
//! [`Scheduler`] is the periodic component: it resolves job inputs against
//! a cached [`VersionsDb`] snapshot with the [`algorithm`], creates pending
//! builds when trigger inputs move, and hands scheduled builds their plan
//! from the [`planner`].

pub mod algorithm;
pub mod planner;
pub mod scheduler;
pub mod versions;

pub use algorithm::{Algorithm, InputConfig, Resolution, ResolvedInput};
pub use planner::{PlanContext, plan_job};
pub use scheduler::{JobOutcome, Scheduler};
pub use versions::VersionsDb;
