//! Resource checking for Skyway.
//!
//! The [`Scanner`] decides which resources and resource types are due and
//! queues a check for each; the [`Checker`] claims queued checks and runs
//! the type's `check` script through the engine.

pub mod checker;
pub mod scanner;

#[cfg(test)]
mod testing;

pub use checker::Checker;
pub use scanner::Scanner;
