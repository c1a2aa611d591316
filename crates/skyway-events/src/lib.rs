//! Build event streams.
//!
//! [`subscribe`] follows a build's events from an offset, waking on the
//! build's notification channel. [`BuildEmitter`] is the write side used by
//! the engine, with [`LogSink`] turning process output into `log` events.

pub mod emitter;
pub mod subscription;

pub use emitter::{BuildEmitter, LogSink};
pub use subscription::{EventStream, SubscribeOptions, subscribe};
