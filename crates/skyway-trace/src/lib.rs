//! Logging and tracing for Skyway.
//!
//! [`init_tracer`] installs the process-wide subscriber with optional OTLP
//! export; the span helpers give builds, steps, checks and components
//! consistent attributes.

pub mod spans;
pub mod tracer;

pub use spans::{CiAttributes, build_span, check_span, collector_span, component_span, step_span};
pub use tracer::{LogFormat, OtlpConfig, TracerError, TracingConfig, init_tracer, shutdown_tracer};
