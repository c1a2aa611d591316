//! Error types for Skyway.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Pipeline errors
    #[error("Team not found: {0}")]
    TeamNotFound(String),

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    #[error("Pipeline config version conflict: expected {expected}, found {found}")]
    ConfigVersionConflict { expected: i64, found: i64 },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    // Build errors
    #[error("Build not found: {0}")]
    BuildNotFound(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    // Event store errors
    #[error("Event stream for build {0} is finalized")]
    EventStreamFinalized(i64),

    #[error("Duplicate event id {event_id} for build {build_id}")]
    DuplicateEventId { build_id: i64, event_id: i64 },

    #[error("end of stream")]
    EndOfStream,

    #[error("stream closed")]
    StreamClosed,

    // Lease errors
    #[error("Lease lost: {0}")]
    LeaseLost(String),

    // Worker errors
    #[error("no workers")]
    NoWorkers,

    #[error("no workers satisfying: {0}")]
    NoWorkersSatisfying(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Invalid worker state transition: {from} -> {to}")]
    InvalidWorkerTransition { from: String, to: String },

    // Resource errors
    #[error("resource version not available")]
    VersionNotAvailable,

    #[error("{}", resource_script_message(.path, .args, .exit_status, .stderr))]
    ResourceScriptFailed {
        path: String,
        args: Vec<String>,
        exit_status: i32,
        stderr: String,
    },

    #[error("Malformed resource response: {0}")]
    MalformedResourceResponse(String),

    // Step errors
    #[error("missing artifact: {0}")]
    MissingArtifact(String),

    #[error("invalid task configuration: {0}")]
    InvalidTaskConfig(String),

    #[error("timeout exceeded")]
    StepTimeout,

    #[error("interrupted")]
    Aborted,

    // Secret errors
    #[error("Undefined variable: {0}")]
    SecretNotFound(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Encryption key does not match the key the database was encrypted with")]
    EncryptionKeyMismatch,

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Plugin protocol mismatch: expected {expected}, got {got}")]
    PluginVersionMismatch { expected: String, got: String },

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Infrastructure failures worth a bounded local retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::SerializationFailure(_)
                | Error::UniqueViolation(_)
                | Error::Network(_)
                | Error::EventBus(_)
                | Error::Plugin(_)
        )
    }

    /// Errors caused by user-supplied data; these error a step with a
    /// message on the event stream rather than crash a component.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidPlan(_)
                | Error::InvalidPipeline(_)
                | Error::MissingArtifact(_)
                | Error::InvalidTaskConfig(_)
                | Error::MalformedResourceResponse(_)
                | Error::VersionNotAvailable
                | Error::SecretNotFound(_)
        )
    }

    /// Errors that must stop the process before any component starts.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::EncryptionKeyMismatch)
    }
}

fn resource_script_message(path: &str, args: &[String], exit_status: &i32, stderr: &str) -> String {
    let mut message = format!(
        "resource script '{} {:?}' failed: exit status {}",
        path, args, exit_status
    );
    if !stderr.is_empty() {
        message.push_str("\n\nstderr:\n");
        message.push_str(stderr);
    }
    message
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
