//! Secrets handling for Skyway: encryption of data at rest, credential
//! managers behind `((var))` interpolation, and redaction of build output.

pub mod encryption;
pub mod manager;
pub mod providers;
pub mod redact;

pub use encryption::{AesGcmStrategy, NoEncryption};
pub use manager::{VarSourcePool, VarSourcePoolConfig};
pub use providers::{EnvProvider, FileProvider, ProviderVariables, SecretProvider, SecretValue};
pub use redact::{REDACTED, RedactingWriter};
