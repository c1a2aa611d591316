//! Credential managers.

use async_trait::async_trait;
use serde_json::Value;
use skyway_core::vars::{VarRef, Variables};
use skyway_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// A secret value with metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SecretValue {
    /// A string, or a map for secrets read with `((name.field))`.
    pub value: Value,
    pub version: Option<String>,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl SecretValue {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            version: None,
            created_at: None,
        }
    }
}

/// A backend that resolves credential paths.
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Get a secret by path; `None` when it does not exist.
    async fn get(&self, path: &str) -> Result<Option<SecretValue>>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

/// Environment variable secret provider.
pub struct EnvProvider {
    prefix: Option<String>,
}

impl EnvProvider {
    pub fn new(prefix: Option<String>) -> Self {
        Self { prefix }
    }

    fn resolve_name(&self, path: &str) -> String {
        let name = path.replace(['/', '-'], "_").to_uppercase();
        match &self.prefix {
            Some(p) => format!("{p}_{name}"),
            None => name,
        }
    }
}

impl Default for EnvProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl SecretProvider for EnvProvider {
    async fn get(&self, path: &str) -> Result<Option<SecretValue>> {
        Ok(std::env::var(self.resolve_name(path)).ok().map(SecretValue::new))
    }

    fn name(&self) -> &str {
        "env"
    }
}

/// File-backed secrets, for development and tests.
pub struct FileProvider {
    secrets: HashMap<String, Value>,
}

impl FileProvider {
    pub fn from_map(secrets: HashMap<String, Value>) -> Self {
        Self { secrets }
    }

    /// Load a JSON or YAML document of `path: value` pairs.
    pub async fn load_from_file(path: &std::path::Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Internal(format!("failed to read secrets file: {e}")))?;
        let secrets: HashMap<String, Value> = serde_yaml::from_str(&content)?;
        Ok(Self { secrets })
    }
}

#[async_trait]
impl SecretProvider for FileProvider {
    async fn get(&self, path: &str) -> Result<Option<SecretValue>> {
        Ok(self.secrets.get(path).cloned().map(SecretValue::new))
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// Exposes a provider as a `((var))` source. Team- and pipeline-scoped
/// lookups are tried before the bare path.
pub struct ProviderVariables {
    provider: Arc<dyn SecretProvider>,
    /// Named source this provider answers for; `None` answers unqualified
    /// references.
    source: Option<String>,
    scopes: Vec<String>,
}

impl ProviderVariables {
    pub fn new(provider: Arc<dyn SecretProvider>) -> Self {
        Self {
            provider,
            source: None,
            scopes: Vec::new(),
        }
    }

    pub fn named(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Look up `<team>/<pipeline>/<path>` then `<team>/<path>` first.
    pub fn scoped(mut self, team: &str, pipeline: Option<&str>) -> Self {
        let mut scopes = Vec::new();
        if let Some(pipeline) = pipeline {
            scopes.push(format!("{team}/{pipeline}"));
        }
        scopes.push(team.to_string());
        self.scopes = scopes;
        self
    }
}

#[async_trait]
impl Variables for ProviderVariables {
    async fn get(&self, var: &VarRef) -> Result<Option<Value>> {
        if var.source != self.source {
            return Ok(None);
        }
        for scope in &self.scopes {
            let path = format!("{scope}/{}", var.path);
            if let Some(found) = self.provider.get(&path).await? {
                return Ok(Some(found.value));
            }
        }
        Ok(self.provider.get(&var.path).await?.map(|found| found.value))
    }
}
