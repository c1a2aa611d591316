//! Resources, resource types, versions, configs and caches.

use crate::ids::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

/// Opaque key/value configuration handed to resource scripts.
pub type Source = Map<String, Value>;

/// Opaque step parameters handed to resource scripts.
pub type Params = Map<String, Value>;

/// A resource version. Keys are kept sorted, so the JSON encoding is
/// canonical and doubles as the version's identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(BTreeMap<String, String>);

impl Version {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Canonical JSON encoding.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }

    /// SHA-256 of the canonical JSON, used as a stable row key.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_json().as_bytes()))
    }

    /// True if every pair in `subset` is present in this version.
    pub fn contains(&self, subset: &Version) -> bool {
        subset.0.iter().all(|(k, v)| self.0.get(k) == Some(v))
    }
}

impl From<BTreeMap<String, String>> for Version {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

/// A named source of versions within a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub pipeline_id: PipelineId,
    pub team_id: TeamId,
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub source: Source,
    pub check_every: Option<Duration>,
    pub check_timeout: Option<Duration>,
    pub tags: Vec<String>,
    pub pinned_version: Option<Version>,
    pub webhook_token: Option<String>,
    pub icon: Option<String>,
    pub paused: bool,
    pub public: bool,
    pub check_error: Option<String>,
    pub resource_config_id: Option<ResourceConfigId>,
}

/// A custom resource type declared by a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceType {
    pub id: ResourceTypeId,
    pub pipeline_id: PipelineId,
    pub team_id: TeamId,
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub source: Source,
    pub params: Params,
    pub privileged: bool,
    pub check_every: Option<Duration>,
    pub tags: Vec<String>,
    pub check_error: Option<String>,
    pub resource_config_id: Option<ResourceConfigId>,
}

/// A resource type together with the version its image should be fetched at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedResourceType {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub source: Source,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    pub version: Option<Version>,
}

/// A version recorded under a resource config scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceVersion {
    pub id: VersionId,
    pub resource_config_id: ResourceConfigId,
    pub version: Version,
    pub metadata: Vec<MetadataField>,
    /// Insertion order; later checks sort after earlier ones.
    pub check_order: i64,
}

/// Identity of "this resource type with this source".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfigDescriptor {
    #[serde(rename = "type")]
    pub type_name: String,
    pub source: Source,
}

impl ResourceConfigDescriptor {
    pub fn new(type_name: impl Into<String>, source: Source) -> Self {
        Self {
            type_name: type_name.into(),
            source,
        }
    }

    /// Content hash of type and source.
    pub fn signature(&self) -> String {
        signature(&serde_json::json!({
            "type": self.type_name,
            "source": self.source,
        }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub id: ResourceConfigId,
    #[serde(rename = "type")]
    pub type_name: String,
    pub source_hash: String,
    pub last_check_start_time: Option<DateTime<Utc>>,
    pub last_check_end_time: Option<DateTime<Utc>>,
    pub last_check_succeeded: bool,
    pub created_at: DateTime<Utc>,
}

/// Identity of the output of fetching a config at a version with params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceCacheDescriptor {
    #[serde(rename = "type")]
    pub type_name: String,
    pub source: Source,
    pub params: Params,
    pub version: Version,
}

impl ResourceCacheDescriptor {
    pub fn signature(&self) -> String {
        signature(&serde_json::to_value(self).unwrap_or(Value::Null))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceCache {
    pub id: ResourceCacheId,
    pub resource_config_id: ResourceConfigId,
    pub version: Version,
    pub params_hash: String,
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

/// Who holds a use on a resource cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum CacheUser {
    Build(BuildId),
    Container(ResourceConfigId),
}

/// A version result returned by `in` and `out` scripts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionResult {
    pub version: Version,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

/// SHA-256 of a JSON value. `serde_json` keeps map keys sorted, so equal
/// values hash equally.
pub fn signature(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}
