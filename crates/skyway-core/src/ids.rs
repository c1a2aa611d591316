//! Strongly-typed identifiers for domain entities.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Row identifiers allocated by the store.
macro_rules! define_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            pub const fn get(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }
    };
}

define_id!(TeamId);
define_id!(PipelineId);
define_id!(ResourceId);
define_id!(ResourceTypeId);
define_id!(JobId);
define_id!(BuildId);
define_id!(ResourceConfigId);
define_id!(ResourceCacheId);
define_id!(VersionId);
define_id!(CheckId);
define_id!(ArtifactId);

/// Handles are opaque names shared with worker agents.
macro_rules! define_handle {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn new(handle: impl Into<String>) -> Self {
                Self(handle.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_handle!(ContainerHandle);
define_handle!(VolumeHandle);

/// Stable identifier of a node within a build plan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(String);

impl PlanId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic configuration version of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigVersion(i64);

impl ConfigVersion {
    pub const fn new(version: i64) -> Self {
        Self(version)
    }

    pub const fn get(&self) -> i64 {
        self.0
    }

    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ConfigVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_id_display() {
        assert_eq!(BuildId::new(42).to_string(), "42");
    }

    #[test]
    fn test_build_id_parse() {
        let parsed: BuildId = "17".parse().unwrap();
        assert_eq!(parsed, BuildId::new(17));
    }

    #[test]
    fn test_handles_are_unique() {
        assert_ne!(ContainerHandle::generate(), ContainerHandle::generate());
    }

    #[test]
    fn test_config_version_next() {
        assert!(ConfigVersion::new(3).next() > ConfigVersion::new(3));
    }
}
