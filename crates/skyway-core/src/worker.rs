//! Workers and the containers, volumes and artifacts they hold.

use crate::ids::*;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Running,
    Landing,
    Landed,
    Retiring,
    Retired,
    Stalled,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Running => "running",
            WorkerState::Landing => "landing",
            WorkerState::Landed => "landed",
            WorkerState::Retiring => "retiring",
            WorkerState::Retired => "retired",
            WorkerState::Stalled => "stalled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "running" => WorkerState::Running,
            "landing" => WorkerState::Landing,
            "landed" => WorkerState::Landed,
            "retiring" => WorkerState::Retiring,
            "retired" => WorkerState::Retired,
            "stalled" => WorkerState::Stalled,
            _ => return None,
        })
    }

    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Running, Landing)
                | (Landing, Running)
                | (Landing, Landed)
                | (Landed, Running)
                | (Running, Retiring)
                | (Retiring, Retired)
                | (Running, Stalled)
                | (Landing, Stalled)
                | (Retiring, Stalled)
                | (Stalled, Running)
                | (Stalled, Landed)
                | (Stalled, Retired)
        ) || *self == next
    }

    pub fn transition(&self, next: WorkerState) -> Result<WorkerState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidWorkerTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// States in which a worker still answers its agent endpoints.
    pub fn is_reachable(&self) -> bool {
        matches!(
            self,
            WorkerState::Running | WorkerState::Landing | WorkerState::Retiring
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A base resource type shipped with a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResourceType {
    #[serde(rename = "type")]
    pub type_name: String,
    /// Path to the type's rootfs on the worker.
    pub image: String,
    pub version: String,
    #[serde(default)]
    pub privileged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    pub state: WorkerState,
    pub platform: String,
    pub tags: Vec<String>,
    pub team_id: Option<TeamId>,
    pub garden_addr: String,
    pub baggageclaim_url: String,
    pub version: String,
    pub resource_types: Vec<WorkerResourceType>,
    pub ephemeral: bool,
    pub active_tasks: i32,
    pub start_time: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Worker {
    pub fn resource_type(&self, type_name: &str) -> Option<&WorkerResourceType> {
        self.resource_types.iter().find(|t| t.type_name == type_name)
    }
}

/// Constraints a worker must meet to host a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub platform: Option<String>,
    pub tags: Vec<String>,
    pub team_id: Option<TeamId>,
    /// Base resource type the worker must provide.
    pub resource_type: Option<String>,
}

impl WorkerSpec {
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(p) = &self.platform {
            parts.push(format!("platform '{p}'"));
        }
        if !self.tags.is_empty() {
            parts.push(format!("tags {:?}", self.tags));
        }
        if let Some(t) = &self.resource_type {
            parts.push(format!("resource type '{t}'"));
        }
        if let Some(team) = self.team_id {
            parts.push(format!("team {team}"));
        }
        if parts.is_empty() {
            "any".to_string()
        } else {
            parts.join(", ")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ContainerOwner {
    BuildStep {
        build_id: BuildId,
        plan_id: PlanId,
        team_id: TeamId,
    },
    CheckSession {
        resource_config_id: ResourceConfigId,
        expires_at: DateTime<Utc>,
    },
    ImageFetch {
        build_id: BuildId,
        plan_id: PlanId,
    },
}

impl ContainerOwner {
    pub fn build_id(&self) -> Option<BuildId> {
        match self {
            ContainerOwner::BuildStep { build_id, .. } | ContainerOwner::ImageFetch { build_id, .. } => {
                Some(*build_id)
            }
            ContainerOwner::CheckSession { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Creating,
    Created,
    Destroying,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Creating => "creating",
            ContainerState::Created => "created",
            ContainerState::Destroying => "destroying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "creating" => ContainerState::Creating,
            "created" => ContainerState::Created,
            "destroying" => ContainerState::Destroying,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub handle: ContainerHandle,
    pub worker_name: String,
    /// Cleared when the owner goes away; ownerless containers are reaped.
    pub owner: Option<ContainerOwner>,
    pub state: ContainerState,
    pub hijacked: bool,
    pub last_hijack: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeState {
    Creating,
    Created,
    Destroying,
    Destroyed,
}

impl VolumeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeState::Creating => "creating",
            VolumeState::Created => "created",
            VolumeState::Destroying => "destroying",
            VolumeState::Destroyed => "destroyed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "creating" => VolumeState::Creating,
            "created" => VolumeState::Created,
            "destroying" => VolumeState::Destroying,
            "destroyed" => VolumeState::Destroyed,
            _ => return None,
        })
    }
}

/// What keeps a volume alive. At most one per volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum VolumeAssociation {
    BaseResourceType { type_name: String },
    ResourceCache { cache_id: ResourceCacheId },
    TaskCache { job_id: JobId, step_name: String, path: String },
    ResourceCerts,
    BuildArtifact { artifact_id: ArtifactId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub handle: VolumeHandle,
    pub worker_name: String,
    pub team_id: Option<TeamId>,
    pub state: VolumeState,
    pub association: Option<VolumeAssociation>,
    /// Container the volume is mounted into, if any.
    pub container_handle: Option<ContainerHandle>,
    /// Copy-on-write parent.
    pub parent_handle: Option<VolumeHandle>,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

impl Volume {
    pub fn is_owned(&self) -> bool {
        self.association.is_some() || self.container_handle.is_some()
    }
}

/// What an artifact is attached to. Artifacts without one are orphans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ArtifactAssociation {
    BaseResourceType { type_name: String },
    ResourceCache { cache_id: ResourceCacheId },
    TaskCache { job_id: JobId, step_name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerArtifact {
    pub id: ArtifactId,
    pub name: String,
    pub build_id: Option<BuildId>,
    pub worker_name: Option<String>,
    pub association: Option<ArtifactAssociation>,
    pub initialized: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_state_machine() {
        assert!(WorkerState::Running.can_transition_to(WorkerState::Landing));
        assert!(WorkerState::Landing.can_transition_to(WorkerState::Running));
        assert!(WorkerState::Stalled.can_transition_to(WorkerState::Running));
        assert!(WorkerState::Retiring.transition(WorkerState::Retired).is_ok());
        assert!(WorkerState::Retired.transition(WorkerState::Running).is_err());
        assert!(WorkerState::Landed.transition(WorkerState::Retiring).is_err());
    }

    #[test]
    fn test_worker_spec_describe() {
        let spec = WorkerSpec {
            platform: Some("linux".into()),
            tags: vec!["gpu".into()],
            team_id: None,
            resource_type: None,
        };
        assert_eq!(spec.describe(), "platform 'linux', tags [\"gpu\"]");
    }
}
