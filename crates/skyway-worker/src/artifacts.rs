//! Per-build artifact registry: step and output names to the volumes that
//! hold them.

use skyway_core::ids::VolumeHandle;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactVolume {
    pub handle: VolumeHandle,
    pub worker_name: String,
}

#[derive(Debug, Default)]
pub struct BuildArtifacts {
    volumes: RwLock<BTreeMap<String, ArtifactVolume>>,
}

impl BuildArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later registrations under the same name win, as when a task output
    /// shadows the input it was given.
    pub fn register(&self, name: impl Into<String>, volume: ArtifactVolume) {
        self.volumes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), volume);
    }

    pub fn get(&self, name: &str) -> Option<ArtifactVolume> {
        self.volumes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.volumes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<(String, ArtifactVolume)> {
        self.volumes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Resolve a `name/path/inside` reference into its artifact and the
    /// path within it.
    pub fn resolve_path<'a>(&self, path: &'a str) -> Option<(ArtifactVolume, &'a str)> {
        let (name, rest) = path.split_once('/')?;
        self.get(name).map(|volume| (volume, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(worker: &str) -> ArtifactVolume {
        ArtifactVolume {
            handle: VolumeHandle::generate(),
            worker_name: worker.to_string(),
        }
    }

    #[test]
    fn test_register_overwrites() {
        let artifacts = BuildArtifacts::new();
        let first = volume("a");
        let second = volume("b");
        artifacts.register("repo", first);
        artifacts.register("repo", second.clone());
        assert_eq!(artifacts.get("repo"), Some(second));
        assert_eq!(artifacts.names(), vec!["repo".to_string()]);
    }

    #[test]
    fn test_resolve_path() {
        let artifacts = BuildArtifacts::new();
        let repo = volume("a");
        artifacts.register("repo", repo.clone());

        assert_eq!(artifacts.resolve_path("repo/ci/pipeline.yml"), Some((repo, "ci/pipeline.yml")));
        assert_eq!(artifacts.resolve_path("other/pipeline.yml"), None);
        assert_eq!(artifacts.resolve_path("repo"), None);
    }
}
