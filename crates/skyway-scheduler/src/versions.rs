//! Cached version snapshots per pipeline.
//!
//! A snapshot is reused until the store's modified-time sentinel moves past
//! the time it was taken at, so repeated scheduling passes over an idle
//! pipeline do not reload every version.

use skyway_core::Result;
use skyway_core::ids::PipelineId;
use skyway_core::ports::{VersionRepository, VersionsSnapshot};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub struct VersionsDb {
    repo: Arc<dyn VersionRepository>,
    row_limit: usize,
    cache: Mutex<HashMap<PipelineId, Arc<VersionsSnapshot>>>,
}

impl VersionsDb {
    pub fn new(repo: Arc<dyn VersionRepository>, row_limit: usize) -> Self {
        Self {
            repo,
            row_limit: row_limit.max(1),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn row_limit(&self) -> usize {
        self.row_limit
    }

    /// The pipeline's snapshot, reloaded only if the store changed since the
    /// cached copy was taken.
    pub async fn snapshot(&self, pipeline_id: PipelineId) -> Result<Arc<VersionsSnapshot>> {
        let modified = self.repo.versions_modified_at(pipeline_id).await?;
        if let Some(cached) = self.cached(pipeline_id)
            && cached.cached_at == Some(modified)
        {
            return Ok(cached);
        }

        let mut snapshot = self.repo.versions_snapshot(pipeline_id, self.row_limit).await?;
        // Stamp with the sentinel read before loading: a write that lands
        // mid-load moves the sentinel again and forces another reload.
        snapshot.cached_at = Some(modified);
        let snapshot = Arc::new(snapshot);
        debug!(pipeline_id = %pipeline_id, cached_at = %modified, "Loaded versions snapshot");

        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pipeline_id, snapshot.clone());
        Ok(snapshot)
    }

    pub fn invalidate(&self, pipeline_id: PipelineId) {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pipeline_id);
    }

    fn cached(&self, pipeline_id: PipelineId) -> Option<Arc<VersionsSnapshot>> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pipeline_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyway_core::check::CheckTarget;
    use skyway_core::pipeline::PipelineDefinition;
    use skyway_core::ports::{PipelineRepository, ResourceConfigRepository, TeamRepository};
    use skyway_core::resource::{ResourceConfigDescriptor, Version};
    use skyway_db::MemoryStore;

    const PIPELINE: &str = r#"{
        "resources": [{"name": "repo", "type": "git", "source": {"uri": "r"}}],
        "jobs": [{"name": "unit", "plan": [{"get": {"name": "repo", "trigger": true}}]}]
    }"#;

    #[tokio::test]
    async fn test_snapshot_reused_until_store_changes() {
        let store = Arc::new(MemoryStore::new());
        let team = store.create_team("main").await.unwrap();
        let config: PipelineDefinition = serde_json::from_str(PIPELINE).unwrap();
        let pipeline = store.save_pipeline(team.id, "p", &config, None, false).await.unwrap().pipeline;
        let resource = store.resources(pipeline.id).await.unwrap().remove(0);
        let rc = store
            .find_or_create_config(&ResourceConfigDescriptor::new("git", resource.source.clone()))
            .await
            .unwrap();
        store
            .set_resource_config(CheckTarget::Resource(resource.id), rc.id)
            .await
            .unwrap();

        let db = VersionsDb::new(store.clone(), 100);
        let first = db.snapshot(pipeline.id).await.unwrap();
        let again = db.snapshot(pipeline.id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        store
            .save_versions(rc.id, &[Version::new().with("ref", "v1")])
            .await
            .unwrap();
        let fresh = db.snapshot(pipeline.id).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert_eq!(fresh.resource_versions[&resource.id].len(), 1);
        assert!(fresh.cached_at > first.cached_at);

        db.invalidate(pipeline.id);
        let reloaded = db.snapshot(pipeline.id).await.unwrap();
        assert!(!Arc::ptr_eq(&fresh, &reloaded));
    }
}
