//! Finds resources and resource types whose next check is due and queues
//! a check for each.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, stream};
use skyway_component::Task;
use skyway_core::Result;
use skyway_core::check::CheckTarget;
use skyway_core::config::CoreConfig;
use skyway_core::ids::{PipelineId, ResourceConfigId};
use skyway_core::plan::CheckPlan;
use skyway_core::ports::*;
use skyway_core::resource::{Resource, ResourceConfigDescriptor, ResourceType, Source, VersionedResourceType};
use skyway_core::vars::{Variables, interpolate_map};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SCAN_CONCURRENCY: usize = 16;

/// One thing to check, resolved against its pipeline's custom types.
struct Target<'a> {
    target: CheckTarget,
    name: &'a str,
    type_name: &'a str,
    source: &'a Source,
    tags: &'a [String],
    current_config: Option<ResourceConfigId>,
    check_every: Option<Duration>,
    check_timeout: Option<Duration>,
    /// Custom types visible to this target; a type never sees itself.
    resource_types: Vec<VersionedResourceType>,
}

pub struct Scanner {
    pipelines: Arc<dyn PipelineRepository>,
    configs: Arc<dyn ResourceConfigRepository>,
    versions: Arc<dyn VersionRepository>,
    checks: Arc<dyn CheckRepository>,
    vars: Arc<dyn Variables>,
    default_interval: Duration,
    check_timeout: Duration,
}

impl Scanner {
    pub fn new(
        pipelines: Arc<dyn PipelineRepository>,
        configs: Arc<dyn ResourceConfigRepository>,
        versions: Arc<dyn VersionRepository>,
        checks: Arc<dyn CheckRepository>,
        vars: Arc<dyn Variables>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            pipelines,
            configs,
            versions,
            checks,
            vars,
            default_interval: config.resource_checking_interval(),
            check_timeout: config.global_resource_check_timeout(),
        }
    }

    /// Custom types of every active pipeline, paired with the latest
    /// version of each type's image.
    async fn versioned_types(&self, types: &[ResourceType]) -> Result<HashMap<PipelineId, Vec<VersionedResourceType>>> {
        let mut by_pipeline: HashMap<PipelineId, Vec<VersionedResourceType>> = HashMap::new();
        for rt in types {
            let version = match rt.resource_config_id {
                Some(config_id) => self.versions.latest_version(config_id).await?.map(|v| v.version),
                None => None,
            };
            by_pipeline.entry(rt.pipeline_id).or_default().push(VersionedResourceType {
                name: rt.name.clone(),
                type_name: rt.type_name.clone(),
                source: rt.source.clone(),
                params: rt.params.clone(),
                privileged: rt.privileged,
                tags: rt.tags.clone(),
                version,
            });
        }
        Ok(by_pipeline)
    }

    /// Returns whether a check was queued.
    async fn scan(&self, target: Target<'_>, now: DateTime<Utc>) -> Result<bool> {
        if let Some(blocking) = unchecked_dependency(target.type_name, &target.resource_types) {
            debug!(name = %target.name, resource_type = %blocking, "Waiting for custom type to be checked");
            return Ok(false);
        }

        let source = match interpolate_map(target.source, self.vars.as_ref()).await {
            Ok((source, _)) => source,
            Err(e) => {
                warn!(name = %target.name, error = %e, "Cannot resolve check source");
                self.pipelines
                    .set_check_error(target.target, Some(e.to_string()))
                    .await?;
                return Ok(false);
            }
        };
        let config = self
            .configs
            .find_or_create_config(&ResourceConfigDescriptor::new(target.type_name, source))
            .await?;
        if target.current_config != Some(config.id) {
            self.pipelines.set_resource_config(target.target, config.id).await?;
        }

        let interval = target.check_every.unwrap_or(self.default_interval);
        if let Some(end) = config.last_check_end_time
            && chrono::Duration::from_std(interval).is_ok_and(|interval| now - end < interval)
        {
            return Ok(false);
        }

        let timeout = target
            .check_timeout
            .map_or(self.check_timeout, |t| t.min(self.check_timeout));
        let plan = CheckPlan {
            type_name: target.type_name.to_string(),
            // Stored uninterpolated; the checker resolves credentials at run time.
            source: target.source.clone(),
            from_version: self.versions.latest_version(config.id).await?.map(|v| v.version),
            timeout_secs: timeout.as_secs().max(1),
            tags: target.tags.to_vec(),
            resource_types: target.resource_types,
        };
        match self.checks.create_check(config.id, target.target, &plan).await? {
            Some(check) => {
                debug!(name = %target.name, check_id = %check.id, config_id = %config.id, "Queued check");
                Ok(true)
            }
            None => {
                debug!(name = %target.name, config_id = %config.id, "Check already in flight");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Task for Scanner {
    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let now = Utc::now();
        let types = self.pipelines.active_resource_types().await?;
        let resources: Vec<Resource> = self
            .pipelines
            .active_resources()
            .await?
            .into_iter()
            .filter(|r| !r.paused)
            .collect();
        let versioned = self.versioned_types(&types).await?;

        let mut targets = Vec::with_capacity(types.len() + resources.len());
        for rt in &types {
            let visible = versioned
                .get(&rt.pipeline_id)
                .map(|all| all.iter().filter(|t| t.name != rt.name).cloned().collect())
                .unwrap_or_default();
            targets.push(Target {
                target: CheckTarget::ResourceType(rt.id),
                name: &rt.name,
                type_name: &rt.type_name,
                source: &rt.source,
                tags: &rt.tags,
                current_config: rt.resource_config_id,
                check_every: rt.check_every,
                check_timeout: None,
                resource_types: visible,
            });
        }
        for resource in &resources {
            targets.push(Target {
                target: CheckTarget::Resource(resource.id),
                name: &resource.name,
                type_name: &resource.type_name,
                source: &resource.source,
                tags: &resource.tags,
                current_config: resource.resource_config_id,
                check_every: resource.check_every,
                check_timeout: resource.check_timeout,
                resource_types: versioned.get(&resource.pipeline_id).cloned().unwrap_or_default(),
            });
        }

        let total = targets.len();
        let scans: Vec<BoxFuture<'_, bool>> = targets
            .into_iter()
            .map(|target| {
                async move {
                    let name = target.name.to_string();
                    match self.scan(target, now).await {
                        Ok(queued) => queued,
                        Err(e) => {
                            warn!(name = %name, error = %e, "Scan failed");
                            false
                        }
                    }
                }
                .boxed()
            })
            .collect();
        let queued = stream::iter(scans)
            .buffer_unordered(SCAN_CONCURRENCY)
            .take_until(cancel.cancelled())
            .collect::<Vec<bool>>()
            .await
            .into_iter()
            .filter(|queued| *queued)
            .count();

        if queued > 0 {
            info!(scanned = total, queued, "Queued resource checks");
        }
        Ok(())
    }
}

/// The first custom type in `type_name`'s chain that has no version yet.
fn unchecked_dependency<'a>(type_name: &str, types: &'a [VersionedResourceType]) -> Option<&'a str> {
    let mut current = type_name;
    let mut seen = HashSet::new();
    // A type named after its own type refers to the base type underneath.
    let mut skip: Option<&str> = None;
    while let Some(rt) = types.iter().find(|t| t.name == current && Some(t.name.as_str()) != skip) {
        if rt.version.is_none() {
            return Some(&rt.name);
        }
        if !seen.insert(rt.name.as_str()) {
            return None;
        }
        skip = Some(&rt.name);
        current = &rt.type_name;
    }
    None
}
