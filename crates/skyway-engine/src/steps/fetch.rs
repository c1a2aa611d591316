//! Fetching a resource version into a cache volume on a worker.
//!
//! Shared by `get`, the `get` after a `put`, and image fetches. A version
//! already cached on the worker is reused; otherwise the type's `in`
//! script fills a fresh volume, which then becomes that cache's volume.

use crate::context::EngineContext;
use crate::image;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use skyway_component::Lease;
use skyway_core::component::leases;
use skyway_core::ids::{BuildId, PlanId, ResourceConfigId, TeamId, VolumeHandle};
use skyway_core::resource::{
    CacheUser, MetadataField, Params, ResourceCache, ResourceCacheDescriptor, ResourceConfigDescriptor, Source,
    Version, VersionedResourceType,
};
use skyway_core::worker::{ContainerOwner, VolumeAssociation, Worker};
use skyway_core::{Error, Result};
use skyway_worker::{ContainerRequest, MountRequest, OutputChunk, ScriptContext, ScriptRequest, resolve_resource_image};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where fetched content lands inside the fetch container.
pub(crate) const FETCH_DIR: &str = "/tmp/build/get";

/// Check containers are kept this long after their last use.
pub(crate) fn check_session_expiry() -> DateTime<Utc> {
    Utc::now() + ChronoDuration::minutes(5)
}

const FETCH_LEASE_TTL: Duration = Duration::from_secs(300);
const FETCH_LEASE_POLL: Duration = Duration::from_secs(1);

/// On whose behalf a fetch runs: decides container ownership and who holds
/// the resulting cache.
#[derive(Debug, Clone)]
pub(crate) enum Caller {
    Step {
        build_id: BuildId,
        plan_id: PlanId,
        team_id: TeamId,
    },
    Image {
        build_id: BuildId,
        plan_id: PlanId,
        team_id: TeamId,
    },
    Check {
        config_id: ResourceConfigId,
        team_id: Option<TeamId>,
    },
}

impl Caller {
    pub(crate) fn team_id(&self) -> Option<TeamId> {
        match self {
            Caller::Step { team_id, .. } | Caller::Image { team_id, .. } => Some(*team_id),
            Caller::Check { team_id, .. } => *team_id,
        }
    }

    fn cache_user(&self) -> CacheUser {
        match self {
            Caller::Step { build_id, .. } | Caller::Image { build_id, .. } => CacheUser::Build(*build_id),
            Caller::Check { config_id, .. } => CacheUser::Container(*config_id),
        }
    }

    fn owner(&self, config_id: ResourceConfigId) -> ContainerOwner {
        match self {
            Caller::Step {
                build_id,
                plan_id,
                team_id,
            } => ContainerOwner::BuildStep {
                build_id: *build_id,
                plan_id: plan_id.clone(),
                team_id: *team_id,
            },
            Caller::Image { build_id, plan_id, .. } => ContainerOwner::ImageFetch {
                build_id: *build_id,
                plan_id: plan_id.clone(),
            },
            Caller::Check { .. } => ContainerOwner::CheckSession {
                resource_config_id: config_id,
                expires_at: check_session_expiry(),
            },
        }
    }

    /// The caller an image fetch made on this caller's behalf runs as.
    pub(crate) fn for_image(&self) -> Caller {
        match self {
            Caller::Step {
                build_id,
                plan_id,
                team_id,
            } => Caller::Image {
                build_id: *build_id,
                plan_id: plan_id.clone(),
                team_id: *team_id,
            },
            other => other.clone(),
        }
    }
}

/// What to fetch. `source` must already be interpolated.
pub(crate) struct FetchRequest<'a> {
    pub type_name: &'a str,
    pub source: &'a Source,
    pub params: &'a Params,
    /// `None` fetches whatever a fresh check reports as latest.
    pub version: Option<Version>,
    pub resource_types: &'a [VersionedResourceType],
}

#[derive(Debug, Clone)]
pub(crate) struct Fetched {
    pub volume: VolumeHandle,
    pub version: Version,
    pub metadata: Vec<MetadataField>,
    pub config_id: ResourceConfigId,
    pub cache_hit: bool,
}

/// Config and cache rows for a request, without fetching anything.
pub(crate) async fn find_cache(
    ctx: &EngineContext,
    caller: &Caller,
    request: &FetchRequest<'_>,
    version: &Version,
) -> Result<(ResourceConfigId, ResourceCache)> {
    let config = ctx
        .configs
        .find_or_create_config(&ResourceConfigDescriptor::new(request.type_name, request.source.clone()))
        .await?;
    let cache = ctx
        .configs
        .find_or_create_cache(
            caller.cache_user(),
            config.id,
            &ResourceCacheDescriptor {
                type_name: request.type_name.to_string(),
                source: request.source.clone(),
                params: request.params.clone(),
                version: version.clone(),
            },
        )
        .await?;
    Ok((config.id, cache))
}

pub(crate) fn fetch<'a>(
    ctx: &'a EngineContext,
    caller: &'a Caller,
    request: FetchRequest<'a>,
    worker: &'a Worker,
    stderr: Option<mpsc::Sender<OutputChunk>>,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, Result<Fetched>> {
    async move {
        let image_source = resolve_resource_image(request.type_name, request.resource_types)?;
        let mut prepared = None;

        let version = match &request.version {
            Some(version) => version.clone(),
            None => {
                let config = ctx
                    .configs
                    .find_or_create_config(&ResourceConfigDescriptor::new(request.type_name, request.source.clone()))
                    .await?;
                let image = image::prepare(ctx, caller, &image_source, worker, None, cancel).await?;
                let container = ctx
                    .provisioner
                    .find_or_create_container(
                        worker,
                        ContainerRequest {
                            owner: ContainerOwner::CheckSession {
                                resource_config_id: config.id,
                                expires_at: check_session_expiry(),
                            },
                            rootfs: image.rootfs.clone(),
                            privileged: image.privileged,
                            env: BTreeMap::new(),
                            mounts: Vec::new(),
                        },
                    )
                    .await?;
                let script = ScriptContext {
                    client: ctx.provisioner.client().as_ref(),
                    worker,
                    container: &container,
                    stderr: None,
                    cancel: cancel.clone(),
                };
                let found = script.check(&ScriptRequest::new(request.source.clone())).await?;
                ctx.versions.save_versions(config.id, &found).await?;
                prepared = Some(image);
                found.last().cloned().ok_or(Error::VersionNotAvailable)?
            }
        };

        let (config_id, cache) = find_cache(ctx, caller, &request, &version).await?;
        if let Some(hit) = cached(ctx, config_id, &cache, worker, &version).await? {
            return Ok(hit);
        }

        let lease = acquire_fetch_lease(ctx, &cache, worker, cancel).await?;
        let result = async {
            if let Some(hit) = cached(ctx, config_id, &cache, worker, &version).await? {
                return Ok(hit);
            }
            let image = match prepared {
                Some(image) => image,
                None => image::prepare(ctx, caller, &image_source, worker, None, cancel).await?,
            };

            let (container, volumes) = ctx
                .provisioner
                .create_with_mounts(
                    worker,
                    ContainerRequest {
                        owner: caller.owner(config_id),
                        rootfs: image.rootfs,
                        privileged: image.privileged,
                        env: BTreeMap::new(),
                        mounts: Vec::new(),
                    },
                    caller.team_id(),
                    vec![MountRequest::empty(FETCH_DIR)],
                )
                .await?;
            let volume = volumes
                .into_iter()
                .next()
                .ok_or_else(|| Error::Internal("fetch container has no volume".to_string()))?;

            let script = ScriptContext {
                client: ctx.provisioner.client().as_ref(),
                worker,
                container: &container,
                stderr,
                cancel: cancel.clone(),
            };
            let fetched = script
                .fetch(
                    &ScriptRequest::new(request.source.clone())
                        .with_version(Some(version.clone()))
                        .with_params(request.params.clone()),
                    FETCH_DIR,
                )
                .await?;

            ctx.volumes
                .set_volume_association(&volume, Some(VolumeAssociation::ResourceCache { cache_id: cache.id }))
                .await?;
            info!(
                type_name = request.type_name,
                worker = %worker.name,
                cache_id = %cache.id,
                "Fetched resource version"
            );
            Ok::<_, Error>(Fetched {
                volume,
                version: fetched.version,
                metadata: fetched.metadata,
                config_id,
                cache_hit: false,
            })
        }
        .await;

        if let Err(e) = lease.release().await {
            warn!(cache_id = %cache.id, error = %e, "Failed to release fetch lease");
        }
        result
    }
    .boxed()
}

async fn cached(
    ctx: &EngineContext,
    config_id: ResourceConfigId,
    cache: &ResourceCache,
    worker: &Worker,
    version: &Version,
) -> Result<Option<Fetched>> {
    let Some(volume) = ctx.volumes.find_cache_volume(&worker.name, cache.id).await? else {
        return Ok(None);
    };
    let metadata = ctx
        .versions
        .find_version(config_id, version)
        .await?
        .map(|v| v.metadata)
        .unwrap_or_default();
    debug!(cache_id = %cache.id, worker = %worker.name, "Resource cache hit");
    Ok(Some(Fetched {
        volume: volume.handle,
        version: version.clone(),
        metadata,
        config_id,
        cache_hit: true,
    }))
}

/// One fetch per cache and worker at a time; others wait their turn and
/// usually find the cache filled.
async fn acquire_fetch_lease(
    ctx: &EngineContext,
    cache: &ResourceCache,
    worker: &Worker,
    cancel: &CancellationToken,
) -> Result<Lease> {
    let name = leases::cache_fetch(cache.id, &worker.name);
    loop {
        if let Some(lease) = ctx.leases.acquire(&name, FETCH_LEASE_TTL).await? {
            return Ok(lease);
        }
        debug!(lease = %name, "Waiting for concurrent fetch");
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Aborted),
            _ = tokio::time::sleep(FETCH_LEASE_POLL) => {}
        }
    }
}
