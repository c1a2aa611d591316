//! Turning an [`ImageSource`] into something a container can boot from.

use crate::context::EngineContext;
use crate::steps::fetch::{self, Caller, FetchRequest};
use futures::FutureExt;
use futures::future::BoxFuture;
use skyway_core::ports::VolumeRequest;
use skyway_core::vars::interpolate_map;
use skyway_core::worker::Worker;
use skyway_core::{Error, Result};
use skyway_worker::{BuildArtifacts, ImageSource, RootfsSpec};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedImage {
    pub rootfs: RootfsSpec,
    pub privileged: bool,
}

/// The worker resource type an image ultimately needs, if any. Custom
/// types are followed down to the base type they are built on.
pub fn required_base_type(source: &ImageSource) -> Result<Option<String>> {
    match source {
        ImageSource::BaseType(type_name) => Ok(Some(type_name.clone())),
        ImageSource::Fetch {
            resource,
            resource_types,
            ..
        } => {
            let mut visited = HashSet::new();
            let mut current = resource.type_name.as_str();
            while let Some(custom) = resource_types.iter().find(|t| t.name == current) {
                if !visited.insert(custom.name.as_str()) {
                    return Err(Error::InvalidPlan(format!(
                        "resource type '{}' refers back to itself",
                        custom.name
                    )));
                }
                current = &custom.type_name;
            }
            Ok(Some(current.to_string()))
        }
        ImageSource::Artifact(_) | ImageSource::Rootfs(_) => Ok(None),
    }
}

/// Make `source` bootable on `worker`. Fetched images land on the same
/// worker; artifacts from elsewhere are streamed over first.
pub(crate) fn prepare<'a>(
    ctx: &'a EngineContext,
    caller: &'a Caller,
    source: &'a ImageSource,
    worker: &'a Worker,
    artifacts: Option<&'a BuildArtifacts>,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, Result<PreparedImage>> {
    async move {
        match source {
            ImageSource::BaseType(type_name) => {
                let base = worker.resource_type(type_name).ok_or_else(|| {
                    Error::NoWorkersSatisfying(format!("worker '{}' lacks resource type '{type_name}'", worker.name))
                })?;
                Ok(PreparedImage {
                    rootfs: RootfsSpec::Uri {
                        uri: base.image.clone(),
                    },
                    privileged: base.privileged,
                })
            }
            ImageSource::Rootfs(uri) => Ok(PreparedImage {
                rootfs: RootfsSpec::Uri { uri: uri.clone() },
                privileged: false,
            }),
            ImageSource::Artifact(name) => {
                let artifact = artifacts
                    .and_then(|a| a.get(name))
                    .ok_or_else(|| Error::MissingArtifact(name.clone()))?;
                if artifact.worker_name == worker.name {
                    return Ok(PreparedImage {
                        rootfs: RootfsSpec::Volume {
                            handle: artifact.handle,
                        },
                        privileged: false,
                    });
                }
                debug!(artifact = %name, from = %artifact.worker_name, to = %worker.name, "Staging image artifact");
                let from = ctx.pool.find_worker(&artifact.worker_name).await?;
                let staged = ctx
                    .provisioner
                    .stage(
                        &from,
                        &artifact.handle,
                        worker,
                        VolumeRequest {
                            team_id: caller.team_id(),
                            path: "rootfs".to_string(),
                            ..VolumeRequest::default()
                        },
                    )
                    .await?;
                Ok(PreparedImage {
                    rootfs: RootfsSpec::Volume { handle: staged.handle },
                    privileged: false,
                })
            }
            ImageSource::Fetch {
                resource,
                privileged,
                resource_types,
            } => {
                let (source, _) = interpolate_map(&resource.source, ctx.vars.as_ref()).await?;
                let image_caller = caller.for_image();
                let fetched = fetch::fetch(
                    ctx,
                    &image_caller,
                    FetchRequest {
                        type_name: &resource.type_name,
                        source: &source,
                        params: &resource.params,
                        version: resource.version.clone(),
                        resource_types,
                    },
                    worker,
                    None,
                    cancel,
                )
                .await?;
                Ok(PreparedImage {
                    rootfs: RootfsSpec::Volume { handle: fetched.volume },
                    privileged: *privileged,
                })
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyway_core::resource::VersionedResourceType;
    use skyway_core::task::ImageResource;

    fn custom(name: &str, type_name: &str) -> VersionedResourceType {
        VersionedResourceType {
            name: name.to_string(),
            type_name: type_name.to_string(),
            source: Default::default(),
            params: Default::default(),
            privileged: false,
            tags: vec![],
            version: None,
        }
    }

    fn fetch_of(type_name: &str, resource_types: Vec<VersionedResourceType>) -> ImageSource {
        ImageSource::Fetch {
            resource: ImageResource {
                type_name: type_name.to_string(),
                source: Default::default(),
                params: Default::default(),
                version: None,
            },
            privileged: false,
            resource_types,
        }
    }

    #[test]
    fn test_base_type_follows_custom_chain() {
        let types = vec![custom("pr", "docker-image"), custom("gh", "pr")];
        assert_eq!(
            required_base_type(&fetch_of("gh", types)).unwrap(),
            Some("docker-image".to_string())
        );
        assert_eq!(
            required_base_type(&ImageSource::BaseType("git".into())).unwrap(),
            Some("git".to_string())
        );
        assert_eq!(required_base_type(&ImageSource::Artifact("img".into())).unwrap(), None);
    }

    #[test]
    fn test_base_type_cycle_is_invalid() {
        let types = vec![custom("a", "b"), custom("b", "a")];
        assert!(matches!(
            required_base_type(&fetch_of("a", types)),
            Err(Error::InvalidPlan(_))
        ));
    }
}
