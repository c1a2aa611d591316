//! Choosing what a step's container boots from.

use skyway_core::resource::VersionedResourceType;
use skyway_core::task::{ImageResource, TaskConfig};
use skyway_core::{Error, Result};
use std::collections::HashSet;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    /// A build artifact holding `rootfs/` and `metadata.json`.
    Artifact(String),
    /// Fetch this resource first and boot from what it produced. The
    /// resource's own type resolves against `resource_types`.
    Fetch {
        resource: ImageResource,
        privileged: bool,
        resource_types: Vec<VersionedResourceType>,
    },
    /// A resource type shipped with the worker.
    BaseType(String),
    Rootfs(String),
}

/// Image for a task: an image artifact, then `image_resource`, then
/// `rootfs_uri`.
pub fn resolve_task_image(
    image_artifact: Option<&str>,
    config: &TaskConfig,
    privileged: bool,
    resource_types: &[VersionedResourceType],
) -> Result<ImageSource> {
    if let Some(artifact) = image_artifact {
        if config.image_resource.is_some() {
            warn!(image = artifact, "Task sets both image and image_resource, using image");
        }
        return Ok(ImageSource::Artifact(artifact.to_string()));
    }
    if let Some(resource) = &config.image_resource {
        check_cycles(&resource.type_name, resource_types)?;
        return Ok(ImageSource::Fetch {
            resource: resource.clone(),
            privileged,
            resource_types: resource_types.to_vec(),
        });
    }
    if let Some(uri) = &config.rootfs_uri {
        return Ok(ImageSource::Rootfs(uri.clone()));
    }
    Err(Error::InvalidTaskConfig("no image specified".to_string()))
}

/// Image for a get, put or check of `type_name`. A custom type is fetched
/// using the types declared before it; anything else is a base type.
pub fn resolve_resource_image(type_name: &str, resource_types: &[VersionedResourceType]) -> Result<ImageSource> {
    check_cycles(type_name, resource_types)?;
    let Some(custom) = resource_types.iter().find(|t| t.name == type_name) else {
        return Ok(ImageSource::BaseType(type_name.to_string()));
    };
    let remaining: Vec<VersionedResourceType> = resource_types
        .iter()
        .filter(|t| t.name != custom.name)
        .cloned()
        .collect();
    Ok(ImageSource::Fetch {
        resource: ImageResource {
            type_name: custom.type_name.clone(),
            source: custom.source.clone(),
            params: custom.params.clone(),
            version: custom.version.clone(),
        },
        privileged: custom.privileged,
        resource_types: remaining,
    })
}

/// Follow `type_name` through custom types down to a base type.
fn check_cycles(type_name: &str, resource_types: &[VersionedResourceType]) -> Result<()> {
    let mut visited = HashSet::new();
    let mut current = type_name;
    while let Some(custom) = resource_types.iter().find(|t| t.name == current) {
        if !visited.insert(custom.name.as_str()) {
            return Err(Error::InvalidPipeline(format!(
                "resource type '{type_name}' has a cycle through '{}'",
                custom.name
            )));
        }
        current = &custom.type_name;
    }
    Ok(())
}
