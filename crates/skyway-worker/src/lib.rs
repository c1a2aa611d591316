//! Workers as seen from the control plane.
//!
//! [`Pool`] picks a worker for a container; [`WorkerClient`] talks to the
//! worker agents; [`Provisioner`] keeps the store's container and volume
//! rows in step with what the agents hold.

pub mod artifacts;
pub mod client;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod http;
pub mod image;
pub mod placement;
pub mod pool;
pub mod provision;
pub mod script;

pub use artifacts::{ArtifactVolume, BuildArtifacts};
pub use client::{ContainerSpec, Mount, OutputChunk, OutputStream, ProcessSpec, RootfsSpec, WorkerClient};
#[cfg(any(test, feature = "testing"))]
pub use fake::{FakeProcess, FakeWorkerClient, ProcessCall};
pub use http::HttpWorkerClient;
pub use image::{ImageSource, resolve_resource_image, resolve_task_image};
pub use placement::{PlacementChain, PlacementContext, PlacementStrategy};
pub use pool::{Pool, TaskSlot};
pub use provision::{ContainerRequest, MountRequest, MountSource, Provisioner};
pub use script::{ResourceScript, ScriptContext, ScriptRequest};
