//! The control plane's view of a worker agent.
//!
//! Each worker exposes a container runtime and a volume manager at separate
//! addresses; nothing here assumes they are co-located.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skyway_core::Result;
use skyway_core::ids::{ContainerHandle, VolumeHandle};
use skyway_core::worker::Worker;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A volume mounted into a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub volume: VolumeHandle,
    pub path: String,
}

/// The root filesystem a container boots from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RootfsSpec {
    /// A URI the runtime can fetch itself, e.g. `docker:///busybox`.
    Uri { uri: String },
    /// A volume holding `rootfs/` and `metadata.json`.
    Volume { handle: VolumeHandle },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub handle: ContainerHandle,
    pub rootfs: RootfsSpec,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Written to the process's stdin, which is then closed.
    #[serde(default)]
    pub stdin: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A chunk of process output, not necessarily a whole line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: String,
}

impl OutputChunk {
    pub fn stdout(data: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            data: data.into(),
        }
    }

    pub fn stderr(data: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            data: data.into(),
        }
    }
}

#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn create_container(&self, worker: &Worker, spec: &ContainerSpec) -> Result<()>;

    /// Run a process to completion, streaming its output into `output`.
    /// Cancelling `cancel` signals the process and fails with `Aborted`.
    async fn run_process(
        &self,
        worker: &Worker,
        container: &ContainerHandle,
        process: &ProcessSpec,
        output: mpsc::Sender<OutputChunk>,
        cancel: CancellationToken,
    ) -> Result<i32>;

    async fn destroy_container(&self, worker: &Worker, handle: &ContainerHandle) -> Result<()>;

    /// Create an empty volume, or a copy-on-write child of `parent`.
    async fn create_volume(&self, worker: &Worker, handle: &VolumeHandle, parent: Option<&VolumeHandle>) -> Result<()>;

    /// Copy a file or directory from one volume into another, possibly on
    /// another worker.
    async fn stream_volume(
        &self,
        from_worker: &Worker,
        from: &VolumeHandle,
        to_worker: &Worker,
        to: &VolumeHandle,
    ) -> Result<()>;

    /// Read one file out of a volume.
    async fn read_file(&self, worker: &Worker, volume: &VolumeHandle, path: &str) -> Result<Vec<u8>>;

    async fn destroy_volume(&self, worker: &Worker, handle: &VolumeHandle) -> Result<()>;
}
