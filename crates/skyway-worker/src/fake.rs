//! Scripted worker agent for tests.
//!
//! Processes are answered by path (`/opt/resource/check`, a task's
//! `run.path`, ...). Each path holds a queue of [`FakeProcess`] replies; the
//! last reply repeats once the queue is down to one.

use crate::client::{ContainerSpec, OutputChunk, ProcessSpec, WorkerClient};
use crate::script::CHECK_SCRIPT;
use async_trait::async_trait;
use skyway_core::ids::{ContainerHandle, VolumeHandle};
use skyway_core::worker::Worker;
use skyway_core::{Error, Result};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct FakeProcess {
    pub exit_status: i32,
    pub output: Vec<OutputChunk>,
    /// Files written on exit, addressed like paths inside the container.
    pub writes: Vec<(String, Vec<u8>)>,
    pub delay: Option<Duration>,
    /// Run until cancelled.
    pub hang: bool,
}

impl FakeProcess {
    pub fn exit(status: i32) -> Self {
        Self {
            exit_status: status,
            ..Self::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn stdout(mut self, data: impl Into<String>) -> Self {
        self.output.push(OutputChunk::stdout(data));
        self
    }

    pub fn stderr(mut self, data: impl Into<String>) -> Self {
        self.output.push(OutputChunk::stderr(data));
        self
    }

    pub fn writes(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.writes.push((path.into(), contents.into()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProcessCall {
    pub worker: String,
    pub container: ContainerHandle,
    pub spec: ProcessSpec,
}

#[derive(Debug, Clone)]
struct FakeVolume {
    worker: String,
    parent: Option<VolumeHandle>,
    files: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
struct FakeState {
    scripts: HashMap<String, VecDeque<FakeProcess>>,
    calls: Vec<ProcessCall>,
    containers: HashMap<ContainerHandle, (String, ContainerSpec)>,
    volumes: HashMap<VolumeHandle, FakeVolume>,
    destroyed_containers: Vec<ContainerHandle>,
    destroyed_volumes: Vec<VolumeHandle>,
}

#[derive(Default)]
pub struct FakeWorkerClient {
    state: Mutex<FakeState>,
}

impl FakeWorkerClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a reply for processes started at `path`.
    pub fn script(&self, path: &str, process: FakeProcess) {
        self.lock()
            .scripts
            .entry(path.to_string())
            .or_default()
            .push_back(process);
    }

    /// Drop queued replies for `path`.
    pub fn clear_script(&self, path: &str) {
        self.lock().scripts.remove(path);
    }

    /// Seed a file into a volume the fake already knows about.
    pub fn put_file(&self, volume: &VolumeHandle, path: &str, contents: impl Into<Vec<u8>>) {
        if let Some(v) = self.lock().volumes.get_mut(volume) {
            v.files.insert(path.trim_start_matches("./").to_string(), contents.into());
        }
    }

    pub fn calls(&self) -> Vec<ProcessCall> {
        self.lock().calls.clone()
    }

    pub fn calls_to(&self, path: &str) -> Vec<ProcessCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.spec.path == path)
            .cloned()
            .collect()
    }

    pub fn container_spec(&self, handle: &ContainerHandle) -> Option<ContainerSpec> {
        self.lock().containers.get(handle).map(|(_, spec)| spec.clone())
    }

    pub fn live_containers(&self) -> usize {
        self.lock().containers.len()
    }

    pub fn has_volume(&self, handle: &VolumeHandle) -> bool {
        self.lock().volumes.contains_key(handle)
    }

    pub fn destroyed_containers(&self) -> Vec<ContainerHandle> {
        self.lock().destroyed_containers.clone()
    }

    pub fn destroyed_volumes(&self) -> Vec<VolumeHandle> {
        self.lock().destroyed_volumes.clone()
    }

    fn next_reply(&self, path: &str) -> FakeProcess {
        let mut st = self.lock();
        match st.scripts.get_mut(path) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or_default(),
            Some(queue) => queue.front().cloned().unwrap_or_default(),
            // An unscripted check finds nothing new.
            None if path == CHECK_SCRIPT => FakeProcess::exit(0).stdout("[]"),
            None => FakeProcess::default(),
        }
    }

    fn apply_writes(&self, container: &ContainerHandle, process: &ProcessSpec, writes: &[(String, Vec<u8>)]) {
        let mut st = self.lock();
        let Some((_, spec)) = st.containers.get(container).cloned() else {
            return;
        };
        let dir = process.dir.clone().unwrap_or_else(|| "/".to_string());
        for (path, contents) in writes {
            let target = if path.starts_with('/') {
                path.clone()
            } else {
                format!("{}/{}", dir.trim_end_matches('/'), path)
            };
            let mount = spec
                .mounts
                .iter()
                .filter(|m| target.starts_with(&format!("{}/", m.path.trim_end_matches('/'))))
                .max_by_key(|m| m.path.len());
            if let Some(mount) = mount {
                let relative = target[mount.path.trim_end_matches('/').len() + 1..].to_string();
                if let Some(volume) = st.volumes.get_mut(&mount.volume) {
                    volume.files.insert(relative, contents.clone());
                }
            }
        }
    }

    fn find_file(st: &FakeState, volume: &VolumeHandle, path: &str) -> Option<Vec<u8>> {
        let mut current = st.volumes.get(volume);
        while let Some(v) = current {
            if let Some(contents) = v.files.get(path) {
                return Some(contents.clone());
            }
            current = v.parent.as_ref().and_then(|p| st.volumes.get(p));
        }
        None
    }
}

#[async_trait]
impl WorkerClient for FakeWorkerClient {
    async fn create_container(&self, worker: &Worker, spec: &ContainerSpec) -> Result<()> {
        self.lock()
            .containers
            .insert(spec.handle.clone(), (worker.name.clone(), spec.clone()));
        Ok(())
    }

    async fn run_process(
        &self,
        worker: &Worker,
        container: &ContainerHandle,
        process: &ProcessSpec,
        output: mpsc::Sender<OutputChunk>,
        cancel: CancellationToken,
    ) -> Result<i32> {
        if !self.lock().containers.contains_key(container) {
            return Err(Error::Network(format!("container {container} not found")));
        }
        self.lock().calls.push(ProcessCall {
            worker: worker.name.clone(),
            container: container.clone(),
            spec: process.clone(),
        });
        let reply = self.next_reply(&process.path);

        if reply.hang {
            cancel.cancelled().await;
            return Err(Error::Aborted);
        }
        if let Some(delay) = reply.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        for chunk in reply.output {
            let _ = output.send(chunk).await;
        }
        self.apply_writes(container, process, &reply.writes);
        Ok(reply.exit_status)
    }

    async fn destroy_container(&self, _worker: &Worker, handle: &ContainerHandle) -> Result<()> {
        let mut st = self.lock();
        st.containers.remove(handle);
        st.destroyed_containers.push(handle.clone());
        Ok(())
    }

    async fn create_volume(&self, worker: &Worker, handle: &VolumeHandle, parent: Option<&VolumeHandle>) -> Result<()> {
        self.lock().volumes.insert(
            handle.clone(),
            FakeVolume {
                worker: worker.name.clone(),
                parent: parent.cloned(),
                files: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn stream_volume(
        &self,
        _from_worker: &Worker,
        from: &VolumeHandle,
        to_worker: &Worker,
        to: &VolumeHandle,
    ) -> Result<()> {
        let mut st = self.lock();
        let mut files = BTreeMap::new();
        let mut chain = Vec::new();
        let mut current = st.volumes.get(from);
        while let Some(v) = current {
            chain.push(v.files.clone());
            current = v.parent.as_ref().and_then(|p| st.volumes.get(p));
        }
        // Oldest ancestor first so children override.
        for layer in chain.into_iter().rev() {
            files.extend(layer);
        }
        let target = st.volumes.entry(to.clone()).or_insert_with(|| FakeVolume {
            worker: to_worker.name.clone(),
            parent: None,
            files: BTreeMap::new(),
        });
        target.files.extend(files);
        Ok(())
    }

    async fn read_file(&self, _worker: &Worker, volume: &VolumeHandle, path: &str) -> Result<Vec<u8>> {
        let st = self.lock();
        Self::find_file(&st, volume, path.trim_start_matches("./"))
            .ok_or_else(|| Error::MissingArtifact(path.to_string()))
    }

    async fn destroy_volume(&self, _worker: &Worker, handle: &VolumeHandle) -> Result<()> {
        let mut st = self.lock();
        st.volumes.remove(handle);
        st.destroyed_volumes.push(handle.clone());
        Ok(())
    }
}

impl FakeWorkerClient {
    /// Name of the worker a volume was created on.
    pub fn volume_worker(&self, handle: &VolumeHandle) -> Option<String> {
        self.lock().volumes.get(handle).map(|v| v.worker.clone())
    }
}
