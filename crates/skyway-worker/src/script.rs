//! The resource script protocol.
//!
//! `check`, `in` and `out` read a JSON request on stdin and answer on
//! stdout; stderr is the script's log. `in` and `out` take the working
//! directory as their single argument.

use crate::client::{OutputChunk, OutputStream, ProcessSpec, WorkerClient};
use serde::Serialize;
use skyway_core::ids::ContainerHandle;
use skyway_core::resource::{Params, Source, Version, VersionResult};
use skyway_core::worker::Worker;
use skyway_core::{Error, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const CHECK_SCRIPT: &str = "/opt/resource/check";
pub const IN_SCRIPT: &str = "/opt/resource/in";
pub const OUT_SCRIPT: &str = "/opt/resource/out";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceScript {
    Check,
    In,
    Out,
}

impl ResourceScript {
    pub fn path(&self) -> &'static str {
        match self {
            ResourceScript::Check => CHECK_SCRIPT,
            ResourceScript::In => IN_SCRIPT,
            ResourceScript::Out => OUT_SCRIPT,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScriptRequest {
    pub source: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
}

impl ScriptRequest {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            version: None,
            params: None,
        }
    }

    pub fn with_version(mut self, version: Option<Version>) -> Self {
        self.version = version;
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = Some(params);
        self
    }
}

/// Where a script runs and where its stderr goes.
pub struct ScriptContext<'a> {
    pub client: &'a dyn WorkerClient,
    pub worker: &'a Worker,
    pub container: &'a ContainerHandle,
    /// Forwarded stderr; checks pass `None` and only keep it for errors.
    pub stderr: Option<mpsc::Sender<OutputChunk>>,
    pub cancel: CancellationToken,
}

impl ScriptContext<'_> {
    pub async fn check(&self, request: &ScriptRequest) -> Result<Vec<Version>> {
        let stdout = self.run(ResourceScript::Check, Vec::new(), request).await?;
        serde_json::from_slice(&stdout).map_err(|e| malformed(ResourceScript::Check, &e, &stdout))
    }

    pub async fn fetch(&self, request: &ScriptRequest, dir: &str) -> Result<VersionResult> {
        let stdout = self.run(ResourceScript::In, vec![dir.to_string()], request).await?;
        serde_json::from_slice(&stdout).map_err(|e| malformed(ResourceScript::In, &e, &stdout))
    }

    pub async fn put(&self, request: &ScriptRequest, dir: &str) -> Result<VersionResult> {
        let stdout = self.run(ResourceScript::Out, vec![dir.to_string()], request).await?;
        serde_json::from_slice(&stdout).map_err(|e| malformed(ResourceScript::Out, &e, &stdout))
    }

    async fn run(&self, script: ResourceScript, args: Vec<String>, request: &ScriptRequest) -> Result<Vec<u8>> {
        let process = ProcessSpec {
            path: script.path().to_string(),
            args: args.clone(),
            stdin: Some(serde_json::to_vec(request)?),
            ..ProcessSpec::default()
        };

        let (tx, mut rx) = mpsc::channel::<OutputChunk>(64);
        let forward = self.stderr.clone();
        let collect = async move {
            let mut stdout = Vec::new();
            let mut stderr = String::new();
            while let Some(chunk) = rx.recv().await {
                match chunk.stream {
                    OutputStream::Stdout => stdout.extend_from_slice(chunk.data.as_bytes()),
                    OutputStream::Stderr => {
                        stderr.push_str(&chunk.data);
                        if let Some(forward) = &forward {
                            let _ = forward.send(chunk).await;
                        }
                    }
                }
            }
            (stdout, stderr)
        };
        let run = self
            .client
            .run_process(self.worker, self.container, &process, tx, self.cancel.clone());

        let (status, (stdout, stderr)) = tokio::join!(run, collect);
        let status = status?;
        debug!(script = script.path(), exit_status = status, worker = %self.worker.name, "Resource script exited");
        if status != 0 {
            return Err(Error::ResourceScriptFailed {
                path: script.path().to_string(),
                args,
                exit_status: status,
                stderr,
            });
        }
        Ok(stdout)
    }
}

fn malformed(script: ResourceScript, err: &serde_json::Error, stdout: &[u8]) -> Error {
    Error::MalformedResourceResponse(format!(
        "{}: {err}; output: {}",
        script.path(),
        String::from_utf8_lossy(stdout).trim()
    ))
}
