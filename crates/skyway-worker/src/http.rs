//! HTTP client for worker agents.
//!
//! The container runtime streams process output as newline-delimited JSON:
//! `{"stdout": "..."}`, `{"stderr": "..."}`, and finally
//! `{"exit_status": n}`.

use crate::client::{ContainerSpec, OutputChunk, ProcessSpec, WorkerClient};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use skyway_core::ids::{ContainerHandle, VolumeHandle};
use skyway_core::worker::Worker;
use skyway_core::{Error, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct HttpWorkerClient {
    client: Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ProcessFrame {
    Stdout(String),
    Stderr(String),
    ExitStatus(i32),
    Error(String),
}

impl Default for HttpWorkerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpWorkerClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn garden(&self, worker: &Worker, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", worker.garden_addr.trim_end_matches('/'), path);
        self.client.request(method, url)
    }

    fn baggageclaim(&self, worker: &Worker, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", worker.baggageclaim_url.trim_end_matches('/'), path);
        self.client.request(method, url)
    }

    async fn send(&self, op: &str, request: RequestBuilder) -> Result<Response> {
        let res = request
            .send()
            .await
            .map_err(|e| Error::Network(format!("{op}: {e}")))?;
        if res.status().is_success() {
            return Ok(res);
        }
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err(Error::Network(format!("{op}: {status} {body}")))
    }

    async fn stop_process(&self, worker: &Worker, container: &ContainerHandle) {
        let request = self
            .garden(worker, Method::POST, &format!("/containers/{container}/stop"))
            .json(&json!({"kill": false}));
        if let Err(e) = self.send("stop container", request).await {
            warn!(worker = %worker.name, container = %container, error = %e, "Failed to signal process");
        }
    }
}

/// Split buffered bytes into complete lines, leaving a partial tail.
fn take_lines(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let mut line: Vec<u8> = buffer.drain(..=pos).collect();
        line.pop();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn create_container(&self, worker: &Worker, spec: &ContainerSpec) -> Result<()> {
        self.send("create container", self.garden(worker, Method::POST, "/containers").json(spec))
            .await?;
        debug!(worker = %worker.name, container = %spec.handle, "Container created");
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
        let request = self
            .garden(worker, Method::POST, &format!("/containers/{container}/processes"))
            .json(process);
        let res = self.send("run process", request).await?;
        let mut body = res.bytes_stream();
        let mut buffer = Vec::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    self.stop_process(worker, container).await;
                    return Err(Error::Aborted);
                }
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else {
                return Err(Error::Network(format!(
                    "process stream for container {container} ended without an exit status"
                )));
            };
            let chunk = chunk.map_err(|e| Error::Network(e.to_string()))?;
            buffer.extend_from_slice(&chunk);

            for line in take_lines(&mut buffer) {
                let frame: ProcessFrame = serde_json::from_slice(&line)
                    .map_err(|e| Error::Network(format!("malformed process frame: {e}")))?;
                let out = match frame {
                    ProcessFrame::Stdout(data) => OutputChunk::stdout(data),
                    ProcessFrame::Stderr(data) => OutputChunk::stderr(data),
                    ProcessFrame::ExitStatus(status) => return Ok(status),
                    ProcessFrame::Error(message) => return Err(Error::Network(message)),
                };
                // A dropped receiver only means nobody is listening.
                let _ = output.send(out).await;
            }
        }
    }

    async fn destroy_container(&self, worker: &Worker, handle: &ContainerHandle) -> Result<()> {
        let request = self.garden(worker, Method::DELETE, &format!("/containers/{handle}"));
        match request.send().await {
            Ok(res) if res.status() == StatusCode::NOT_FOUND => Ok(()),
            Ok(res) if res.status().is_success() => Ok(()),
            Ok(res) => Err(Error::Network(format!("destroy container: {}", res.status()))),
            Err(e) => Err(Error::Network(format!("destroy container: {e}"))),
        }
    }

    async fn create_volume(&self, worker: &Worker, handle: &VolumeHandle, parent: Option<&VolumeHandle>) -> Result<()> {
        let strategy = match parent {
            Some(parent) => json!({"type": "cow", "volume": parent}),
            None => json!({"type": "empty"}),
        };
        let request = self
            .baggageclaim(worker, Method::POST, "/volumes")
            .json(&json!({"handle": handle, "strategy": strategy}));
        self.send("create volume", request).await?;
        Ok(())
    }

    async fn stream_volume(
        &self,
        from_worker: &Worker,
        from: &VolumeHandle,
        to_worker: &Worker,
        to: &VolumeHandle,
    ) -> Result<()> {
        let out = self
            .send(
                "stream out",
                self.baggageclaim(from_worker, Method::GET, &format!("/volumes/{from}/stream-out?path=.")),
            )
            .await?;
        let body = reqwest::Body::wrap_stream(out.bytes_stream());
        self.send(
            "stream in",
            self.baggageclaim(to_worker, Method::PUT, &format!("/volumes/{to}/stream-in?path=."))
                .body(body),
        )
        .await?;
        debug!(from = %from, to = %to, "Streamed volume across workers");
        Ok(())
    }

    async fn read_file(&self, worker: &Worker, volume: &VolumeHandle, path: &str) -> Result<Vec<u8>> {
        let res = self
            .baggageclaim(worker, Method::GET, &format!("/volumes/{volume}/file"))
            .query(&[("path", path)])
            .send()
            .await
            .map_err(|e| Error::Network(format!("read file: {e}")))?;
        match res.status() {
            StatusCode::OK => Ok(res
                .bytes()
                .await
                .map_err(|e| Error::Network(e.to_string()))?
                .to_vec()),
            StatusCode::NOT_FOUND => Err(Error::MissingArtifact(path.to_string())),
            status => Err(Error::Network(format!("read file: {status}"))),
        }
    }

    async fn destroy_volume(&self, worker: &Worker, handle: &VolumeHandle) -> Result<()> {
        let request = self.baggageclaim(worker, Method::DELETE, &format!("/volumes/{handle}"));
        match request.send().await {
            Ok(res) if res.status() == StatusCode::NOT_FOUND || res.status().is_success() => Ok(()),
            Ok(res) => Err(Error::Network(format!("destroy volume: {}", res.status()))),
            Err(e) => Err(Error::Network(format!("destroy volume: {e}"))),
        }
    }
}
