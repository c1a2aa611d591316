//! Writing a build's events.

use chrono::Utc;
use skyway_core::build::{Build, BuildStatus};
use skyway_core::events::{ErrorPayload, Event, EventKey, LogPayload, Origin};
use skyway_core::ids::PlanId;
use skyway_core::ports::EventStore;
use skyway_core::Result;
use skyway_secrets::RedactingWriter;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Appends events to one build's log. Cheap to clone; clones share the set
/// of credential values to redact.
#[derive(Clone)]
pub struct BuildEmitter {
    store: Arc<dyn EventStore>,
    build: Build,
    redact: bool,
    secrets: Arc<Mutex<BTreeSet<String>>>,
}

impl BuildEmitter {
    pub fn new(store: Arc<dyn EventStore>, build: Build) -> Self {
        Self {
            store,
            build,
            redact: false,
            secrets: Arc::default(),
        }
    }

    /// Redact tracked credential values from log output.
    pub fn with_redaction(mut self, enabled: bool) -> Self {
        self.redact = enabled;
        self
    }

    pub fn build(&self) -> &Build {
        &self.build
    }

    /// Remember credential values interpolated into this build.
    pub fn track_secrets(&self, values: impl IntoIterator<Item = String>) {
        let mut secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
        secrets.extend(values);
    }

    pub async fn emit(&self, event: Event) -> Result<EventKey> {
        self.store.put(&self.build, vec![event]).await
    }

    pub async fn emit_all(&self, events: Vec<Event>) -> Result<EventKey> {
        self.store.put(&self.build, events).await
    }

    pub async fn status(&self, status: BuildStatus) -> Result<()> {
        self.emit(Event::status(status)).await?;
        Ok(())
    }

    pub async fn error(&self, origin: Option<Origin>, message: impl Into<String>) -> Result<()> {
        self.emit(Event::Error(ErrorPayload {
            origin,
            message: message.into(),
            time: Utc::now(),
        }))
        .await?;
        Ok(())
    }

    pub async fn finalize(&self) -> Result<()> {
        self.store.finalize(&self.build).await?;
        debug!(build_id = %self.build.id, "Build events finalized");
        Ok(())
    }

    pub fn stdout(&self, plan_id: &PlanId) -> LogSink {
        self.sink(Origin::stdout(plan_id.clone()))
    }

    pub fn stderr(&self, plan_id: &PlanId) -> LogSink {
        self.sink(Origin::stderr(plan_id.clone()))
    }

    fn sink(&self, origin: Origin) -> LogSink {
        let redactor = self.redact.then(|| {
            let secrets = self.secrets.lock().unwrap_or_else(|e| e.into_inner());
            RedactingWriter::new(secrets.iter().cloned())
        });
        LogSink {
            emitter: self.clone(),
            origin,
            redactor,
        }
    }
}

/// One output stream of a step, written as `log` events.
pub struct LogSink {
    emitter: BuildEmitter,
    origin: Origin,
    redactor: Option<RedactingWriter>,
}

impl LogSink {
    /// With redaction on, output is held back until a line completes.
    pub async fn write(&mut self, chunk: &str) -> Result<()> {
        let text = match &mut self.redactor {
            Some(redactor) => match redactor.write(chunk) {
                Some(text) => text,
                None => return Ok(()),
            },
            None => chunk.to_string(),
        };
        self.send(text).await
    }

    /// Emit any held-back partial line.
    pub async fn flush(&mut self) -> Result<()> {
        match self.redactor.as_mut().and_then(RedactingWriter::flush) {
            Some(rest) => self.send(rest).await,
            None => Ok(()),
        }
    }

    async fn send(&self, payload: String) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        self.emitter
            .emit(Event::Log(LogPayload {
                origin: self.origin.clone(),
                time: Utc::now(),
                payload,
            }))
            .await?;
        Ok(())
    }
}
