//! Out-of-process event store plugin.
//!
//! Every [`EventStore`] method is one request/reply exchange on subject
//! `<prefix>.eventstore.<method>` with JSON bodies. Replies are either
//! `{"ok": <result>}` or `{"error": {"kind": ..., "message": ...}}`.
//! [`PluginEventStore`] is the client; [`PluginServer`] exposes any store
//! under the same protocol, which is how plugins written against this crate
//! are hosted.
//!
//! Setup begins with a handshake carrying a fixed magic cookie and the
//! protocol version; a plugin answering anything else is rejected before any
//! event is written. Keys issued by a plugin are compared bytewise.

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skyway_core::build::Build;
use skyway_core::events::{Event, EventKey, EventPage, Message};
use skyway_core::ids::{PipelineId, TeamId};
use skyway_core::ports::EventStore;
use skyway_core::{Error, Result};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::NatsConfig;
use crate::metrics::NatsMetrics;

pub const MAGIC_COOKIE_KEY: &str = "SKYWAY_EVENT_STORE_PLUGIN";
pub const MAGIC_COOKIE_VALUE: &str = "7c3a9e";
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub cookie_key: String,
    pub cookie_value: String,
    pub protocol_version: u32,
}

impl Handshake {
    pub fn current() -> Self {
        Self {
            cookie_key: MAGIC_COOKIE_KEY.to_string(),
            cookie_value: MAGIC_COOKIE_VALUE.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    fn describe(&self) -> String {
        format!("{}={} v{}", self.cookie_key, self.cookie_value, self.protocol_version)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BuildRequest {
    build: Build,
}

#[derive(Debug, Serialize, Deserialize)]
struct PutRequest {
    build: Build,
    events: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PutResponse {
    key: EventKey,
}

#[derive(Debug, Serialize, Deserialize)]
struct GetRequest {
    build: Build,
    cursor: Option<EventKey>,
    max: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeleteRequest {
    builds: Vec<Build>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeletePipelineRequest {
    pipeline_id: PipelineId,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeleteTeamRequest {
    team_id: TeamId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WireError {
    kind: String,
    message: String,
    #[serde(default)]
    build_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Reply {
    Ok(Value),
    Error(WireError),
}

impl WireError {
    fn from_error(err: &Error) -> Self {
        let (kind, build_id) = match err {
            Error::EventStreamFinalized(id) => ("event_stream_finalized", Some(*id)),
            Error::DuplicateEventId { build_id, .. } => ("duplicate_event_id", Some(*build_id)),
            Error::PluginVersionMismatch { .. } => ("version_mismatch", None),
            _ => ("internal", None),
        };
        Self {
            kind: kind.to_string(),
            message: err.to_string(),
            build_id,
        }
    }

    fn into_error(self) -> Error {
        match (self.kind.as_str(), self.build_id) {
            ("event_stream_finalized", Some(id)) => Error::EventStreamFinalized(id),
            _ => Error::Plugin(self.message),
        }
    }
}

/// Builds sent to a plugin never carry the decrypted plan.
fn wire_build(build: &Build) -> Build {
    let mut build = build.clone();
    build.private_plan = None;
    build
}

/// Moves request bodies to a plugin and back.
#[async_trait]
pub trait PluginTransport: Send + Sync {
    async fn request(&self, method: &str, body: Vec<u8>) -> Result<Vec<u8>>;
}

/// Request/reply over NATS.
pub struct NatsTransport {
    client: async_nats::Client,
    config: NatsConfig,
    metrics: Arc<NatsMetrics>,
}

impl NatsTransport {
    pub fn new(client: async_nats::Client, config: NatsConfig, metrics: Arc<NatsMetrics>) -> Self {
        Self { client, config, metrics }
    }
}

#[async_trait]
impl PluginTransport for NatsTransport {
    async fn request(&self, method: &str, body: Vec<u8>) -> Result<Vec<u8>> {
        let subject = self.config.plugin_subject(method);
        self.metrics.record_request(body.len() as u64);
        let reply = tokio::time::timeout(
            self.config.request_timeout,
            self.client.request(subject.clone(), body.into()),
        )
        .await
        .map_err(|_| {
            self.metrics.record_request_failure();
            Error::Plugin(format!("request to {} timed out", subject))
        })?
        .map_err(|e| {
            self.metrics.record_request_failure();
            Error::Plugin(format!("request to {} failed: {}", subject, e))
        })?;
        Ok(reply.payload.to_vec())
    }
}

/// [`EventStore`] backed by a plugin.
pub struct PluginEventStore {
    transport: Arc<dyn PluginTransport>,
}

impl PluginEventStore {
    pub fn new(transport: Arc<dyn PluginTransport>) -> Self {
        Self { transport }
    }

    pub fn over_nats(client: async_nats::Client, config: NatsConfig, metrics: Arc<NatsMetrics>) -> Self {
        Self::new(Arc::new(NatsTransport::new(client, config, metrics)))
    }

    async fn call<Req: Serialize + Sync, Resp: DeserializeOwned>(&self, method: &str, request: &Req) -> Result<Resp> {
        let body = serde_json::to_vec(request)?;
        let raw = self.transport.request(method, body).await?;
        let reply: Reply = serde_json::from_slice(&raw)
            .map_err(|e| Error::Plugin(format!("malformed reply to {}: {}", method, e)))?;
        match reply {
            Reply::Ok(value) => Ok(serde_json::from_value(value)
                .map_err(|e| Error::Plugin(format!("malformed result of {}: {}", method, e)))?),
            Reply::Error(err) => Err(err.into_error()),
        }
    }

    async fn handshake(&self) -> Result<()> {
        let ours = Handshake::current();
        let theirs: Handshake = self.call("handshake", &ours).await?;
        if theirs != ours {
            return Err(Error::PluginVersionMismatch {
                expected: ours.describe(),
                got: theirs.describe(),
            });
        }
        info!(protocol_version = theirs.protocol_version, "Event store plugin handshake complete");
        Ok(())
    }
}

#[async_trait]
impl EventStore for PluginEventStore {
    async fn setup(&self) -> Result<()> {
        self.handshake().await?;
        let _: Value = self.call("setup", &Value::Null).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let _: Value = self.call("close", &Value::Null).await?;
        Ok(())
    }

    async fn initialize(&self, build: &Build) -> Result<()> {
        let _: Value = self.call("initialize", &BuildRequest { build: wire_build(build) }).await?;
        Ok(())
    }

    async fn put(&self, build: &Build, events: Vec<Event>) -> Result<EventKey> {
        let events = events.iter().map(Event::to_message).collect::<Result<Vec<_>>>()?;
        let response: PutResponse = self
            .call("put", &PutRequest { build: wire_build(build), events })
            .await?;
        Ok(response.key)
    }

    async fn get(&self, build: &Build, cursor: Option<&EventKey>, max: usize) -> Result<EventPage> {
        self.call(
            "get",
            &GetRequest {
                build: wire_build(build),
                cursor: cursor.cloned(),
                max,
            },
        )
        .await
    }

    async fn finalize(&self, build: &Build) -> Result<()> {
        let _: Value = self.call("finalize", &BuildRequest { build: wire_build(build) }).await?;
        Ok(())
    }

    async fn delete(&self, builds: &[Build]) -> Result<()> {
        let builds = builds.iter().map(wire_build).collect();
        let _: Value = self.call("delete", &DeleteRequest { builds }).await?;
        Ok(())
    }

    async fn delete_pipeline(&self, pipeline_id: PipelineId) -> Result<()> {
        let _: Value = self.call("delete_pipeline", &DeletePipelineRequest { pipeline_id }).await?;
        Ok(())
    }

    async fn delete_team(&self, team_id: TeamId) -> Result<()> {
        let _: Value = self.call("delete_team", &DeleteTeamRequest { team_id }).await?;
        Ok(())
    }

    fn compare_keys(&self, a: &EventKey, b: &EventKey) -> Ordering {
        a.as_bytes().cmp(b.as_bytes())
    }
}

/// Serves an [`EventStore`] under the plugin protocol.
pub struct PluginServer {
    store: Arc<dyn EventStore>,
}

impl PluginServer {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Handle one request; always produces a reply body.
    pub async fn dispatch(&self, method: &str, body: &[u8]) -> Vec<u8> {
        let reply = match self.handle(method, body).await {
            Ok(value) => Reply::Ok(value),
            Err(e) => {
                debug!(method = %method, error = %e, "Plugin request failed");
                Reply::Error(WireError::from_error(&e))
            }
        };
        serde_json::to_vec(&reply).unwrap_or_default()
    }

    async fn handle(&self, method: &str, body: &[u8]) -> Result<Value> {
        fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
            Ok(serde_json::from_slice(body)?)
        }

        let result = match method {
            "handshake" => {
                let theirs: Handshake = parse(body)?;
                let ours = Handshake::current();
                if theirs.cookie_key != ours.cookie_key || theirs.cookie_value != ours.cookie_value {
                    return Err(Error::PluginVersionMismatch {
                        expected: ours.describe(),
                        got: theirs.describe(),
                    });
                }
                serde_json::to_value(ours)?
            }
            "setup" => {
                self.store.setup().await?;
                Value::Null
            }
            "close" => {
                self.store.close().await?;
                Value::Null
            }
            "initialize" => {
                let req: BuildRequest = parse(body)?;
                self.store.initialize(&req.build).await?;
                Value::Null
            }
            "put" => {
                let req: PutRequest = parse(body)?;
                let events = req.events.iter().map(Event::from_message).collect::<Result<Vec<_>>>()?;
                let key = self.store.put(&req.build, events).await?;
                serde_json::to_value(PutResponse { key })?
            }
            "get" => {
                let req: GetRequest = parse(body)?;
                let page = self.store.get(&req.build, req.cursor.as_ref(), req.max).await?;
                serde_json::to_value(page)?
            }
            "finalize" => {
                let req: BuildRequest = parse(body)?;
                self.store.finalize(&req.build).await?;
                Value::Null
            }
            "delete" => {
                let req: DeleteRequest = parse(body)?;
                self.store.delete(&req.builds).await?;
                Value::Null
            }
            "delete_pipeline" => {
                let req: DeletePipelineRequest = parse(body)?;
                self.store.delete_pipeline(req.pipeline_id).await?;
                Value::Null
            }
            "delete_team" => {
                let req: DeleteTeamRequest = parse(body)?;
                self.store.delete_team(req.team_id).await?;
                Value::Null
            }
            other => return Err(Error::Plugin(format!("unknown method '{other}'"))),
        };
        Ok(result)
    }

    /// Answer requests on `<prefix>.eventstore.*` until the subscription
    /// ends.
    pub async fn serve(&self, client: async_nats::Client, config: &NatsConfig) -> Result<()> {
        let subject = config.plugin_subject("*");
        let mut requests = client
            .subscribe(subject.clone())
            .await
            .map_err(|e| Error::EventBus(format!("Failed to subscribe to {}: {}", subject, e)))?;
        client
            .flush()
            .await
            .map_err(|e| Error::EventBus(format!("Failed to flush subscription: {}", e)))?;
        info!(subject = %subject, "Serving event store plugin");

        while let Some(message) = requests.next().await {
            let Some(reply_to) = message.reply.clone() else {
                warn!(subject = %message.subject, "Plugin request without reply subject");
                continue;
            };
            let method = message.subject.rsplit('.').next().unwrap_or_default().to_string();
            let body = self.dispatch(&method, &message.payload).await;
            if let Err(e) = client.publish(reply_to, body.into()).await {
                warn!(method = %method, error = %e, "Failed to send plugin reply");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use skyway_core::build::BuildStatus;
    use skyway_core::events::{LogPayload, Origin};
    use skyway_core::ids::PlanId;
    use skyway_core::plan::{Plan, PlanKind};
    use skyway_core::ports::{BuildCreator, TeamRepository};
    use skyway_db::MemoryStore;

    /// Calls the server in process.
    struct LocalTransport(PluginServer);

    #[async_trait]
    impl PluginTransport for LocalTransport {
        async fn request(&self, method: &str, body: Vec<u8>) -> Result<Vec<u8>> {
            Ok(self.0.dispatch(method, &body).await)
        }
    }

    /// A plugin built against another protocol version.
    struct StaleTransport;

    #[async_trait]
    impl PluginTransport for StaleTransport {
        async fn request(&self, _method: &str, _body: Vec<u8>) -> Result<Vec<u8>> {
            let mut theirs = Handshake::current();
            theirs.protocol_version = 0;
            Ok(serde_json::to_vec(&Reply::Ok(serde_json::to_value(theirs).unwrap())).unwrap())
        }
    }

    async fn fixture() -> (PluginEventStore, Build) {
        let store = Arc::new(MemoryStore::new());
        let team = store.create_team("main").await.unwrap();
        let plan = Plan::new("1", PlanKind::Do(vec![]));
        let build = store.create_started_build(team.id, None, &plan).await.unwrap();
        let client = PluginEventStore::new(Arc::new(LocalTransport(PluginServer::new(store))));
        (client, build)
    }

    fn log(text: &str) -> Event {
        Event::Log(LogPayload {
            origin: Origin::stdout(PlanId::new("1")),
            time: chrono::Utc::now(),
            payload: text.to_string(),
        })
    }

    #[tokio::test]
    async fn test_setup_handshakes() {
        let (client, _) = fixture().await;
        client.setup().await.unwrap();
    }

    #[tokio::test]
    async fn test_version_mismatch_fails_setup() {
        let client = PluginEventStore::new(Arc::new(StaleTransport));
        let err = client.setup().await.unwrap_err();
        assert!(matches!(err, Error::PluginVersionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_put_get_through_plugin() {
        let (client, build) = fixture().await;
        client.put(&build, vec![log("a"), log("b")]).await.unwrap();

        let page = client.get(&build, None, 10).await.unwrap();
        let types: Vec<_> = page.events.iter().map(|e| e.message.event_type.as_str()).collect();
        assert_eq!(types, vec!["status", "log", "log"]);
        let Ok(Event::Log(last)) = page.events[2].event() else {
            panic!("expected a log event");
        };
        assert_eq!(last.payload, "b");

        let rest = client.get(&build, page.next.as_ref(), 10).await.unwrap();
        assert!(rest.events.is_empty());
    }

    #[tokio::test]
    async fn test_finalized_error_survives_the_wire() {
        let (client, build) = fixture().await;
        client.finalize(&build).await.unwrap();
        let err = client.put(&build, vec![Event::status(BuildStatus::Succeeded)]).await.unwrap_err();
        assert!(matches!(err, Error::EventStreamFinalized(id) if id == build.id.get()));
    }

    #[tokio::test]
    async fn test_unknown_method_is_an_error_reply() {
        let server = PluginServer::new(Arc::new(MemoryStore::new()));
        let reply: Reply = serde_json::from_slice(&server.dispatch("compact", b"{}").await).unwrap();
        assert!(matches!(reply, Reply::Error(e) if e.kind == "internal"));
    }

    #[test]
    fn test_keys_compare_bytewise() {
        let client = PluginEventStore::new(Arc::new(StaleTransport));
        assert_eq!(
            client.compare_keys(&EventKey::new(vec![0, 9]), &EventKey::new(vec![1])),
            Ordering::Less
        );
    }
}
