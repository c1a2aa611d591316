//! Build events and their wire format.
//!
//! On the wire every event is `{"type": ..., "version": ..., "data": ...}`.
//! [`Event`] is the typed form; [`Message`] is the envelope stored by event
//! stores and handed to subscribers.

use crate::build::BuildStatus;
use crate::ids::*;
use crate::resource::{MetadataField, Version};
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Current wire version of every event type.
pub const EVENT_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginSource {
    Stdout,
    Stderr,
}

/// The plan node that produced an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub id: PlanId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<OriginSource>,
}

impl Origin {
    pub fn new(id: PlanId) -> Self {
        Self { id, source: None }
    }

    pub fn stdout(id: PlanId) -> Self {
        Self { id, source: Some(OriginSource::Stdout) }
    }

    pub fn stderr(id: PlanId) -> Self {
        Self { id, source: Some(OriginSource::Stderr) }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTime {
    pub origin: Origin,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishGetPayload {
    pub origin: Origin,
    pub time: DateTime<Utc>,
    pub exit_status: i32,
    #[serde(default)]
    pub version: Option<Version>,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishPutPayload {
    pub origin: Origin,
    pub time: DateTime<Utc>,
    pub exit_status: i32,
    #[serde(default)]
    pub version: Option<Version>,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishTaskPayload {
    pub origin: Origin,
    pub time: DateTime<Utc>,
    pub exit_status: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    pub origin: Origin,
    pub time: DateTime<Utc>,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: BuildStatus,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub origin: Option<Origin>,
    pub message: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedWorkerPayload {
    pub origin: Origin,
    pub worker_name: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum Event {
    Initialize(StepTime),
    Start(StepTime),
    Finish(StepTime),
    InitializeGet(StepTime),
    StartGet(StepTime),
    FinishGet(FinishGetPayload),
    InitializePut(StepTime),
    StartPut(StepTime),
    FinishPut(FinishPutPayload),
    InitializeTask(StepTime),
    StartTask(StepTime),
    FinishTask(FinishTaskPayload),
    Log(LogPayload),
    Status(StatusPayload),
    Error(ErrorPayload),
    SelectedWorker(SelectedWorkerPayload),
}

/// Envelope of one event as stored and streamed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub event_type: String,
    pub version: String,
    pub data: Value,
}

impl Event {
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::Initialize(_) => "initialize",
            Event::Start(_) => "start",
            Event::Finish(_) => "finish",
            Event::InitializeGet(_) => "initialize-get",
            Event::StartGet(_) => "start-get",
            Event::FinishGet(_) => "finish-get",
            Event::InitializePut(_) => "initialize-put",
            Event::StartPut(_) => "start-put",
            Event::FinishPut(_) => "finish-put",
            Event::InitializeTask(_) => "initialize-task",
            Event::StartTask(_) => "start-task",
            Event::FinishTask(_) => "finish-task",
            Event::Log(_) => "log",
            Event::Status(_) => "status",
            Event::Error(_) => "error",
            Event::SelectedWorker(_) => "selected-worker",
        }
    }

    /// Events that end a step's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::Finish(_)
                | Event::FinishGet(_)
                | Event::FinishPut(_)
                | Event::FinishTask(_)
                | Event::Error(_)
        )
    }

    pub fn status(status: BuildStatus) -> Self {
        Event::Status(StatusPayload {
            status,
            time: Utc::now(),
        })
    }

    pub fn to_message(&self) -> Result<Message> {
        let tagged = serde_json::to_value(self)?;
        let data = tagged.get("data").cloned().unwrap_or(Value::Null);
        Ok(Message {
            event_type: self.event_type().to_string(),
            version: EVENT_VERSION.to_string(),
            data,
        })
    }

    pub fn from_message(message: &Message) -> Result<Self> {
        let major = message.version.split('.').next().unwrap_or_default();
        if major != EVENT_VERSION.split('.').next().unwrap_or_default() {
            return Err(Error::Serialization(format!(
                "unsupported version {} for event {}",
                message.version, message.event_type
            )));
        }
        let tagged = serde_json::json!({"type": message.event_type, "data": message.data});
        Ok(serde_json::from_value(tagged)?)
    }
}

/// Opaque, per-build ordered cursor into an event store. Keys are compared
/// only through the store that issued them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey(Vec<u8>);

impl EventKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encoding used by the built-in stores: big-endian event id.
    pub fn from_event_id(event_id: i64) -> Self {
        Self(event_id.to_be_bytes().to_vec())
    }

    pub fn to_event_id(&self) -> Option<i64> {
        let bytes: [u8; 8] = self.0.as_slice().try_into().ok()?;
        Some(i64::from_be_bytes(bytes))
    }
}

impl Serialize for EventKey {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for EventKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        STANDARD
            .decode(raw.as_bytes())
            .map(EventKey)
            .map_err(serde::de::Error::custom)
    }
}

/// An event as read back from a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: i64,
    pub key: EventKey,
    pub message: Message,
}

impl StoredEvent {
    pub fn event(&self) -> Result<Event> {
        Event::from_message(&self.message)
    }
}

/// One page returned by an event store read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<StoredEvent>,
    /// Cursor to continue from; `None` when the page is empty and no cursor
    /// was supplied.
    pub next: Option<EventKey>,
    /// True once the build's stream is finalized or its rows reaped.
    pub finalized: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn log(payload: &str) -> Event {
        Event::Log(LogPayload {
            origin: Origin::stdout(PlanId::new("1")),
            time: Utc::now(),
            payload: payload.to_string(),
        })
    }

    #[test]
    fn test_message_round_trip() {
        let event = log("hello\n");
        let message = event.to_message().unwrap();
        assert_eq!(message.event_type, "log");
        assert_eq!(message.version, EVENT_VERSION);
        assert_eq!(message.data["payload"], "hello\n");
        assert_eq!(message.data["origin"]["source"], "stdout");
        assert_eq!(Event::from_message(&message).unwrap(), event);
    }

    #[test]
    fn test_wire_type_names() {
        let finish = Event::FinishTask(FinishTaskPayload {
            origin: Origin::new(PlanId::new("2")),
            time: Utc::now(),
            exit_status: 1,
        });
        assert_eq!(finish.to_message().unwrap().event_type, "finish-task");
        let worker = Event::SelectedWorker(SelectedWorkerPayload {
            origin: Origin::new(PlanId::new("2")),
            worker_name: "w1".into(),
            time: Utc::now(),
        });
        let json = serde_json::to_value(&worker).unwrap();
        assert_eq!(json["type"], "selected-worker");
    }

    #[test]
    fn test_unknown_major_version_rejected() {
        let mut message = log("x").to_message().unwrap();
        message.version = "9.0".into();
        assert!(Event::from_message(&message).is_err());
    }

    #[test]
    fn test_event_key_json_and_order() {
        let key = EventKey::from_event_id(7);
        let json = serde_json::to_string(&key).unwrap();
        let back: EventKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back.to_event_id(), Some(7));
        assert!(EventKey::from_event_id(2).as_bytes() < EventKey::from_event_id(10).as_bytes());
    }
}
