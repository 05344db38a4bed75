//! Typed envelopes for the JSON bodies exchanged with the broker.
//!
//! Inbound commands are validated once, on arrival, and are immutable
//! afterwards. Outbound results always serialize: every constructor that
//! could produce something unserializable returns [`MalformedMessageError`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Agent version stamped on every outgoing message.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Keys owned by [`OutgoingMessage`] itself; extra payload may not shadow them.
const RESERVED_KEYS: &[&str] = &[
    "uuid",
    "resource_id",
    "collection",
    "status",
    "msg_type",
    "version",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed message: {0}")]
pub struct MalformedMessageError(pub String);

/// Verbs a command may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    Response,
    Alert,
    Status,
    ComplianceOk,
    ComplianceError,
}

/// Resource identifiers arrive as strings or numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(serde_json::Number),
}

#[derive(Deserialize)]
struct RawIncoming {
    collection: String,
    action: Action,
    #[serde(default)]
    id: Option<RawId>,
    #[serde(default)]
    attributes: Option<Map<String, Value>>,
    #[serde(default)]
    monitor: Option<bool>,
}

/// A validated inbound command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IncomingMessage {
    collection: String,
    action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    attributes: Map<String, Value>,
    monitor: bool,
}

impl IncomingMessage {
    /// Parse and validate a raw delivery body.
    pub fn from_slice(body: &[u8]) -> Result<Self, MalformedMessageError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| MalformedMessageError(format!("body is not valid JSON: {e}")))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, MalformedMessageError> {
        if !value.is_object() {
            return Err(MalformedMessageError(
                "command must be a JSON object".into(),
            ));
        }
        let raw: RawIncoming =
            serde_json::from_value(value).map_err(|e| MalformedMessageError(e.to_string()))?;

        if raw.collection.trim().is_empty() {
            return Err(MalformedMessageError("collection must not be empty".into()));
        }

        let id = raw.id.and_then(|id| match id {
            RawId::Text(text) if text.is_empty() => None,
            RawId::Text(text) => Some(text),
            RawId::Number(number) => Some(number.to_string()),
        });

        Ok(Self {
            collection: raw.collection,
            action: raw.action,
            id,
            attributes: raw.attributes.unwrap_or_default(),
            monitor: raw.monitor.unwrap_or(false),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub fn monitor(&self) -> bool {
        self.monitor
    }
}

/// A result or event produced by this agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMessage {
    uuid: String,
    resource_id: String,
    collection: String,
    status: Value,
    msg_type: MsgType,
    version: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl OutgoingMessage {
    /// `uuid` is the agent identity; it is injected here and never taken
    /// from caller-supplied payload.
    pub fn new(uuid: impl Into<String>, msg_type: MsgType) -> Self {
        Self {
            uuid: uuid.into(),
            resource_id: String::new(),
            collection: String::new(),
            status: Value::Object(Map::new()),
            msg_type,
            version: AGENT_VERSION.to_string(),
            extra: Map::new(),
        }
    }

    pub fn response(uuid: impl Into<String>) -> Self {
        Self::new(uuid, MsgType::Response)
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = resource_id.into();
        self
    }

    pub fn with_status(mut self, status: Value) -> Self {
        self.status = status;
        self
    }

    /// Merge extra top-level keys. `extra` must serialize to a JSON object
    /// whose keys do not collide with the message's own fields.
    pub fn with_extra<T: Serialize + ?Sized>(
        mut self,
        extra: &T,
    ) -> Result<Self, MalformedMessageError> {
        let value = serde_json::to_value(extra)
            .map_err(|e| MalformedMessageError(format!("extra payload: {e}")))?;
        let Value::Object(map) = value else {
            return Err(MalformedMessageError(
                "extra payload must be a JSON object".into(),
            ));
        };
        if let Some(key) = map.keys().find(|k| RESERVED_KEYS.contains(&k.as_str())) {
            return Err(MalformedMessageError(format!(
                "extra payload may not override '{key}'"
            )));
        }
        self.extra.extend(map);
        Ok(self)
    }

    /// Error responses drop the status payload and carry an `error` key.
    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.status = Value::Object(Map::new());
        self.extra
            .insert("error".into(), Value::String(error.to_string()));
        self
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn status(&self) -> &Value {
        &self.status
    }

    pub fn msg_type(&self) -> MsgType {
        self.msg_type
    }

    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }
}

/// Either direction of traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Incoming(IncomingMessage),
    Outgoing(OutgoingMessage),
}

impl Message {
    /// UTF-8 JSON body for the wire.
    pub fn to_vec(&self) -> Result<Vec<u8>, MalformedMessageError> {
        let encoded = match self {
            Self::Incoming(message) => serde_json::to_vec(message),
            Self::Outgoing(message) => serde_json::to_vec(message),
        };
        encoded.map_err(|e| MalformedMessageError(e.to_string()))
    }

    pub fn msg_type(&self) -> Option<MsgType> {
        match self {
            Self::Incoming(_) => None,
            Self::Outgoing(message) => Some(message.msg_type()),
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            Self::Incoming(message) => message.collection(),
            Self::Outgoing(message) => message.collection(),
        }
    }
}

impl From<IncomingMessage> for Message {
    fn from(message: IncomingMessage) -> Self {
        Self::Incoming(message)
    }
}

impl From<OutgoingMessage> for Message {
    fn from(message: OutgoingMessage) -> Self {
        Self::Outgoing(message)
    }
}
