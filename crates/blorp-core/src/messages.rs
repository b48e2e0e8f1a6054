//! Wire shapes exchanged with the gateway and between instances.
//!
//! All payloads are JSON strings stored in broker lists:
//!
//! - control queue: `{"action": "connection"|"switch", "connectionId": "..", "fromInstance"?: ".."}`
//! - per-connection queue: `{"type": "message"|"disconnection", "message": {"event"?: "..", "data"?: ..}}`
//! - outgoing queue: `{"id": "..", "event": "..", "data": ..}` where a null `id` means broadcast

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::MessageError;
use crate::ids::{ConnectionId, InstanceId};

fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, MessageError> {
    serde_json::from_str(raw).map_err(|e| MessageError::malformed(raw, &e))
}

fn encode<T: Serialize>(value: &T) -> Result<String, MessageError> {
    Ok(serde_json::to_string(value)?)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    /// A gateway accepted a new websocket.
    Connection,
    /// A shutting-down instance is handing a live connection off.
    Switch,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    pub action: ControlAction,
    pub connection_id: ConnectionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_instance: Option<InstanceId>,
}

impl ControlMessage {
    pub fn connection(connection_id: ConnectionId) -> Self {
        Self {
            action: ControlAction::Connection,
            connection_id,
            from_instance: None,
        }
    }

    pub fn switch(connection_id: ConnectionId, from_instance: InstanceId) -> Self {
        Self {
            action: ControlAction::Switch,
            connection_id,
            from_instance: Some(from_instance),
        }
    }

    pub fn decode(raw: &str) -> Result<Self, MessageError> {
        decode(raw)
    }

    pub fn encode(&self) -> Result<String, MessageError> {
        encode(self)
    }
}

/// Body of a `message` entry on a connection queue.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl EventPayload {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: Some(event.into()),
            data,
        }
    }

    /// Event name used for routing. A missing name routes as the empty string.
    pub fn event_name(&self) -> &str {
        self.event.as_deref().unwrap_or("")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionMessage {
    Message {
        #[serde(default)]
        message: EventPayload,
    },
    Disconnection {},
}

impl ConnectionMessage {
    pub fn event(event: impl Into<String>, data: Value) -> Self {
        Self::Message {
            message: EventPayload::new(event, data),
        }
    }

    pub fn disconnection() -> Self {
        Self::Disconnection {}
    }

    pub fn decode(raw: &str) -> Result<Self, MessageError> {
        decode(raw)
    }

    pub fn encode(&self) -> Result<String, MessageError> {
        encode(self)
    }
}

/// Addressee of an outgoing message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<ConnectionId>", into = "Option<ConnectionId>")]
pub enum Target {
    Connection(ConnectionId),
    All,
}

impl From<Option<ConnectionId>> for Target {
    fn from(id: Option<ConnectionId>) -> Self {
        id.map_or(Self::All, Self::Connection)
    }
}

impl From<Target> for Option<ConnectionId> {
    fn from(target: Target) -> Self {
        match target {
            Target::Connection(id) => Some(id),
            Target::All => None,
        }
    }
}

impl From<ConnectionId> for Target {
    fn from(id: ConnectionId) -> Self {
        Self::Connection(id)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    #[serde(rename = "id")]
    pub target: Target,
    pub event: String,
    pub data: Value,
}

impl OutgoingMessage {
    pub fn new(target: impl Into<Target>, event: impl Into<String>, data: Value) -> Self {
        Self {
            target: target.into(),
            event: event.into(),
            data,
        }
    }

    pub fn decode(raw: &str) -> Result<Self, MessageError> {
        decode(raw)
    }

    pub fn encode(&self) -> Result<String, MessageError> {
        encode(self)
    }
}
