//! What a handler gives back, and how it becomes an outgoing message.

use blorp_core::{ConnectionId, OutgoingMessage, Target};
use serde_json::Value;

/// A reply with explicit routing. Unset fields fall back to the sending
/// connection and the handler's default event.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub message: Value,
    pub target: Option<Target>,
    pub event: Option<String>,
}

impl Response {
    pub fn new(message: impl Into<Value>) -> Self {
        Self {
            message: message.into(),
            target: None,
            event: None,
        }
    }

    pub fn to(mut self, target: impl Into<Target>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn to_all(self) -> Self {
        self.to(Target::All)
    }

    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }
}

/// Handler outcome.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Reply {
    /// Nothing is sent.
    #[default]
    Nothing,
    /// A bare payload, sent back to the sender.
    Payload(Value),
    Response(Response),
}

impl Reply {
    pub fn payload(value: impl Into<Value>) -> Self {
        Self::Payload(value.into())
    }

    /// Resolve into the message to publish, if any.
    ///
    /// `default_event` is the registration's return event when it has one,
    /// otherwise the name of the event that triggered the handler.
    pub fn into_outgoing(self, sender: &ConnectionId, default_event: &str) -> Option<OutgoingMessage> {
        match self {
            Self::Nothing => None,
            Self::Payload(data) => Some(OutgoingMessage::new(sender.clone(), default_event, data)),
            Self::Response(Response {
                message,
                target,
                event,
            }) => Some(OutgoingMessage::new(
                target.unwrap_or_else(|| Target::Connection(sender.clone())),
                event.unwrap_or_else(|| default_event.to_owned()),
                message,
            )),
        }
    }
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Self::Payload(value)
    }
}

impl From<()> for Reply {
    fn from(_: ()) -> Self {
        Self::Nothing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sender() -> ConnectionId {
        ConnectionId::from("c1")
    }

    #[test]
    fn nothing_sends_nothing() {
        assert!(Reply::Nothing.into_outgoing(&sender(), "json").is_none());
        assert!(Reply::from(()).into_outgoing(&sender(), "json").is_none());
    }

    #[test]
    fn payload_goes_back_to_sender_under_default_event() {
        let out = Reply::payload("something")
            .into_outgoing(&sender(), "json")
            .unwrap();
        assert_eq!(out, OutgoingMessage::new(sender(), "json", json!("something")));
    }

    #[test]
    fn response_fields_override_defaults() {
        let out = Reply::from(Response::new(json!({"n": 1})).to_all().event("broadcast"))
            .into_outgoing(&sender(), "json")
            .unwrap();
        assert_eq!(out.target, Target::All);
        assert_eq!(out.event, "broadcast");
        assert_eq!(out.data, json!({"n": 1}));
    }

    #[test]
    fn response_without_target_or_event_uses_defaults() {
        let out = Reply::from(Response::new("hi"))
            .into_outgoing(&sender(), "return-event")
            .unwrap();
        assert_eq!(out.target, Target::Connection(sender()));
        assert_eq!(out.event, "return-event");
    }

    #[test]
    fn response_to_other_connection() {
        let out = Reply::from(Response::new("hi").to(ConnectionId::from("c2")))
            .into_outgoing(&sender(), "x")
            .unwrap();
        assert_eq!(out.target, Target::Connection(ConnectionId::from("c2")));
    }
}
