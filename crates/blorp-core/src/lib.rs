//! Shared vocabulary for blorp instances: identities, wire messages and the
//! broker key namespace.

pub mod errors;
pub mod ids;
pub mod keys;
pub mod messages;

pub use errors::MessageError;
pub use ids::{ConnectionId, InstanceId};
pub use keys::KeySpace;
pub use messages::{
    ConnectionMessage, ControlAction, ControlMessage, EventPayload, OutgoingMessage, Target,
};
