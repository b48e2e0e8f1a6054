pub mod actor;
pub mod context;
pub mod error;
pub mod handler;
pub mod outbox;
pub mod registry;
pub mod reply;
pub mod services;

pub use actor::{ActorState, ConnectionActor, Termination};
pub use context::ConnectionContext;
pub use error::EngineError;
pub use handler::{EventHandler, HandlerResult};
pub use outbox::Outbox;
pub use registry::{EventRegistry, EventRegistryBuilder, HandlerEntry, OrderingMode, Registration};
pub use reply::{Reply, Response};
pub use services::Services;
