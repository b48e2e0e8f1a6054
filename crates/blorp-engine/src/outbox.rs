use std::sync::Arc;

use blorp_core::{KeySpace, OutgoingMessage};
use blorp_store::Broker;
use tracing::debug;

use crate::error::EngineError;

/// Publishes outgoing messages onto the shared out queue, where the
/// websocket gateway picks them up.
#[derive(Clone)]
pub struct Outbox {
    broker: Arc<dyn Broker>,
    key: String,
}

impl Outbox {
    pub fn new(broker: Arc<dyn Broker>, keys: &KeySpace) -> Self {
        Self {
            broker,
            key: keys.out(),
        }
    }

    pub async fn send(&self, message: &OutgoingMessage) -> Result<(), EngineError> {
        self.send_all(std::slice::from_ref(message)).await
    }

    /// Push several messages in one round trip, preserving order.
    pub async fn send_all(&self, messages: &[OutgoingMessage]) -> Result<(), EngineError> {
        let encoded = messages
            .iter()
            .map(OutgoingMessage::encode)
            .collect::<Result<Vec<_>, _>>()?;
        self.broker.push(&self.key, &encoded).await?;
        debug!(count = encoded.len(), "queued outgoing messages");
        Ok(())
    }
}
