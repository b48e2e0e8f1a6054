use blorp_core::MessageError;
use blorp_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("message error: {0}")]
    Message(#[from] MessageError),

    #[error("handler for '{event}' failed: {reason}")]
    HandlerFailure { event: String, reason: String },

    #[error("no handler matches event '{0}'")]
    NoMatchingHandler(String),

    #[error("invalid event pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Errors after which an actor cannot keep reading its queue. Everything
    /// else is logged and the next message is processed.
    pub fn is_fatal_to_actor(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_unavailable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_broker_outages_are_fatal() {
        let outage = EngineError::from(StoreError::BrokerUnavailable("down".into()));
        assert!(outage.is_fatal_to_actor());

        let corrupt = EngineError::from(StoreError::Serialization("bad".into()));
        assert!(!corrupt.is_fatal_to_actor());

        let failure = EngineError::HandlerFailure {
            event: "json".into(),
            reason: "boom".into(),
        };
        assert!(!failure.is_fatal_to_actor());
        assert_eq!(failure.to_string(), "handler for 'json' failed: boom");
    }
}
