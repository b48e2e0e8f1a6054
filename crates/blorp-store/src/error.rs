#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the failure came from the broker round trip itself.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::BrokerUnavailable(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::BrokerUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
