use blorp_core::MessageError;
use blorp_engine::EngineError;
use blorp_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("instance registration failed after {attempts} attempts")]
    RegistrationFailed { attempts: u32 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("app is not running")]
    NotRunning,

    #[error("app was already started")]
    AlreadyStarted,
}

impl From<MessageError> for ServerError {
    fn from(e: MessageError) -> Self {
        Self::Engine(EngineError::Message(e))
    }
}

impl From<tokio::task::JoinError> for ServerError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Runtime(format!("background task failed: {e}"))
    }
}
