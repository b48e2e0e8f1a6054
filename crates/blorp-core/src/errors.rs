/// Failures decoding or encoding broker payloads.
///
/// Decode failures are never fatal: the consumer drops the payload, logs it and
/// keeps listening.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("encode failed: {0}")]
    Encode(String),
}

impl MessageError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed_message",
            Self::Encode(_) => "encode_failed",
        }
    }

    pub(crate) fn malformed(raw: &str, err: &serde_json::Error) -> Self {
        const PREVIEW: usize = 120;
        let preview: String = raw.chars().take(PREVIEW).collect();
        Self::Malformed(format!("{err} (payload: {preview})"))
    }
}

impl From<serde_json::Error> for MessageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e.to_string())
    }
}
