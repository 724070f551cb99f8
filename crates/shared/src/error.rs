use thiserror::Error;

/// Failure preparing an outbound message before any network I/O happens.
/// Surfaced synchronously to the caller; never retried by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("no active identity; call connect() before sending")]
    NotReady,
    #[error("message content is empty after sanitization")]
    EmptyContent,
}

/// Terminal transport failure. Requires an explicit new `connect()`.
#[derive(Debug, Clone, Error)]
#[error("fatal transport error ({code}): {message}")]
pub struct FatalTransportError {
    pub code: String,
    pub message: String,
}

impl FatalTransportError {
    pub fn tls_handshake(message: impl Into<String>) -> Self {
        Self {
            code: "TLS_HANDSHAKE_FAILED".to_string(),
            message: message.into(),
        }
    }
}
