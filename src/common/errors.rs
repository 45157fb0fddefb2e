use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failures surfaced by the voice transport.
///
/// Per-datagram problems (bad header, failed authentication, foreign
/// origin) never become a `VoiceError`: the media loops drop the offending
/// datagram and keep going.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// The session's cancellation signal fired while the caller was blocked.
    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out waiting for the voice connection")]
    Timeout,

    #[error("server offered no supported encryption mode (offered: {offered:?})")]
    UnsupportedEncryptionMode { offered: Vec<String> },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid PCM frame: expected {expected} bytes, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },

    #[error("voice client is not connected")]
    NotConnected,

    #[error("audio codec error: {0}")]
    Codec(String),

    #[error("packet encryption failed")]
    Encryption,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("malformed control message: {0}")]
    Json(#[from] serde_json::Error),
}

impl VoiceError {
    /// Errors that must not trigger a reconnect attempt: retrying would hit
    /// the same wall again.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedEncryptionMode { .. } | Self::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_mode_mismatch_and_cancel_are_fatal() {
        assert!(VoiceError::UnsupportedEncryptionMode { offered: vec![] }.is_fatal());
        assert!(VoiceError::Cancelled.is_fatal());
        assert!(!VoiceError::Timeout.is_fatal());
        assert!(!VoiceError::Protocol("x".into()).is_fatal());
        assert!(!VoiceError::Io(io::Error::other("down")).is_fatal());
    }
}
