//! Error types for the glasslink library.

use thiserror::Error;

use crate::transport::TransportMode;

/// The main error type for glasslink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The transport for the requested mode is not available on this host.
    #[error("{mode} transport unavailable: {reason}")]
    Unavailable { mode: TransportMode, reason: String },

    /// The connect attempt was cancelled (picker dismissed or disconnect requested).
    #[error("connect cancelled")]
    Cancelled,

    /// Service or characteristic discovery failed.
    #[error("discovery failed: {message}")]
    Discovery { message: String },

    /// The host bridge reported a connect error.
    #[error("connection rejected: {reason}")]
    Rejected { reason: String },

    /// Connect attempt timed out waiting for the transport.
    #[error("connect timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A frame write failed.
    #[error("write failed: {message}")]
    Write { message: String },

    /// Connection is not established.
    #[error("not connected")]
    NotConnected,

    /// Another connect attempt is already pending.
    #[error("connect already in progress")]
    ConnectInProgress,

    /// Command name is not recognised.
    #[error("unknown command: {name}")]
    UnknownCommand { name: String },

    /// Command payload is missing or malformed.
    #[error("invalid payload for {command}: {reason}")]
    InvalidPayload { command: String, reason: String },

    /// Base64 decoding of bridge data failed.
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame construction error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Internal channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

impl Error {
    /// Returns true if the transport itself reported the failure.
    ///
    /// A connect attempt that fails this way ends in `ConnectionState::Error`
    /// rather than `ConnectionState::Disconnected`.
    #[must_use]
    pub const fn is_adapter_error(&self) -> bool {
        matches!(
            self,
            Self::Discovery { .. } | Self::Rejected { .. } | Self::Write { .. }
        )
    }

    pub(crate) fn invalid_payload(command: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            command: command.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Frame construction errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Payload would need more fragments than the one-byte counter can carry.
    #[error("payload of {len} bytes needs {count} fragments, maximum is 255")]
    TooManyFragments { len: usize, count: usize },

    /// Fragment capacity must be non-zero.
    #[error("fragment capacity must be non-zero")]
    ZeroCapacity,
}

/// Result type alias for glasslink operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_error_classification() {
        assert!(
            Error::Rejected {
                reason: "gatt 133".into()
            }
            .is_adapter_error()
        );
        assert!(
            Error::Discovery {
                message: "no service".into()
            }
            .is_adapter_error()
        );
        assert!(!Error::Cancelled.is_adapter_error());
        assert!(!Error::Timeout { timeout_ms: 15_000 }.is_adapter_error());
        assert!(
            !Error::Unavailable {
                mode: TransportMode::Direct,
                reason: "no adapter".into()
            }
            .is_adapter_error()
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::Timeout { timeout_ms: 15_000 };
        assert_eq!(err.to_string(), "connect timed out after 15000ms");
        let err = Error::Codec(CodecError::ZeroCapacity);
        assert_eq!(err.to_string(), "codec error: fragment capacity must be non-zero");
    }
}
