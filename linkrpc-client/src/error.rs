//! Dispatch error types.

use linkrpc_protocol::ProtocolError;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned to the immediate caller.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("dispatch link error: {addr}: {source}")]
    Link {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("not linked")]
    NotLinked,

    #[error("in single-link mode only the active connection {active:?} is addressable, got {requested}")]
    Addressing {
        requested: String,
        active: Option<String>,
    },

    #[error("listen is not supported in single-link mode")]
    ListenUnsupported,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("no such pending call: {0}")]
    NoSuchPendingCall(String),

    #[error("no frame handler registered")]
    NoFrameHandler,

    #[error("unexpected frame: expected {expected}, got {got}")]
    UnexpectedFrame {
        expected: &'static str,
        got: &'static str,
    },

    #[error("remote error: {0}")]
    Remote(String),
}

impl DispatchError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Io(_)
                | DispatchError::Link { .. }
                | DispatchError::NotLinked
                | DispatchError::Timeout
                | DispatchError::ConnectionClosed
        )
    }
}

/// Unrecoverable conditions handed to the dispatcher's fatal sink.
#[derive(Debug, Clone, Error)]
pub enum FatalError {
    #[error("connection closed: reconnect retry limit {limit} reached")]
    ReconnectExhausted { limit: u32 },

    #[error("connection {connection_id} lost and auto reconnect is disabled: {reason}")]
    ConnectionLost {
        connection_id: String,
        reason: String,
    },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("frame received before a frame handler was registered")]
    MissingFrameHandler,

    #[error("relink requested before any link")]
    NotLinked,
}

/// Receives fatal errors; decides how the embedding application shuts down.
pub type FatalSink = Arc<dyn Fn(FatalError) + Send + Sync>;

/// Sink used until one is installed: logs and aborts the process.
pub fn abort_on_fatal() -> FatalSink {
    Arc::new(|err: FatalError| {
        tracing::error!("fatal dispatch error: {}", err);
        std::process::abort();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(DispatchError::Timeout.is_retryable());
        assert!(DispatchError::ConnectionClosed.is_retryable());
        assert!(DispatchError::NotLinked.is_retryable());
        assert!(!DispatchError::ListenUnsupported.is_retryable());
        assert!(!DispatchError::Remote("bad args".into()).is_retryable());
        assert!(!DispatchError::NoSuchPendingCall("x".into()).is_retryable());
    }

    #[test]
    fn test_link_error_keeps_source() {
        let err = DispatchError::Link {
            addr: "10.0.0.1:7420".into(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(err.to_string().starts_with("dispatch link error: 10.0.0.1:7420"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_fatal_display_names_limit() {
        let err = FatalError::ReconnectExhausted { limit: 3 };
        assert!(err.to_string().contains("limit 3"));
    }
}
