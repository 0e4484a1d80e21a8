//! Error taxonomy for the session layer.
//!
//! DESIGN
//! ======
//! One enum per failure surface: establishing things (`ConnectError`),
//! writing frames (`SendError`), and the transport underneath
//! (`TransportError`). Frame decoding errors live in the `frames` crate.
//! Every error maps to a grepable code via [`ErrorCode`]; rejection frames
//! carry the same codes on the wire.

use frames::{CODE_NAMESPACE_NOT_FOUND, CODE_UNAUTHORIZED};

/// Grepable error code for logs and rejection frames.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;
}

/// Failure to establish a connection or join a namespace.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The peer refused the handshake credential.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The transport could not be opened or failed during the handshake.
    #[error("unreachable: {0}")]
    Unreachable(String),
    /// The namespace is not declared on one of the two ends.
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),
    /// No answer arrived before the configured deadline.
    #[error("timed out")]
    Timeout,
    /// The connection closed while the operation was pending.
    #[error("connection closed")]
    Closed,
}

impl ErrorCode for ConnectError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "E_UNAUTHORIZED",
            Self::Unreachable(_) => "E_UNREACHABLE",
            Self::NamespaceNotFound(_) => "E_NAMESPACE_NOT_FOUND",
            Self::Timeout => "E_TIMEOUT",
            Self::Closed => "E_CLOSED",
        }
    }
}

impl ConnectError {
    /// Map a rejection code received on the wire.
    pub(crate) fn from_rejection(code: &str, namespace: &str, reason: String) -> Self {
        match code {
            CODE_UNAUTHORIZED => Self::Unauthorized(reason),
            CODE_NAMESPACE_NOT_FOUND => Self::NamespaceNotFound(namespace.to_owned()),
            _ => Self::Unreachable(format!("rejected ({code}): {reason}")),
        }
    }
}

/// Failure to queue an outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The namespace is not joined or the connection is gone.
    #[error("namespace not connected")]
    NotConnected,
    /// The bounded write queue is full.
    #[error("write queue full")]
    Backpressure,
}

impl ErrorCode for SendError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotConnected => "E_NOT_CONNECTED",
            Self::Backpressure => "E_BACKPRESSURE",
        }
    }
}

/// Failure reported by a [`crate::transport::Transport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The stream ended. Carries the close reason, if the peer gave one.
    #[error("transport closed: {0}")]
    Closed(String),
    /// Read or write failed.
    #[error("transport i/o: {0}")]
    Io(String),
}

impl ErrorCode for TransportError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Closed(_) => "E_TRANSPORT_CLOSED",
            Self::Io(_) => "E_TRANSPORT_IO",
        }
    }
}

/// Error returned by event handlers and server hooks.
///
/// For application events the message travels back to the sender as an
/// error frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_owned())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<SendError> for HandlerError {
    fn from(err: SendError) -> Self {
        Self(err.to_string())
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
