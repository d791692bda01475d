//! Error types for modal-transport.

use std::sync::Arc;
use thiserror::Error;
use tonic::Code;

/// Result type alias for modal-transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur while talking to the control plane or a command router.
///
/// The type is `Clone` so that a single terminal error can be stored in a
/// stream pipe and handed to every subsequent reader.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Status returned by a remote RPC, preserved unchanged.
    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    /// No valid account token could be obtained.
    #[error("authentication failed: {message}")]
    Auth {
        /// What the client was trying to do
        message: String,
        /// Underlying failure, if any
        #[source]
        source: Option<Box<TransportError>>,
    },

    /// A deadline elapsed before the operation could complete.
    #[error("{0}")]
    DeadlineExceeded(String),

    /// The command router client was closed.
    #[error("command router client is closed")]
    ClientClosed,

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The requested feature is not available for this task.
    #[error("not available: {0}")]
    NotAvailable(String),

    /// Invalid caller-supplied argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid client configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to establish or maintain a connection
    #[error("connection failed: {0}")]
    Connection(String),

    /// Error reported through a stdio stream
    #[error("{0}")]
    Stream(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl TransportError {
    /// Build an authentication error wrapping its cause.
    pub fn auth(message: impl Into<String>, source: TransportError) -> Self {
        Self::Auth {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// gRPC status code, if this error carries one.
    pub fn status_code(&self) -> Option<Code> {
        match self {
            Self::Rpc(status) => Some(status.code()),
            _ => None,
        }
    }

    /// Whether the error is a deadline expiry, either local or reported by the server.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded(_))
            || self.status_code() == Some(Code::DeadlineExceeded)
    }

    /// Whether the error means the caller is not (or no longer) authenticated.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::Auth { .. }) || self.status_code() == Some(Code::Unauthenticated)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<tonic::transport::Error> for TransportError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Connection(err.to_string())
    }
}
