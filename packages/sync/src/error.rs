//! Error types for the sync core.
//!
//! Transport and persistence errors are absorbed inside the core; only
//! [`SyncError`] and the authentication signal reach consumers.

use thiserror::Error;

use crate::domain::{CanonicalId, LocalId, ValueObjectError};

/// Errors raised by a [`Transport`](crate::infrastructure::transport::Transport)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The coordination service rejected the bearer credential
    #[error("Credential rejected by server: {0}")]
    Unauthorized(String),

    /// Network-level failure while connecting (DNS, refused, TLS, handshake)
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// Connection attempt exceeded the configured timeout
    #[error("Connection timed out after {0}ms")]
    Timeout(u64),

    /// Failure on an established link
    #[error("Connection lost: {0}")]
    Closed(String),
}

impl TransportError {
    /// Authentication failures are fatal for the current attempt.
    pub fn is_authentication(&self) -> bool {
        matches!(self, TransportError::Unauthorized(_))
    }
}

/// Errors raised by a credential provider
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("No credential available: {0}")]
    Unavailable(String),
}

/// Errors from the connection manager API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("Connection manager is already running")]
    AlreadyConnected,

    #[error("Connection manager has shut down")]
    Closed,
}

/// Errors from the best-effort presence store
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("Presence store request failed: {0}")]
    RequestFailed(String),

    #[error("Presence outbox is full")]
    OutboxFull,
}

/// Errors from the history API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("History request failed: {0}")]
    RequestFailed(String),

    #[error("History response was malformed: {0}")]
    Malformed(String),
}

/// Malformed or unexpected inbound frame
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Frame is not a known event: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid field in event: {0}")]
    InvalidField(#[from] ValueObjectError),
}

/// Consumer-facing errors of the sync core
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("Message '{0}' is not in the local timeline")]
    UnknownMessage(CanonicalId),

    #[error("Send attempt '{0}' is unknown")]
    UnknownSend(LocalId),

    #[error("Send attempt '{0}' is not in a failed state")]
    NotFailed(LocalId),

    #[error("Message '{0}' was deleted")]
    MessageDeleted(CanonicalId),

    #[error("Session has been torn down")]
    SessionClosed,

    #[error(transparent)]
    InvalidValue(#[from] ValueObjectError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    History(#[from] HistoryError),
}
