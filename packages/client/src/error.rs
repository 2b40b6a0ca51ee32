//! Error types for the terminal client.

use kizuna_sync::{SyncError, domain::ValueObjectError};
use thiserror::Error;

/// Client-specific errors
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration file could not be read or parsed
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Input line is not a valid command
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The server rejected our credential
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Reconnection gave up
    #[error("Connection failed after {0} reconnect attempts")]
    PersistentFailure(u32),

    #[error(transparent)]
    InvalidValue(#[from] ValueObjectError),

    #[error(transparent)]
    Session(#[from] SyncError),
}
