//! Pure decisions of the reconnect loop.
//!
//! Kept free of I/O so the loop's branching can be tested in isolation.

use crate::error::{CredentialError, TransportError};

/// Why a connect attempt or an established link ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    Credential(CredentialError),
    Transport(TransportError),
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::Credential(e) => e.fmt(f),
            Failure::Transport(e) => e.fmt(f),
        }
    }
}

/// Authentication failures stop the loop until a manual reconnect.
pub fn is_fatal(failure: &Failure) -> bool {
    match failure {
        Failure::Credential(_) => true,
        Failure::Transport(e) => e.is_authentication(),
    }
}

/// Whether another reconnect attempt is allowed after `failure`.
///
/// `attempts_made` counts reconnect attempts since the last success.
pub fn should_attempt_reconnect(failure: &Failure, attempts_made: u32, max_attempts: u32) -> bool {
    if is_fatal(failure) {
        return false;
    }
    attempts_made < max_attempts
}
