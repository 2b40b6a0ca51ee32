//! External collaborator traits
//!
//! The sync core depends on these interfaces; concrete adapters live in the
//! infrastructure layer (dependency inversion).

use async_trait::async_trait;

use super::{CanonicalId, ConversationKey, IncomingMessage, SubjectId, Timestamp};
use crate::error::{CredentialError, HistoryError, PersistenceError};

/// One page of conversation history, newest page first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HistoryPage {
    pub messages: Vec<IncomingMessage>,
    /// Cursor for the next (older) page, `None` at the beginning of history.
    pub next_cursor: Option<CanonicalId>,
}

/// Paginated message history API (invoked on mount, not part of the real-time path)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    /// Fetch up to `limit` messages older than `before`.
    async fn fetch_page(
        &self,
        conversation: &ConversationKey,
        before: Option<CanonicalId>,
        limit: usize,
    ) -> Result<HistoryPage, HistoryError>;
}

/// Durable presence snapshots, written best-effort
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Record that `subject` went offline, last seen at `last_seen`.
    async fn persist_offline(
        &self,
        subject: &SubjectId,
        last_seen: Timestamp,
    ) -> Result<(), PersistenceError>;
}

/// Source of the bearer credential
///
/// Called once per connection attempt; the token is never cached beyond it
/// so a refreshed token is picked up on the next reconnect.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, CredentialError>;
}

/// Credential provider returning a fixed token.
#[derive(Clone)]
pub struct StaticCredential {
    token: String,
}

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredential")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn bearer_token(&self) -> Result<String, CredentialError> {
        if self.token.is_empty() {
            return Err(CredentialError::Unavailable("empty token".to_string()));
        }
        Ok(self.token.clone())
    }
}

/// Presence store that discards every write.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPresenceStore;

#[async_trait]
impl PresenceStore for NoopPresenceStore {
    async fn persist_offline(
        &self,
        _subject: &SubjectId,
        _last_seen: Timestamp,
    ) -> Result<(), PersistenceError> {
        Ok(())
    }
}
