//! Notifications published by a session to its observers.

use tokio::sync::broadcast;

use crate::domain::{CanonicalId, ConnectionState, ConversationKey, LocalId, SubjectId};

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ConnectionChanged(ConnectionState),
    /// Reconnect attempts are exhausted; the connection is parked until a
    /// manual reconnect.
    PersistentFailure { attempts: u32 },
    /// The server refused our credentials.
    AuthenticationFailed(String),
    TimelineChanged(ConversationKey),
    DeliveryFailed {
        local_id: LocalId,
        conversation: ConversationKey,
    },
    PresenceChanged(SubjectId),
    TypingChanged(ConversationKey),
    GroupMembership {
        group_id: String,
        subject: SubjectId,
        joined: bool,
    },
    ThreadUpdated {
        parent: CanonicalId,
        reply_count: u32,
    },
}

/// Fan-out point for [`SyncEvent`]s. Emitting never blocks; lagging
/// observers lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: SyncEvent) {
        // No receiver is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}
