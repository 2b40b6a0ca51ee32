//! Off-path queue for best-effort presence persistence.
//!
//! Presence transitions enqueue an [`OfflineMarker`] and move on. A single
//! worker task writes markers to the [`PresenceStore`]; failures are logged
//! and never retried. A full outbox drops the marker.

use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    domain::{PresenceStore, SubjectId, Timestamp},
    error::PersistenceError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineMarker {
    pub subject: SubjectId,
    pub last_seen: Timestamp,
}

#[derive(Debug, Clone)]
pub struct PersistenceOutbox {
    tx: mpsc::Sender<OfflineMarker>,
}

impl PersistenceOutbox {
    /// Spawn the worker. It exits once every outbox clone is dropped and the
    /// remaining markers are written.
    pub fn spawn(store: Arc<dyn PresenceStore>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(store, rx));
        (Self { tx }, worker)
    }

    /// An outbox whose markers land in the returned receiver.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, mpsc::Receiver<OfflineMarker>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a marker without waiting.
    pub fn enqueue(&self, marker: OfflineMarker) -> Result<(), PersistenceError> {
        self.tx.try_send(marker).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PersistenceError::OutboxFull,
            mpsc::error::TrySendError::Closed(_) => {
                PersistenceError::RequestFailed("outbox worker stopped".to_string())
            }
        })
    }
}

async fn run_worker(store: Arc<dyn PresenceStore>, mut rx: mpsc::Receiver<OfflineMarker>) {
    while let Some(marker) = rx.recv().await {
        match store.persist_offline(&marker.subject, marker.last_seen).await {
            Ok(()) => tracing::debug!(subject = %marker.subject, "Persisted offline marker"),
            Err(e) => tracing::warn!(subject = %marker.subject, "Failed to persist offline marker: {}", e),
        }
    }
    tracing::debug!("Presence outbox worker stopped");
}
