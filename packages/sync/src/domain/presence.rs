//! Presence domain model.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{SubjectId, Timestamp};

/// Presence status of a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Subject is actively using a client.
    Online,
    /// Subject is connected but idle.
    Away,
    /// Subject has left or was never seen.
    Offline,
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Away => write!(f, "away"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Latest known presence of one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceRecord {
    pub subject_id: SubjectId,
    pub status: PresenceStatus,
    pub last_activity_at: Timestamp,
    pub source_generation: u64,
}

impl PresenceRecord {
    /// Whether this update may replace `stored`.
    ///
    /// Equal generations are accepted; only strictly older updates are stale.
    pub fn supersedes(&self, stored: &PresenceRecord) -> bool {
        self.source_generation >= stored.source_generation
    }
}

/// Presence as shown to the UI, with a history fallback for absent subjects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PresenceView {
    pub status: PresenceStatus,
    pub last_seen: Option<Timestamp>,
    /// `true` when backed by a live channel record rather than the fallback.
    pub live: bool,
}

impl PresenceView {
    pub fn from_record(record: &PresenceRecord) -> Self {
        Self {
            status: record.status,
            last_seen: Some(record.last_activity_at),
            live: true,
        }
    }

    pub fn offline(last_seen: Option<Timestamp>) -> Self {
        Self {
            status: PresenceStatus::Offline,
            last_seen,
            live: false,
        }
    }
}
