//! PresenceChannel
//!
//! ## 責務
//!
//! - 自分の在席状態をチャンネルに通知する（join / update_status / leave）
//! - リモートの sync / join / leave を在席マップにマージする
//! - leave したサブジェクトの OFFLINE マーカーを outbox 経由で永続化する
//!
//! ## 設計ノート
//!
//! 在席マップはこのコンポーネントだけが所有し、外部にはスナップショットのみを返します。
//! join は `source_generation` が保存済みの値より古い場合に捨てられます。
//! 同じサブジェクトの複数デバイスが食い違う場合も「世代が新しい方が勝つ」で解決します。
//! 自分の世代は時計で初期化した単調増加カウンタなので、再起動したクライアントの
//! 通知が古い世代として捨てられることはありません。

use std::{collections::HashMap, sync::Arc};

use kizuna_shared::time::Clock;

use super::outbox::{OfflineMarker, PersistenceOutbox};
use crate::{
    connection::ConnectionHandle,
    domain::{ConnectionState, PresenceRecord, PresenceStatus, PresenceView, SubjectId, Timestamp},
    events::{EventSink, SyncEvent},
    infrastructure::dto::websocket::{OutboundEvent, PresencePayload, SubjectRefPayload},
};

pub struct PresenceChannel {
    self_subject: SubjectId,
    records: HashMap<SubjectId, PresenceRecord>,
    /// Generation of each departed subject's last record. Joins at or below
    /// it are replays from before the leave.
    departed: HashMap<SubjectId, u64>,
    /// Our own announcement while joined.
    local: Option<PresenceRecord>,
    generation: u64,
    connection: ConnectionHandle,
    outbox: PersistenceOutbox,
    clock: Arc<dyn Clock>,
    events: EventSink,
}

impl PresenceChannel {
    pub fn new(
        self_subject: SubjectId,
        connection: ConnectionHandle,
        outbox: PersistenceOutbox,
        clock: Arc<dyn Clock>,
        events: EventSink,
    ) -> Self {
        Self {
            self_subject,
            records: HashMap::new(),
            departed: HashMap::new(),
            local: None,
            generation: 0,
            connection,
            outbox,
            clock,
            events,
        }
    }

    fn now(&self) -> Timestamp {
        Timestamp::new(self.clock.now_millis())
    }

    fn next_generation(&mut self) -> u64 {
        let seed = u64::try_from(self.clock.now_millis()).unwrap_or(0);
        self.generation = seed.max(self.generation + 1);
        self.generation
    }

    /// Announce the local subject as ONLINE.
    pub fn join(&mut self) {
        let now = self.now();
        self.announce(PresenceStatus::Online, now);
    }

    /// Re-announce with `status`. Ignored unless joined.
    pub fn update_status(&mut self, status: PresenceStatus, last_activity_at: Timestamp) {
        if self.local.is_none() {
            tracing::debug!("Not joined, ignoring presence update to {}", status);
            return;
        }
        self.announce(status, last_activity_at);
    }

    fn announce(&mut self, status: PresenceStatus, last_activity_at: Timestamp) {
        let record = PresenceRecord {
            subject_id: self.self_subject.clone(),
            status,
            last_activity_at,
            source_generation: self.next_generation(),
        };
        let previous = self.local.as_ref().map(|local| local.status);
        if previous != Some(status) {
            tracing::info!(subject = %self.self_subject, "Announcing presence {}", status);
        }
        self.connection
            .emit(OutboundEvent::PresenceTrack(PresencePayload::from(&record)));
        self.store(record.clone());
        self.local = Some(record);
    }

    /// Announce departure. Always called on teardown.
    pub fn leave(&mut self) {
        if self.local.take().is_none() {
            return;
        }
        self.connection
            .emit(OutboundEvent::PresenceUntrack(SubjectRefPayload {
                subject_id: self.self_subject.to_string(),
            }));
        if self.records.remove(&self.self_subject).is_some() {
            self.events
                .emit(SyncEvent::PresenceChanged(self.self_subject.clone()));
        }
        tracing::info!(subject = %self.self_subject, "Left presence channel");
    }

    /// Status of our own announcement, `None` when not joined.
    pub fn local_status(&self) -> Option<PresenceStatus> {
        self.local.as_ref().map(|local| local.status)
    }

    /// Replace the whole map with a server snapshot.
    pub fn apply_sync(&mut self, members: Vec<PresenceRecord>) {
        let mut next: HashMap<SubjectId, PresenceRecord> = members
            .into_iter()
            .map(|record| (record.subject_id.clone(), record))
            .collect();
        if let Some(local) = &self.local {
            let keep_local = next
                .get(&local.subject_id)
                .is_none_or(|synced| !synced.supersedes(local));
            if keep_local {
                next.insert(local.subject_id.clone(), local.clone());
            }
        }

        let mut changed: Vec<SubjectId> = self
            .records
            .iter()
            .filter(|(subject, record)| next.get(*subject) != Some(*record))
            .map(|(subject, _)| subject.clone())
            .collect();
        changed.extend(
            next.keys()
                .filter(|subject| !self.records.contains_key(*subject))
                .cloned(),
        );

        tracing::debug!(members = next.len(), "Applied presence sync");
        self.records = next;
        self.departed.clear();
        for subject in changed {
            self.events.emit(SyncEvent::PresenceChanged(subject));
        }
    }

    /// Apply a single join. Returns `false` for a stale replay.
    pub fn apply_join(&mut self, record: PresenceRecord) -> bool {
        if let Some(stored) = self.records.get(&record.subject_id)
            && !record.supersedes(stored)
        {
            tracing::debug!(
                subject = %record.subject_id,
                "Ignoring stale presence generation {} (stored {})",
                record.source_generation,
                stored.source_generation
            );
            return false;
        }
        if let Some(&departed_at) = self.departed.get(&record.subject_id) {
            if record.source_generation <= departed_at {
                tracing::debug!(
                    subject = %record.subject_id,
                    "Ignoring presence generation {} replayed after leave (left at {})",
                    record.source_generation,
                    departed_at
                );
                return false;
            }
            self.departed.remove(&record.subject_id);
        }
        if record.subject_id == self.self_subject
            && let Some(local) = &mut self.local
            && record.source_generation > local.source_generation
        {
            // Another device of ours announced more recently.
            *local = record.clone();
            self.generation = self.generation.max(record.source_generation);
        }
        self.store(record);
        true
    }

    /// Apply a leave and queue the OFFLINE marker.
    pub fn apply_leave(&mut self, subject: &SubjectId) {
        let Some(record) = self.records.remove(subject) else {
            return;
        };
        self.departed
            .insert(subject.clone(), record.source_generation);
        let marker = OfflineMarker {
            subject: subject.clone(),
            last_seen: self.now().max(record.last_activity_at),
        };
        if let Err(e) = self.outbox.enqueue(marker) {
            tracing::warn!(subject = %subject, "Dropped offline marker: {}", e);
        }
        self.events.emit(SyncEvent::PresenceChanged(subject.clone()));
    }

    /// Re-track after every (re)connect; drop remote records once the
    /// connection is down for good.
    pub fn on_connection_state(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                if let Some(local) = &self.local {
                    let (status, last_activity_at) = (local.status, local.last_activity_at);
                    self.announce(status, last_activity_at);
                }
            }
            ConnectionState::Disconnected => {
                let remote: Vec<SubjectId> = self
                    .records
                    .keys()
                    .filter(|subject| **subject != self.self_subject)
                    .cloned()
                    .collect();
                for subject in remote {
                    self.records.remove(&subject);
                    self.events.emit(SyncEvent::PresenceChanged(subject));
                }
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {}
        }
    }

    fn store(&mut self, record: PresenceRecord) {
        let subject = record.subject_id.clone();
        if self.records.get(&subject) != Some(&record) {
            self.records.insert(subject.clone(), record);
            self.events.emit(SyncEvent::PresenceChanged(subject));
        }
    }

    pub fn record(&self, subject: &SubjectId) -> Option<&PresenceRecord> {
        self.records.get(subject)
    }

    pub fn is_online(&self, subject: &SubjectId) -> bool {
        self.records
            .get(subject)
            .is_some_and(|record| record.status == PresenceStatus::Online)
    }

    pub fn is_away(&self, subject: &SubjectId) -> bool {
        self.records
            .get(subject)
            .is_some_and(|record| record.status == PresenceStatus::Away)
    }

    /// Live view of `subject`, or OFFLINE with the history store's last-seen
    /// value when no live record exists.
    pub fn get_status(&self, subject: &SubjectId, fallback_last_seen: Option<Timestamp>) -> PresenceView {
        match self.records.get(subject) {
            Some(record) => PresenceView::from_record(record),
            None => PresenceView::offline(fallback_last_seen),
        }
    }

    /// Subjects currently ONLINE or AWAY, sorted.
    pub fn online_subjects(&self) -> Vec<SubjectId> {
        let mut subjects: Vec<SubjectId> = self
            .records
            .values()
            .filter(|record| record.status != PresenceStatus::Offline)
            .map(|record| record.subject_id.clone())
            .collect();
        subjects.sort();
        subjects
    }
}
