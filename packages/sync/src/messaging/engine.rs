//! MessageSyncEngine
//!
//! ## 責務
//!
//! - 送信をローカルエコー（PENDING）として即座にタイムラインへ追加し、ソケットへ送る
//! - `message:sent` をローカル ID で対応付け、同じエントリをその場で確定（SENT）させる
//! - 受信メッセージを正規 ID で重複排除し、会話ごとにサーバー順で並べる
//! - 対象より先に届いた編集・削除・既読・リアクションを猶予期間だけ保留する
//!
//! ## 設計ノート
//!
//! ACK タイマーは接続中のみ動きます。再接続のたびに PENDING の全エントリに対して
//! 張り直し、切断時には解除するので、オフラインの間に自動リトライを使い切ることはありません。
//! 自動リトライは 1 回だけで、2 回目の失敗で FAILED となり呼び出し側に通知されます。

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use kizuna_shared::time::Clock;
use tokio::sync::watch;

use super::{
    buffer::{Mutation, MutationBuffer},
    handle::SendHandle,
    timeline::ConversationTimeline,
};
use crate::{
    config::MessagingConfig,
    connection::ConnectionHandle,
    domain::{
        Attachment, CanonicalId, ConnectionState, ConversationKey, DeleteScope, DeliveryState,
        EntryIdentity, HistoryPage, IncomingMessage, LocalId, SubjectId, Timestamp, TimelineEntry,
    },
    error::SyncError,
    events::{EventSink, SyncEvent},
    infrastructure::dto::{
        conversion::send_event,
        websocket::{
            DeletePayload, DraftPayload, EditPayload, GroupRefPayload, MessageRefPayload,
            OutboundEvent, ReactionPayload, ThreadRefPayload,
        },
    },
    scheduler::{Scheduler, TimerKey},
};

/// Transmissions per send before it is FAILED: the first plus one retry.
const MAX_ATTEMPTS: u8 = 2;

/// Confirmed local ids remembered for dropping retransmitted copies.
const MERGED_CAPACITY: usize = 1024;

pub struct MessageSyncEngine {
    self_subject: SubjectId,
    config: MessagingConfig,
    connection: ConnectionHandle,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
    events: EventSink,
    timelines: HashMap<ConversationKey, ConversationTimeline>,
    /// Conversation of every pending or failed local id.
    unconfirmed: HashMap<LocalId, ConversationKey>,
    /// Conversation of every confirmed canonical id.
    located: HashMap<CanonicalId, ConversationKey>,
    /// Local ids already merged into a confirmed entry, oldest first in
    /// `merged_order`. Only recent sends can see a retransmitted second copy.
    merged: HashMap<LocalId, CanonicalId>,
    merged_order: VecDeque<LocalId>,
    buffer: MutationBuffer,
    watchers: HashMap<LocalId, watch::Sender<DeliveryState>>,
    read_markers: HashMap<ConversationKey, CanonicalId>,
    connected: bool,
}

fn find_confirmed<'a>(
    timelines: &'a mut HashMap<ConversationKey, ConversationTimeline>,
    located: &HashMap<CanonicalId, ConversationKey>,
    id: &CanonicalId,
) -> Option<&'a mut TimelineEntry> {
    let conversation = located.get(id)?;
    timelines.get_mut(conversation)?.get_mut(id)
}

fn find_unconfirmed<'a>(
    timelines: &'a mut HashMap<ConversationKey, ConversationTimeline>,
    unconfirmed: &HashMap<LocalId, ConversationKey>,
    local_id: &LocalId,
) -> Option<&'a mut TimelineEntry> {
    let conversation = unconfirmed.get(local_id)?;
    timelines.get_mut(conversation)?.unconfirmed_mut(local_id)
}

enum AttemptOutcome {
    Retry(Option<OutboundEvent>),
    Failed(ConversationKey),
}

impl MessageSyncEngine {
    pub fn new(
        self_subject: SubjectId,
        config: MessagingConfig,
        connection: ConnectionHandle,
        scheduler: Scheduler,
        clock: Arc<dyn Clock>,
        events: EventSink,
    ) -> Self {
        Self {
            self_subject,
            config,
            connection,
            scheduler,
            clock,
            events,
            timelines: HashMap::new(),
            unconfirmed: HashMap::new(),
            located: HashMap::new(),
            merged: HashMap::new(),
            merged_order: VecDeque::new(),
            buffer: MutationBuffer::default(),
            watchers: HashMap::new(),
            read_markers: HashMap::new(),
            connected: false,
        }
    }

    // ========================================
    // Outbound operations
    // ========================================

    /// Append a PENDING local echo and transmit it.
    pub fn send(
        &mut self,
        conversation: ConversationKey,
        content: String,
        attachments: Vec<Attachment>,
    ) -> SendHandle {
        let local_id = LocalId::generate();
        let now = Timestamp::new(self.clock.now_millis());
        let entry = TimelineEntry::pending(
            local_id.clone(),
            conversation.clone(),
            self.self_subject.clone(),
            content,
            attachments,
            now,
        );
        if let Some(event) = send_event(&entry) {
            self.connection.emit(event);
        }
        self.timelines
            .entry(conversation.clone())
            .or_default()
            .push_unconfirmed(entry);
        self.unconfirmed
            .insert(local_id.clone(), conversation.clone());
        let (state_tx, state_rx) = watch::channel(DeliveryState::Pending);
        self.watchers.insert(local_id.clone(), state_tx);
        self.arm_ack(&local_id);

        tracing::debug!(local_id = %local_id, conversation = %conversation, "Sending message");
        self.events
            .emit(SyncEvent::TimelineChanged(conversation.clone()));
        SendHandle::new(local_id, conversation, state_rx)
    }

    /// Put a FAILED send back to PENDING with a fresh automatic retry.
    pub fn retry(&mut self, local_id: &LocalId) -> Result<SendHandle, SyncError> {
        let entry = find_unconfirmed(&mut self.timelines, &self.unconfirmed, local_id)
            .ok_or_else(|| SyncError::UnknownSend(local_id.clone()))?;
        if !matches!(entry.identity, EntryIdentity::Failed { .. }) {
            return Err(SyncError::NotFailed(local_id.clone()));
        }
        entry.identity = EntryIdentity::Pending {
            local_id: local_id.clone(),
            attempts: 1,
        };
        let event = send_event(entry);
        let conversation = entry.conversation.clone();

        if let Some(event) = event {
            self.connection.emit(event);
        }
        self.arm_ack(local_id);
        let state_rx = match self.watchers.get(local_id) {
            Some(state_tx) => {
                state_tx.send_replace(DeliveryState::Pending);
                state_tx.subscribe()
            }
            None => {
                let (state_tx, state_rx) = watch::channel(DeliveryState::Pending);
                self.watchers.insert(local_id.clone(), state_tx);
                state_rx
            }
        };

        tracing::info!(local_id = %local_id, "Retrying failed message");
        self.events
            .emit(SyncEvent::TimelineChanged(conversation.clone()));
        Ok(SendHandle::new(local_id.clone(), conversation, state_rx))
    }

    pub fn edit(&mut self, id: &CanonicalId, content: String) -> Result<(), SyncError> {
        let entry = find_confirmed(&mut self.timelines, &self.located, id)
            .ok_or_else(|| SyncError::UnknownMessage(id.clone()))?;
        if entry.deleted == Some(DeleteScope::ForEveryone) {
            return Err(SyncError::MessageDeleted(id.clone()));
        }
        entry.apply_edit(content.clone());
        let conversation = entry.conversation.clone();

        self.connection
            .emit(OutboundEvent::EditMessage(EditPayload {
                message_id: id.to_string(),
                content,
            }));
        self.events.emit(SyncEvent::TimelineChanged(conversation));
        Ok(())
    }

    pub fn delete(&mut self, id: &CanonicalId, for_everyone: bool) -> Result<(), SyncError> {
        let entry = find_confirmed(&mut self.timelines, &self.located, id)
            .ok_or_else(|| SyncError::UnknownMessage(id.clone()))?;
        entry.apply_delete(DeleteScope::from_flag(for_everyone));
        let conversation = entry.conversation.clone();

        self.connection
            .emit(OutboundEvent::DeleteMessage(DeletePayload {
                message_id: id.to_string(),
                for_everyone,
            }));
        self.events.emit(SyncEvent::TimelineChanged(conversation));
        Ok(())
    }

    /// Optimistically add or remove our reaction.
    pub fn react(&mut self, id: &CanonicalId, emoji: &str, added: bool) -> Result<(), SyncError> {
        let entry = find_confirmed(&mut self.timelines, &self.located, id)
            .ok_or_else(|| SyncError::UnknownMessage(id.clone()))?;
        if entry.deleted == Some(DeleteScope::ForEveryone) {
            return Err(SyncError::MessageDeleted(id.clone()));
        }
        let changed = entry.apply_reaction(emoji, &self.self_subject, added);
        let conversation = entry.conversation.clone();

        let payload = ReactionPayload {
            message_id: id.to_string(),
            emoji: emoji.to_string(),
        };
        self.connection.emit(if added {
            OutboundEvent::AddReaction(payload)
        } else {
            OutboundEvent::RemoveReaction(payload)
        });
        if changed {
            self.events.emit(SyncEvent::TimelineChanged(conversation));
        }
        Ok(())
    }

    /// Fire-and-forget: moves the read marker, never touches the timeline.
    pub fn mark_read(&mut self, id: &CanonicalId) {
        if let Some(conversation) = self.located.get(id) {
            self.read_markers.insert(conversation.clone(), id.clone());
        }
        self.connection
            .emit(OutboundEvent::MarkRead(MessageRefPayload {
                message_id: id.to_string(),
            }));
    }

    pub fn save_draft(&self, conversation: &ConversationKey, content: String) {
        self.connection
            .emit(OutboundEvent::SaveDraft(DraftPayload {
                conversation_key: conversation.to_string(),
                content,
            }));
    }

    pub fn join_group(&self, group_id: &str) {
        self.connection
            .emit(OutboundEvent::JoinGroup(GroupRefPayload {
                group_id: group_id.to_string(),
            }));
    }

    pub fn join_thread(&self, parent: &CanonicalId) {
        self.connection
            .emit(OutboundEvent::JoinThread(ThreadRefPayload {
                parent_id: parent.to_string(),
            }));
    }

    pub fn leave_thread(&self, parent: &CanonicalId) {
        self.connection
            .emit(OutboundEvent::LeaveThread(ThreadRefPayload {
                parent_id: parent.to_string(),
            }));
    }

    // ========================================
    // Acknowledgment timers
    // ========================================

    fn arm_ack(&self, local_id: &LocalId) {
        if self.connected {
            self.scheduler
                .schedule_once(TimerKey::AckTimeout(local_id.clone()), self.config.ack_timeout());
        }
    }

    /// Arm acknowledgment timers for every PENDING entry on connect; cancel
    /// them on disconnect.
    pub fn on_connection_state(&mut self, state: ConnectionState) {
        let connected = state.is_connected();
        if connected == self.connected {
            return;
        }
        self.connected = connected;

        let local_ids: Vec<LocalId> = self.unconfirmed.keys().cloned().collect();
        for local_id in local_ids {
            let key = TimerKey::AckTimeout(local_id.clone());
            if !connected {
                self.scheduler.cancel(&key);
                continue;
            }
            let pending = find_unconfirmed(&mut self.timelines, &self.unconfirmed, &local_id)
                .is_some_and(|entry| entry.delivery_state() == DeliveryState::Pending);
            if pending {
                self.scheduler.schedule_once(key, self.config.ack_timeout());
            }
        }
    }

    pub fn on_ack_timeout(&mut self, local_id: &LocalId) {
        if !self.connected {
            return;
        }
        self.fail_attempt(local_id, "acknowledgment timed out");
    }

    /// `message:error`: the server refused the send.
    pub fn on_send_rejected(&mut self, local_id: &LocalId, reason: &str) {
        self.scheduler
            .cancel(&TimerKey::AckTimeout(local_id.clone()));
        self.fail_attempt(local_id, reason);
    }

    fn fail_attempt(&mut self, local_id: &LocalId, reason: &str) {
        let Some(entry) = find_unconfirmed(&mut self.timelines, &self.unconfirmed, local_id) else {
            return;
        };
        let outcome = match entry.identity {
            EntryIdentity::Pending { attempts, .. } if attempts < MAX_ATTEMPTS => {
                entry.identity = EntryIdentity::Pending {
                    local_id: local_id.clone(),
                    attempts: attempts + 1,
                };
                AttemptOutcome::Retry(send_event(entry))
            }
            EntryIdentity::Pending { .. } => {
                entry.identity = EntryIdentity::Failed {
                    local_id: local_id.clone(),
                };
                AttemptOutcome::Failed(entry.conversation.clone())
            }
            _ => return,
        };

        match outcome {
            AttemptOutcome::Retry(event) => {
                tracing::warn!(local_id = %local_id, "Send attempt failed ({}), retrying once", reason);
                if let Some(event) = event {
                    self.connection.emit(event);
                }
                self.arm_ack(local_id);
            }
            AttemptOutcome::Failed(conversation) => {
                tracing::warn!(local_id = %local_id, "Send failed after retry: {}", reason);
                self.scheduler
                    .cancel(&TimerKey::AckTimeout(local_id.clone()));
                self.set_delivery(local_id, DeliveryState::Failed);
                self.events.emit(SyncEvent::DeliveryFailed {
                    local_id: local_id.clone(),
                    conversation: conversation.clone(),
                });
                self.events.emit(SyncEvent::TimelineChanged(conversation));
            }
        }
    }

    /// SENT is final. A FAILED watcher is kept only while a handle still
    /// observes it, so a manual retry shows up on that handle.
    fn set_delivery(&mut self, local_id: &LocalId, state: DeliveryState) {
        let Some(state_tx) = self.watchers.get(local_id) else {
            return;
        };
        state_tx.send_replace(state);
        if state == DeliveryState::Sent || state_tx.receiver_count() == 0 {
            self.watchers.remove(local_id);
        }
    }

    fn remember_merged(&mut self, local_id: &LocalId, canonical_id: &CanonicalId) {
        if self
            .merged
            .insert(local_id.clone(), canonical_id.clone())
            .is_none()
        {
            self.merged_order.push_back(local_id.clone());
        }
        while self.merged_order.len() > MERGED_CAPACITY {
            if let Some(oldest) = self.merged_order.pop_front() {
                self.merged.remove(&oldest);
            }
        }
    }

    // ========================================
    // Inbound reconciliation
    // ========================================

    /// `message:sent`: merge into the local echo it answers.
    pub fn apply_sent(&mut self, message: IncomingMessage) {
        match message.local_id.clone() {
            Some(local_id) if self.unconfirmed.contains_key(&local_id) => {
                self.confirm(&local_id, message);
            }
            _ => self.apply_new(message),
        }
    }

    /// `message:new` and pushed group/thread messages: idempotent insert.
    pub fn apply_new(&mut self, message: IncomingMessage) {
        if let Some(local_id) = message.local_id.clone() {
            if self.unconfirmed.contains_key(&local_id) {
                self.confirm(&local_id, message);
                return;
            }
            if let Some(existing) = self.merged.get(&local_id)
                && *existing != message.canonical_id
            {
                tracing::debug!(
                    local_id = %local_id,
                    "Dropping second copy {} of a retransmitted send",
                    message.canonical_id
                );
                return;
            }
        }
        let conversation = message.conversation.clone();
        if self.insert_confirmed(TimelineEntry::from(message)) {
            self.events.emit(SyncEvent::TimelineChanged(conversation));
        }
    }

    fn confirm(&mut self, local_id: &LocalId, message: IncomingMessage) {
        let Some(conversation) = self.unconfirmed.remove(local_id) else {
            return;
        };
        self.scheduler
            .cancel(&TimerKey::AckTimeout(local_id.clone()));
        let canonical_id = message.canonical_id.clone();
        let pending = self
            .timelines
            .get_mut(&conversation)
            .and_then(|timeline| timeline.take_unconfirmed(local_id));

        if self.located.contains_key(&canonical_id) {
            tracing::debug!(local_id = %local_id, "Confirmation for {} already delivered", canonical_id);
            if let Some(existing) = find_confirmed(&mut self.timelines, &self.located, &canonical_id)
                && let EntryIdentity::Confirmed {
                    local_id: existing_local,
                    ..
                } = &mut existing.identity
                && existing_local.is_none()
            {
                *existing_local = Some(local_id.clone());
            }
        } else if let Some(mut entry) = pending {
            entry.confirm(message);
            self.insert_confirmed(entry);
        } else {
            self.insert_confirmed(TimelineEntry::from(message));
        }

        self.remember_merged(local_id, &canonical_id);
        self.set_delivery(local_id, DeliveryState::Sent);
        tracing::info!(local_id = %local_id, "Message confirmed as {}", canonical_id);
        self.events.emit(SyncEvent::TimelineChanged(conversation));
    }

    /// Insert with held mutations applied first, so the entry appears already
    /// in its final state. Returns `false` for a duplicate.
    fn insert_confirmed(&mut self, mut entry: TimelineEntry) -> bool {
        let Some(id) = entry.canonical_id().cloned() else {
            return false;
        };
        if self.located.contains_key(&id) {
            tracing::debug!("Duplicate delivery of {}", id);
            return false;
        }
        let held = self.buffer.take(&id);
        if !held.is_empty() {
            tracing::debug!("Replaying {} held mutations for {}", held.len(), id);
            self.scheduler.cancel(&TimerKey::MutationExpiry(id.clone()));
            for mutation in held {
                mutation.apply(&mut entry);
            }
        }
        let conversation = entry.conversation.clone();
        self.timelines
            .entry(conversation.clone())
            .or_default()
            .insert_confirmed(entry);
        self.located.insert(id, conversation);
        true
    }

    pub fn apply_remote_edit(&mut self, id: CanonicalId, content: String) {
        self.apply_mutation(id, Mutation::Edit(content));
    }

    pub fn apply_remote_delete(&mut self, id: CanonicalId, scope: DeleteScope) {
        self.apply_mutation(id, Mutation::Delete(scope));
    }

    pub fn apply_read_receipt(&mut self, id: CanonicalId) {
        self.apply_mutation(id, Mutation::ReadByPeer);
    }

    pub fn apply_remote_reaction(&mut self, id: CanonicalId, emoji: String, subject: SubjectId, added: bool) {
        self.apply_mutation(
            id,
            Mutation::Reaction {
                emoji,
                subject,
                added,
            },
        );
    }

    pub fn apply_thread_updated(&mut self, parent: CanonicalId, reply_count: u32) {
        self.apply_mutation(parent, Mutation::ReplyCount(reply_count));
    }

    fn apply_mutation(&mut self, id: CanonicalId, mutation: Mutation) {
        if let Some(entry) = find_confirmed(&mut self.timelines, &self.located, &id) {
            let conversation = entry.conversation.clone();
            if mutation.apply(entry) {
                self.events.emit(SyncEvent::TimelineChanged(conversation));
            }
            return;
        }
        tracing::debug!("Holding {:?} for unknown message {}", mutation, id);
        if self.buffer.hold(id.clone(), mutation) {
            self.scheduler
                .schedule_once(TimerKey::MutationExpiry(id), self.config.mutation_grace());
        }
    }

    pub fn on_mutation_expired(&mut self, id: &CanonicalId) {
        let dropped = self.buffer.expire(id);
        if dropped > 0 {
            tracing::debug!("Dropped {} mutations for {} which never arrived", dropped, id);
        }
    }

    /// Insert a history page with the same de-duplication as pushes.
    /// Returns how many entries were new.
    pub fn apply_history(&mut self, conversation: &ConversationKey, page: HistoryPage) -> usize {
        let mut inserted = 0;
        for message in page.messages {
            if let Some(local_id) = message.local_id.clone()
                && self.unconfirmed.contains_key(&local_id)
            {
                self.confirm(&local_id, message);
                continue;
            }
            if self.insert_confirmed(TimelineEntry::from(message)) {
                inserted += 1;
            }
        }
        if inserted > 0 {
            tracing::debug!(conversation = %conversation, inserted, "Applied history page");
            self.events
                .emit(SyncEvent::TimelineChanged(conversation.clone()));
        }
        inserted
    }

    // ========================================
    // Queries
    // ========================================

    pub fn timeline(&self, conversation: &ConversationKey) -> Vec<TimelineEntry> {
        self.timelines
            .get(conversation)
            .map(ConversationTimeline::snapshot)
            .unwrap_or_default()
    }

    pub fn entry(&self, id: &CanonicalId) -> Option<&TimelineEntry> {
        let conversation = self.located.get(id)?;
        self.timelines.get(conversation)?.get(id)
    }

    pub fn delivery_state(&self, local_id: &LocalId) -> Option<DeliveryState> {
        if let Some(conversation) = self.unconfirmed.get(local_id) {
            return self
                .timelines
                .get(conversation)?
                .unconfirmed(local_id)
                .map(TimelineEntry::delivery_state);
        }
        self.merged.get(local_id).map(|_| DeliveryState::Sent)
    }

    pub fn read_marker(&self, conversation: &ConversationKey) -> Option<&CanonicalId> {
        self.read_markers.get(conversation)
    }

    /// Cursor for the next history page of `conversation`.
    pub fn history_cursor(&self, conversation: &ConversationKey) -> Option<CanonicalId> {
        self.timelines
            .get(conversation)
            .and_then(ConversationTimeline::oldest)
            .cloned()
    }

    pub fn held_mutations(&self) -> usize {
        self.buffer.len()
    }
}
