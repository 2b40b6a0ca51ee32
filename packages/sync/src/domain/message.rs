//! Message domain model: timeline entries and their delivery state machine.
//!
//! An entry goes through `Pending(local id) -> Confirmed(canonical id)`. A
//! pending entry that is never acknowledged becomes `Failed` and can be put
//! back to `Pending` by a manual retry.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
};

use serde::{Deserialize, Serialize};

use super::{CanonicalId, ConversationKey, LocalId, SubjectId, Timestamp};

/// A file or media reference attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Delivery state as seen by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryState {
    Pending,
    Sent,
    Failed,
}

/// Identity of a timeline entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum EntryIdentity {
    /// Sent or queued, not yet acknowledged. `attempts` counts transmissions.
    Pending { local_id: LocalId, attempts: u8 },
    /// Gave up after the automatic retry, or rejected by the server.
    Failed { local_id: LocalId },
    /// Acknowledged or received from the server.
    Confirmed {
        canonical_id: CanonicalId,
        local_id: Option<LocalId>,
    },
}

impl EntryIdentity {
    pub fn delivery_state(&self) -> DeliveryState {
        match self {
            EntryIdentity::Pending { .. } => DeliveryState::Pending,
            EntryIdentity::Failed { .. } => DeliveryState::Failed,
            EntryIdentity::Confirmed { .. } => DeliveryState::Sent,
        }
    }

    pub fn canonical_id(&self) -> Option<&CanonicalId> {
        match self {
            EntryIdentity::Confirmed { canonical_id, .. } => Some(canonical_id),
            _ => None,
        }
    }

    pub fn local_id(&self) -> Option<&LocalId> {
        match self {
            EntryIdentity::Pending { local_id, .. } | EntryIdentity::Failed { local_id } => {
                Some(local_id)
            }
            EntryIdentity::Confirmed { local_id, .. } => local_id.as_ref(),
        }
    }
}

/// Who a deletion applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeleteScope {
    ForMe,
    ForEveryone,
}

impl DeleteScope {
    pub fn from_flag(for_everyone: bool) -> Self {
        if for_everyone {
            DeleteScope::ForEveryone
        } else {
            DeleteScope::ForMe
        }
    }
}

/// A message as delivered by the server (push or history page).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub canonical_id: CanonicalId,
    pub conversation: ConversationKey,
    pub sender: SubjectId,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub created_at: Timestamp,
    pub sequence: Option<u64>,
    /// Echoed local id when the message originated from this client.
    pub local_id: Option<LocalId>,
}

/// Server ordering of a confirmed entry.
///
/// Lexicographic on `(sequence, created_at, canonical id)`. Entries without a
/// sequence sort before sequenced ones, which keeps the order total when a
/// conversation mixes both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderKey<'a> {
    pub sequence: Option<u64>,
    pub created_at: Timestamp,
    pub canonical_id: &'a CanonicalId,
}

impl PartialOrd for OrderKey<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderKey<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sequence
            .cmp(&other.sequence)
            .then(self.created_at.cmp(&other.created_at))
            .then_with(|| self.canonical_id.cmp(other.canonical_id))
    }
}

/// One logical message in a conversation timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub identity: EntryIdentity,
    pub conversation: ConversationKey,
    pub sender: SubjectId,
    pub content: String,
    pub attachments: Vec<Attachment>,
    /// Local submission time while pending, server time once confirmed.
    pub created_at: Timestamp,
    pub sequence: Option<u64>,
    pub edited: bool,
    pub deleted: Option<DeleteScope>,
    pub read_by_peer: bool,
    pub reactions: BTreeMap<String, BTreeSet<SubjectId>>,
    pub reply_count: u32,
}

impl TimelineEntry {
    /// Optimistic local echo of a send.
    pub fn pending(
        local_id: LocalId,
        conversation: ConversationKey,
        sender: SubjectId,
        content: String,
        attachments: Vec<Attachment>,
        now: Timestamp,
    ) -> Self {
        Self {
            identity: EntryIdentity::Pending {
                local_id,
                attempts: 1,
            },
            conversation,
            sender,
            content,
            attachments,
            created_at: now,
            sequence: None,
            edited: false,
            deleted: None,
            read_by_peer: false,
            reactions: BTreeMap::new(),
            reply_count: 0,
        }
    }

    pub fn delivery_state(&self) -> DeliveryState {
        self.identity.delivery_state()
    }

    pub fn canonical_id(&self) -> Option<&CanonicalId> {
        self.identity.canonical_id()
    }

    pub fn local_id(&self) -> Option<&LocalId> {
        self.identity.local_id()
    }

    pub fn order_key(&self) -> Option<OrderKey<'_>> {
        self.canonical_id().map(|canonical_id| OrderKey {
            sequence: self.sequence,
            created_at: self.created_at,
            canonical_id,
        })
    }

    /// Second phase of the send: take the server identity and ordering.
    ///
    /// Content is taken from the server so a server-side rewrite wins.
    pub fn confirm(&mut self, message: IncomingMessage) {
        let local_id = self.local_id().cloned().or(message.local_id);
        self.identity = EntryIdentity::Confirmed {
            canonical_id: message.canonical_id,
            local_id,
        };
        self.content = message.content;
        self.attachments = message.attachments;
        self.created_at = message.created_at;
        self.sequence = message.sequence;
    }

    pub fn apply_edit(&mut self, content: String) {
        if self.deleted == Some(DeleteScope::ForEveryone) {
            return;
        }
        self.content = content;
        self.edited = true;
    }

    pub fn apply_delete(&mut self, scope: DeleteScope) {
        if scope == DeleteScope::ForEveryone {
            self.content.clear();
            self.attachments.clear();
            self.reactions.clear();
        }
        // "for everyone" is never downgraded by a later "for me".
        if self.deleted != Some(DeleteScope::ForEveryone) {
            self.deleted = Some(scope);
        }
    }

    /// Returns whether the reaction set changed.
    pub fn apply_reaction(&mut self, emoji: &str, subject: &SubjectId, added: bool) -> bool {
        if added {
            self.reactions
                .entry(emoji.to_string())
                .or_default()
                .insert(subject.clone())
        } else {
            let Some(subjects) = self.reactions.get_mut(emoji) else {
                return false;
            };
            let removed = subjects.remove(subject);
            if subjects.is_empty() {
                self.reactions.remove(emoji);
            }
            removed
        }
    }
}

impl From<IncomingMessage> for TimelineEntry {
    fn from(message: IncomingMessage) -> Self {
        Self {
            identity: EntryIdentity::Confirmed {
                canonical_id: message.canonical_id,
                local_id: message.local_id,
            },
            conversation: message.conversation,
            sender: message.sender,
            content: message.content,
            attachments: message.attachments,
            created_at: message.created_at,
            sequence: message.sequence,
            edited: false,
            deleted: None,
            read_by_peer: false,
            reactions: BTreeMap::new(),
            reply_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incoming(id: &str, sequence: Option<u64>, created_at: i64) -> IncomingMessage {
        IncomingMessage {
            canonical_id: CanonicalId::new(id).unwrap(),
            conversation: ConversationKey::new("dm:alice:bob").unwrap(),
            sender: SubjectId::new("bob").unwrap(),
            content: format!("message {id}"),
            attachments: vec![],
            created_at: Timestamp::new(created_at),
            sequence,
            local_id: None,
        }
    }

    #[test]
    fn test_confirm_keeps_local_id_and_takes_server_order() {
        // テスト項目: 確定時にローカル ID を保持したままサーバーの ID と順序を取り込む
        // given (前提条件):
        let local_id = LocalId::new("L1").unwrap();
        let mut entry = TimelineEntry::pending(
            local_id.clone(),
            ConversationKey::new("dm:alice:bob").unwrap(),
            SubjectId::new("alice").unwrap(),
            "hi".to_string(),
            vec![],
            Timestamp::new(100),
        );

        // when (操作):
        entry.confirm(incoming("S1", Some(7), 250));

        // then (期待する結果):
        assert_eq!(entry.delivery_state(), DeliveryState::Sent);
        assert_eq!(entry.canonical_id().unwrap().as_str(), "S1");
        assert_eq!(entry.local_id(), Some(&local_id));
        assert_eq!(entry.sequence, Some(7));
        assert_eq!(entry.created_at, Timestamp::new(250));
    }

    #[test]
    fn test_order_key_prefers_sequence_then_time_then_id() {
        // テスト項目: 順序キーはシーケンス → 時刻 → ID の順で比較される
        // given (前提条件):
        let a: TimelineEntry = incoming("b", Some(1), 900).into();
        let b: TimelineEntry = incoming("a", Some(2), 100).into();
        let c: TimelineEntry = incoming("a", None, 500).into();
        let d: TimelineEntry = incoming("b", None, 500).into();

        // when (操作):
        let (ka, kb, kc, kd) = (
            a.order_key().unwrap(),
            b.order_key().unwrap(),
            c.order_key().unwrap(),
            d.order_key().unwrap(),
        );

        // then (期待する結果):
        assert!(ka < kb);
        assert!(kc < kd);
        assert!(kd < ka);
    }

    #[test]
    fn test_pending_entry_has_no_order_key() {
        // テスト項目: 未確定のエントリには順序キーがない
        // given (前提条件):
        let entry = TimelineEntry::pending(
            LocalId::new("L1").unwrap(),
            ConversationKey::new("dm").unwrap(),
            SubjectId::new("alice").unwrap(),
            "hi".to_string(),
            vec![],
            Timestamp::new(1),
        );

        // when (操作):
        let key = entry.order_key();

        // then (期待する結果):
        assert!(key.is_none());
    }

    #[test]
    fn test_delete_for_everyone_is_not_downgraded() {
        // テスト項目: 全員向け削除の後に自分のみの削除が来ても降格しない
        // given (前提条件):
        let mut entry: TimelineEntry = incoming("S1", None, 1).into();

        // when (操作):
        entry.apply_delete(DeleteScope::ForEveryone);
        entry.apply_delete(DeleteScope::ForMe);

        // then (期待する結果):
        assert_eq!(entry.deleted, Some(DeleteScope::ForEveryone));
        assert!(entry.content.is_empty());
    }

    #[test]
    fn test_edit_after_delete_for_everyone_is_ignored() {
        // テスト項目: 全員向けに削除されたメッセージへの編集は無視される
        // given (前提条件):
        let mut entry: TimelineEntry = incoming("S1", None, 1).into();
        entry.apply_delete(DeleteScope::ForEveryone);

        // when (操作):
        entry.apply_edit("resurrected".to_string());

        // then (期待する結果):
        assert!(entry.content.is_empty());
        assert!(!entry.edited);
    }

    #[test]
    fn test_reactions_are_idempotent_per_subject() {
        // テスト項目: 同じ主体の同じリアクションは一度だけ数えられ、削除で空になる
        // given (前提条件):
        let mut entry: TimelineEntry = incoming("S1", None, 1).into();
        let bob = SubjectId::new("bob").unwrap();

        // when (操作):
        let first = entry.apply_reaction("👍", &bob, true);
        let second = entry.apply_reaction("👍", &bob, true);
        let removed = entry.apply_reaction("👍", &bob, false);

        // then (期待する結果):
        assert!(first);
        assert!(!second);
        assert!(removed);
        assert!(entry.reactions.is_empty());
    }
}
