//! Conversion logic between DTOs and domain entities.
//!
//! Inbound conversions are fallible: a frame with an invalid identifier is a
//! protocol error and is dropped as a whole.

use crate::domain::{
    CanonicalId, ConversationKey, ConversationKind, IncomingMessage, LocalId, PresenceRecord,
    SubjectId, Timestamp, TimelineEntry, ValueObjectError,
};
use crate::infrastructure::dto::websocket as dto;

// ========================================
// DTO → Domain Entity
// ========================================

impl TryFrom<dto::MessagePayload> for IncomingMessage {
    type Error = ValueObjectError;

    fn try_from(dto: dto::MessagePayload) -> Result<Self, Self::Error> {
        Ok(Self {
            canonical_id: CanonicalId::new(dto.id)?,
            conversation: ConversationKey::new(dto.conversation_key)?,
            sender: SubjectId::new(dto.sender_id)?,
            content: dto.content,
            attachments: dto.attachments,
            created_at: Timestamp::new(dto.created_at),
            sequence: dto.sequence,
            local_id: dto.local_id.map(LocalId::new).transpose()?,
        })
    }
}

impl TryFrom<dto::PresencePayload> for PresenceRecord {
    type Error = ValueObjectError;

    fn try_from(dto: dto::PresencePayload) -> Result<Self, Self::Error> {
        Ok(Self {
            subject_id: SubjectId::new(dto.subject_id)?,
            status: dto.status,
            last_activity_at: Timestamp::new(dto.last_activity_at),
            source_generation: dto.generation,
        })
    }
}

// ========================================
// Domain Entity → DTO
// ========================================

impl From<&PresenceRecord> for dto::PresencePayload {
    fn from(record: &PresenceRecord) -> Self {
        Self {
            subject_id: record.subject_id.as_str().to_string(),
            status: record.status,
            last_activity_at: record.last_activity_at.value(),
            generation: record.source_generation,
        }
    }
}

/// Build the (re)transmission of an unconfirmed entry, routed by conversation kind.
///
/// Returns `None` for confirmed entries, which are never retransmitted.
pub fn send_event(entry: &TimelineEntry) -> Option<dto::OutboundEvent> {
    if entry.canonical_id().is_some() {
        return None;
    }
    let local_id = entry.local_id()?.as_str().to_string();
    let content = entry.content.clone();
    let attachments = entry.attachments.clone();

    let event = match entry.conversation.kind() {
        ConversationKind::Direct => dto::OutboundEvent::SendMessage(dto::SendMessagePayload {
            conversation_key: entry.conversation.as_str().to_string(),
            recipient_id: None,
            content,
            attachments,
            local_id,
        }),
        ConversationKind::Group(group_id) => {
            dto::OutboundEvent::GroupMessage(dto::GroupMessagePayload {
                group_id: group_id.to_string(),
                content,
                attachments,
                local_id,
            })
        }
        ConversationKind::Thread(parent_id) => {
            dto::OutboundEvent::ThreadReply(dto::ThreadReplyPayload {
                parent_id: parent_id.to_string(),
                content,
                attachments,
                local_id,
            })
        }
    };
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PresenceStatus;

    fn message_dto() -> dto::MessagePayload {
        dto::MessagePayload {
            id: "S1".to_string(),
            conversation_key: "dm:alice:bob".to_string(),
            sender_id: "bob".to_string(),
            content: "Hello!".to_string(),
            attachments: vec![],
            created_at: 1000,
            sequence: Some(4),
            local_id: None,
        }
    }

    #[test]
    fn test_dto_message_to_domain() {
        // テスト項目: DTO の MessagePayload がドメインの IncomingMessage に変換される
        // given (前提条件):
        let dto_msg = message_dto();

        // when (操作):
        let domain_msg = IncomingMessage::try_from(dto_msg).unwrap();

        // then (期待する結果):
        assert_eq!(domain_msg.canonical_id, CanonicalId::new("S1").unwrap());
        assert_eq!(domain_msg.sender, SubjectId::new("bob").unwrap());
        assert_eq!(domain_msg.created_at, Timestamp::new(1000));
        assert_eq!(domain_msg.sequence, Some(4));
        assert!(domain_msg.local_id.is_none());
    }

    #[test]
    fn test_dto_message_with_empty_id_is_rejected() {
        // テスト項目: 空の ID を持つメッセージは変換に失敗する
        // given (前提条件):
        let dto_msg = dto::MessagePayload {
            id: String::new(),
            ..message_dto()
        };

        // when (操作):
        let result = IncomingMessage::try_from(dto_msg);

        // then (期待する結果):
        assert!(result.is_err());
    }

    #[test]
    fn test_dto_message_with_empty_local_id_is_rejected() {
        // テスト項目: 空の localId を持つ確認イベントは変換に失敗する
        // given (前提条件):
        let dto_msg = dto::MessagePayload {
            local_id: Some(String::new()),
            ..message_dto()
        };

        // when (操作):
        let result = IncomingMessage::try_from(dto_msg);

        // then (期待する結果):
        assert!(result.is_err());
    }

    #[test]
    fn test_presence_round_trip_through_dto() {
        // テスト項目: PresenceRecord と DTO の相互変換で値が保たれる
        // given (前提条件):
        let record = PresenceRecord {
            subject_id: SubjectId::new("U1").unwrap(),
            status: PresenceStatus::Away,
            last_activity_at: Timestamp::new(77),
            source_generation: 9,
        };

        // when (操作):
        let dto_record = dto::PresencePayload::from(&record);
        let back = PresenceRecord::try_from(dto_record).unwrap();

        // then (期待する結果):
        assert_eq!(back, record);
    }

    fn pending_in(conversation: &str) -> TimelineEntry {
        TimelineEntry::pending(
            LocalId::new("L1").unwrap(),
            ConversationKey::new(conversation).unwrap(),
            SubjectId::new("alice").unwrap(),
            "hi".to_string(),
            vec![],
            Timestamp::new(1),
        )
    }

    #[test]
    fn test_send_event_routes_by_conversation_kind() {
        // テスト項目: 会話の種別に応じて送信イベントが振り分けられる
        // given (前提条件):
        let direct = pending_in("dm:alice:bob");
        let group = pending_in("group:g1");
        let thread = pending_in("thread:S1");

        // when (操作):
        let events = (
            send_event(&direct).unwrap(),
            send_event(&group).unwrap(),
            send_event(&thread).unwrap(),
        );

        // then (期待する結果):
        assert!(matches!(events.0, dto::OutboundEvent::SendMessage(ref p) if p.local_id == "L1"));
        assert!(matches!(events.1, dto::OutboundEvent::GroupMessage(ref p) if p.group_id == "g1"));
        assert!(matches!(events.2, dto::OutboundEvent::ThreadReply(ref p) if p.parent_id == "S1"));
    }

    #[test]
    fn test_send_event_not_built_for_confirmed_entries() {
        // テスト項目: 確定済みのエントリからは再送イベントを作らない
        // given (前提条件):
        let confirmed: TimelineEntry = IncomingMessage::try_from(message_dto()).unwrap().into();

        // when (操作):
        let event = send_event(&confirmed);

        // then (期待する結果):
        assert!(event.is_none());
    }
}
