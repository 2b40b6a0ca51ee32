//! WebSocket event DTOs.
//!
//! Every frame is a JSON object `{"event": "<name>", "data": {...}}`. Field
//! names are camelCase. Presence broadcast traffic shares the socket under the
//! `presence:*` names.

use serde::{Deserialize, Serialize};

use crate::domain::{Attachment, PresenceStatus};

// ========================================
// Shared payloads
// ========================================

/// A message as pushed by the server (`message:new`, `message:sent`, history pages).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: String,
    pub conversation_key: String,
    pub sender_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Unix milliseconds
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub subject_id: String,
    pub status: PresenceStatus,
    pub last_activity_at: i64,
    #[serde(default)]
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRefPayload {
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditPayload {
    pub message_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletePayload {
    pub message_id: String,
    #[serde(default)]
    pub for_everyone: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub conversation_key: String,
    pub subject_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionPayload {
    pub message_id: String,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRefPayload {
    pub parent_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRefPayload {
    pub group_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRefPayload {
    pub subject_id: String,
}

// ========================================
// Outbound (client → server)
// ========================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub conversation_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub local_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadReplyPayload {
    pub parent_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub local_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMessagePayload {
    pub group_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub local_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupTypingPayload {
    pub group_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftPayload {
    pub conversation_key: String,
    pub content: String,
}

/// Events this client emits on the shared socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    #[serde(rename = "message:send")]
    SendMessage(SendMessagePayload),
    #[serde(rename = "message:edit")]
    EditMessage(EditPayload),
    #[serde(rename = "message:delete")]
    DeleteMessage(DeletePayload),
    #[serde(rename = "message:read")]
    MarkRead(MessageRefPayload),
    #[serde(rename = "typing:start")]
    TypingStart(TypingPayload),
    #[serde(rename = "typing:stop")]
    TypingStop(TypingPayload),
    #[serde(rename = "reaction:add")]
    AddReaction(ReactionPayload),
    #[serde(rename = "reaction:remove")]
    RemoveReaction(ReactionPayload),
    #[serde(rename = "thread:join")]
    JoinThread(ThreadRefPayload),
    #[serde(rename = "thread:leave")]
    LeaveThread(ThreadRefPayload),
    #[serde(rename = "thread:reply")]
    ThreadReply(ThreadReplyPayload),
    #[serde(rename = "group:join")]
    JoinGroup(GroupRefPayload),
    #[serde(rename = "group:message")]
    GroupMessage(GroupMessagePayload),
    #[serde(rename = "group:typing")]
    GroupTyping(GroupTypingPayload),
    #[serde(rename = "draft:save")]
    SaveDraft(DraftPayload),
    #[serde(rename = "presence:heartbeat")]
    PresenceHeartbeat,
    #[serde(rename = "presence:track")]
    PresenceTrack(PresencePayload),
    #[serde(rename = "presence:untrack")]
    PresenceUntrack(SubjectRefPayload),
}

impl OutboundEvent {
    /// Event name on the wire, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::SendMessage(_) => "message:send",
            OutboundEvent::EditMessage(_) => "message:edit",
            OutboundEvent::DeleteMessage(_) => "message:delete",
            OutboundEvent::MarkRead(_) => "message:read",
            OutboundEvent::TypingStart(_) => "typing:start",
            OutboundEvent::TypingStop(_) => "typing:stop",
            OutboundEvent::AddReaction(_) => "reaction:add",
            OutboundEvent::RemoveReaction(_) => "reaction:remove",
            OutboundEvent::JoinThread(_) => "thread:join",
            OutboundEvent::LeaveThread(_) => "thread:leave",
            OutboundEvent::ThreadReply(_) => "thread:reply",
            OutboundEvent::JoinGroup(_) => "group:join",
            OutboundEvent::GroupMessage(_) => "group:message",
            OutboundEvent::GroupTyping(_) => "group:typing",
            OutboundEvent::SaveDraft(_) => "draft:save",
            OutboundEvent::PresenceHeartbeat => "presence:heartbeat",
            OutboundEvent::PresenceTrack(_) => "presence:track",
            OutboundEvent::PresenceUntrack(_) => "presence:untrack",
        }
    }

    /// Transient events are dropped instead of queued while disconnected.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OutboundEvent::TypingStart(_)
                | OutboundEvent::TypingStop(_)
                | OutboundEvent::GroupTyping(_)
                | OutboundEvent::SaveDraft(_)
                | OutboundEvent::PresenceHeartbeat
        )
    }
}

// ========================================
// Inbound (server → client)
// ========================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRejectedPayload {
    pub local_id: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptPayload {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionChangedPayload {
    pub message_id: String,
    pub emoji: String,
    pub subject_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadReplyPushPayload {
    pub parent_id: String,
    #[serde(flatten)]
    pub message: MessagePayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadUpdatedPayload {
    pub parent_id: String,
    pub reply_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMessagePushPayload {
    pub group_id: String,
    #[serde(flatten)]
    pub message: MessagePayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupTypingPushPayload {
    pub group_id: String,
    pub subject_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMembershipPayload {
    pub group_id: String,
    pub subject_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSyncPayload {
    pub members: Vec<PresencePayload>,
}

/// Events pushed by the coordination service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum InboundEvent {
    #[serde(rename = "message:new")]
    NewMessage(MessagePayload),
    #[serde(rename = "message:sent")]
    MessageSent(MessagePayload),
    #[serde(rename = "message:error")]
    SendRejected(SendRejectedPayload),
    #[serde(rename = "message:edited")]
    MessageEdited(EditPayload),
    #[serde(rename = "message:deleted")]
    MessageDeleted(DeletePayload),
    #[serde(rename = "message:read")]
    MessageRead(ReadReceiptPayload),
    #[serde(rename = "typing")]
    Typing(TypingPayload),
    #[serde(rename = "typing:start")]
    TypingStart(TypingPayload),
    #[serde(rename = "typing:stop")]
    TypingStop(TypingPayload),
    #[serde(rename = "reaction:added")]
    ReactionAdded(ReactionChangedPayload),
    #[serde(rename = "reaction:removed")]
    ReactionRemoved(ReactionChangedPayload),
    #[serde(rename = "thread:reply")]
    ThreadReply(ThreadReplyPushPayload),
    #[serde(rename = "thread:updated")]
    ThreadUpdated(ThreadUpdatedPayload),
    #[serde(rename = "group:message")]
    GroupMessage(GroupMessagePushPayload),
    #[serde(rename = "group:typing")]
    GroupTyping(GroupTypingPushPayload),
    #[serde(rename = "group:joined")]
    GroupJoined(GroupMembershipPayload),
    #[serde(rename = "group:left")]
    GroupLeft(GroupMembershipPayload),
    #[serde(rename = "presence:sync")]
    PresenceSync(PresenceSyncPayload),
    #[serde(rename = "presence:join")]
    PresenceJoin(PresencePayload),
    #[serde(rename = "presence:leave")]
    PresenceLeave(SubjectRefPayload),
}
