//! Message formatting utilities for client display.

use kizuna_shared::time::timestamp_to_jst_rfc3339;
use kizuna_sync::domain::{
    CanonicalId, ConnectionState, ConversationKey, DeleteScope, DeliveryState, LocalId,
    PresenceStatus, PresenceView, SubjectId, TimelineEntry,
};

/// Message formatter for client display
pub struct MessageFormatter;

impl MessageFormatter {
    /// Format one timeline entry
    ///
    /// # Arguments
    ///
    /// * `entry` - The entry to render
    /// * `self_subject` - The current subject (to mark own messages as "me")
    ///
    /// # Returns
    ///
    /// A formatted block with sender, content, delivery state and timestamp
    pub fn format_entry(entry: &TimelineEntry, self_subject: &SubjectId) -> String {
        let me_suffix = if entry.sender == *self_subject { " (me)" } else { "" };
        let content = match entry.deleted {
            Some(DeleteScope::ForEveryone) => "(message deleted)".to_string(),
            Some(DeleteScope::ForMe) => "(deleted for you)".to_string(),
            None if entry.edited => format!("{} (edited)", entry.content),
            None => entry.content.clone(),
        };

        let mut output = format!("\n@{}{}: {}\n", entry.sender, me_suffix, content);
        if !entry.reactions.is_empty() {
            let reactions: Vec<String> = entry
                .reactions
                .iter()
                .map(|(emoji, subjects)| format!("{} {}", emoji, subjects.len()))
                .collect();
            output.push_str(&format!("  [{}]\n", reactions.join("  ")));
        }
        if entry.reply_count > 0 {
            output.push_str(&format!("  {} replies\n", entry.reply_count));
        }
        output.push_str(&format!(
            "  {} at {}\n",
            Self::format_delivery(entry),
            timestamp_to_jst_rfc3339(entry.created_at.value())
        ));
        output
    }

    fn format_delivery(entry: &TimelineEntry) -> String {
        match (entry.delivery_state(), entry.canonical_id(), entry.local_id()) {
            (DeliveryState::Sent, Some(id), _) if entry.read_by_peer => format!("#{} read", id),
            (DeliveryState::Sent, Some(id), _) => format!("#{} sent", id),
            (DeliveryState::Pending, _, Some(local_id)) => format!("sending ({})", local_id),
            (DeliveryState::Failed, _, Some(local_id)) => {
                format!("failed, /retry {} to resend", local_id)
            }
            (state, _, _) => format!("{:?}", state).to_lowercase(),
        }
    }

    /// Format a delivery failure notification
    pub fn format_delivery_failed(local_id: &LocalId, conversation: &ConversationKey) -> String {
        format!(
            "\n! message {} in {} could not be delivered (/retry {})\n",
            local_id, conversation, local_id
        )
    }

    /// Format a connection state change
    pub fn format_connection(state: ConnectionState) -> String {
        let label = match state {
            ConnectionState::Connecting => "connecting...",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "connection lost, reconnecting...",
            ConnectionState::Disconnected => "disconnected",
        };
        format!("\n* {}\n", label)
    }

    /// Format a presence change of one subject
    ///
    /// # Arguments
    ///
    /// * `subject` - The subject whose presence changed
    /// * `view` - Its current presence view
    ///
    /// # Returns
    ///
    /// A one-line presence notification, with the last-seen time when offline
    pub fn format_presence(subject: &SubjectId, view: &PresenceView) -> String {
        match (view.status, view.last_seen) {
            (PresenceStatus::Offline, Some(last_seen)) => format!(
                "\n- {} is offline (last seen {})\n",
                subject,
                timestamp_to_jst_rfc3339(last_seen.value())
            ),
            (status, _) => format!("\n+ {} is {}\n", subject, status),
        }
    }

    /// Format the list of subjects currently online or away
    pub fn format_who(subjects: &[SubjectId], self_subject: &SubjectId) -> String {
        let mut output = String::new();
        output.push_str("\n============================================================\n");
        output.push_str("Online:\n");
        if subjects.is_empty() {
            output.push_str("(Nobody)\n");
        } else {
            for subject in subjects {
                let me_suffix = if subject == self_subject { " (me)" } else { "" };
                output.push_str(&format!("{}{}\n", subject, me_suffix));
            }
        }
        output.push_str("============================================================\n");
        output
    }

    /// Format the typing indicator line, `None` when nobody is typing
    pub fn format_typers(typers: &[SubjectId]) -> Option<String> {
        match typers {
            [] => None,
            [one] => Some(format!("\n... {} is typing\n", one)),
            many => {
                let names: Vec<&str> = many.iter().map(SubjectId::as_str).collect();
                Some(format!("\n... {} are typing\n", names.join(", ")))
            }
        }
    }

    pub fn format_group_membership(group_id: &str, subject: &SubjectId, joined: bool) -> String {
        let verb = if joined { "joined" } else { "left" };
        format!("\n* {} {} group {}\n", subject, verb, group_id)
    }

    pub fn format_thread_updated(parent: &CanonicalId, reply_count: u32) -> String {
        format!("\n* thread on #{} now has {} replies\n", parent, reply_count)
    }

    pub fn format_history_loaded(count: usize) -> String {
        match count {
            0 => "\n(no older messages)\n".to_string(),
            n => format!("\n(loaded {} older messages)\n", n),
        }
    }

    pub fn format_error(message: &str) -> String {
        format!("\n! {}\n", message)
    }

    pub fn format_help() -> String {
        [
            "",
            "Commands:",
            "  <text>                 send a message",
            "  /edit <id> <text>      edit a message",
            "  /delete <id> [all]     delete for you, or for everyone with `all`",
            "  /read <id>             mark a message as read",
            "  /retry <localId>       resend a failed message",
            "  /react <id> <emoji>    react to a message",
            "  /history               load older messages",
            "  /who                   list who is online",
            "  /reconnect             reconnect now",
            "  /quit                  leave",
            "",
        ]
        .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kizuna_sync::domain::{IncomingMessage, Timestamp};

    fn alice() -> SubjectId {
        SubjectId::new("alice").unwrap()
    }

    fn confirmed(sender: &str) -> TimelineEntry {
        TimelineEntry::from(IncomingMessage {
            canonical_id: CanonicalId::new("S1").unwrap(),
            conversation: ConversationKey::new("dm:alice:bob").unwrap(),
            sender: SubjectId::new(sender).unwrap(),
            content: "Hello".to_string(),
            attachments: vec![],
            created_at: Timestamp::new(1_704_067_200_000),
            sequence: Some(1),
            local_id: None,
        })
    }

    #[test]
    fn test_format_own_sent_entry() {
        // テスト項目: 自分の送信済みメッセージに (me) と正規 ID が表示される
        // given (前提条件):
        let entry = confirmed("alice");

        // when (操作):
        let result = MessageFormatter::format_entry(&entry, &alice());

        // then (期待する結果):
        assert!(result.contains("@alice (me): Hello"));
        assert!(result.contains("#S1 sent at 2024-01-01T09:00:00+09:00"));
    }

    #[test]
    fn test_format_pending_and_failed_entry() {
        // テスト項目: 送信中はローカル ID、失敗時はリトライ方法が表示される
        // given (前提条件):
        let local_id = LocalId::new("local-1").unwrap();
        let mut entry = TimelineEntry::pending(
            local_id.clone(),
            ConversationKey::new("dm:alice:bob").unwrap(),
            alice(),
            "hi".to_string(),
            vec![],
            Timestamp::new(0),
        );

        // when (操作):
        let pending = MessageFormatter::format_entry(&entry, &alice());
        entry.identity = kizuna_sync::domain::EntryIdentity::Failed { local_id };
        let failed = MessageFormatter::format_entry(&entry, &alice());

        // then (期待する結果):
        assert!(pending.contains("sending (local-1)"));
        assert!(failed.contains("/retry local-1"));
    }

    #[test]
    fn test_format_deleted_and_edited_entry() {
        // テスト項目: 削除済み・編集済みのメッセージが区別して表示される
        // given (前提条件):
        let mut edited = confirmed("bob");
        edited.apply_edit("Hello!".to_string());
        let mut deleted = confirmed("bob");
        deleted.apply_delete(DeleteScope::ForEveryone);

        // when (操作):
        let edited = MessageFormatter::format_entry(&edited, &alice());
        let deleted = MessageFormatter::format_entry(&deleted, &alice());

        // then (期待する結果):
        assert!(edited.contains("@bob: Hello! (edited)"));
        assert!(deleted.contains("(message deleted)"));
        assert!(!deleted.contains("Hello"));
    }

    #[test]
    fn test_format_presence_offline_with_last_seen() {
        // テスト項目: オフラインのサブジェクトは最終確認時刻付きで表示される
        // given (前提条件):
        let view = PresenceView::offline(Some(Timestamp::new(1_704_067_200_000)));

        // when (操作):
        let result = MessageFormatter::format_presence(&SubjectId::new("bob").unwrap(), &view);

        // then (期待する結果):
        assert_eq!(
            result,
            "\n- bob is offline (last seen 2024-01-01T09:00:00+09:00)\n"
        );
    }

    #[test]
    fn test_format_who_marks_self() {
        // テスト項目: オンライン一覧で自分に (me) が付く
        // given (前提条件):
        let subjects = vec![alice(), SubjectId::new("bob").unwrap()];

        // when (操作):
        let result = MessageFormatter::format_who(&subjects, &alice());

        // then (期待する結果):
        assert!(result.contains("alice (me)\n"));
        assert!(result.contains("bob\n"));
    }

    #[test]
    fn test_format_who_empty() {
        // テスト項目: 誰もいない場合は (Nobody) と表示される
        // given (前提条件):
        let subjects: Vec<SubjectId> = vec![];

        // when (操作):
        let result = MessageFormatter::format_who(&subjects, &alice());

        // then (期待する結果):
        assert!(result.contains("(Nobody)"));
    }

    #[test]
    fn test_format_typers() {
        // テスト項目: 入力中のサブジェクト数に応じて表示が変わる
        // given (前提条件):
        let bob = SubjectId::new("bob").unwrap();
        let carol = SubjectId::new("carol").unwrap();

        // when (操作):
        let none = MessageFormatter::format_typers(&[]);
        let one = MessageFormatter::format_typers(std::slice::from_ref(&bob));
        let two = MessageFormatter::format_typers(&[bob, carol]);

        // then (期待する結果):
        assert_eq!(none, None);
        assert_eq!(one.as_deref(), Some("\n... bob is typing\n"));
        assert_eq!(two.as_deref(), Some("\n... bob, carol are typing\n"));
    }

    #[test]
    fn test_format_connection() {
        // テスト項目: 接続状態がラベルとして表示される
        // given (前提条件):
        let state = ConnectionState::Reconnecting;

        // when (操作):
        let result = MessageFormatter::format_connection(state);

        // then (期待する結果):
        assert_eq!(result, "\n* connection lost, reconnecting...\n");
    }
}
