//! TypingCoordinator
//!
//! ## 責務
//!
//! - ローカル入力ごとの `typing:start` をデバウンスし、入力が止まったら `typing:stop` を送る
//! - リモートの入力中状態を会話ごとに保持し、TTL で自動的に消す
//!
//! ## 設計ノート
//!
//! リモートの入力中表示は stop イベントが届かなくても TTL 経過で消えます。
//! TTL はインジケーターごとの `TypingExpiry` タイマーで管理し、start を受けるたびに張り直します。

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use kizuna_shared::time::Clock;

use crate::{
    config::TypingConfig,
    connection::ConnectionHandle,
    domain::{ConversationKey, ConversationKind, SubjectId, Timestamp},
    events::{EventSink, SyncEvent},
    infrastructure::dto::websocket::{GroupTypingPayload, OutboundEvent, TypingPayload},
    scheduler::{Scheduler, TimerKey},
};

pub struct TypingCoordinator {
    self_subject: SubjectId,
    config: TypingConfig,
    connection: ConnectionHandle,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
    events: EventSink,
    /// Conversations where we announced typing, with the time of the last start.
    last_start: HashMap<ConversationKey, Timestamp>,
    /// Remote typers per conversation and when their indicator expires.
    remote: HashMap<ConversationKey, BTreeMap<SubjectId, Timestamp>>,
}

impl TypingCoordinator {
    pub fn new(
        self_subject: SubjectId,
        config: TypingConfig,
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
            last_start: HashMap::new(),
            remote: HashMap::new(),
        }
    }

    fn now(&self) -> Timestamp {
        Timestamp::new(self.clock.now_millis())
    }

    fn typing_event(&self, conversation: &ConversationKey, is_typing: bool) -> OutboundEvent {
        match conversation.kind() {
            ConversationKind::Group(group_id) => OutboundEvent::GroupTyping(GroupTypingPayload {
                group_id: group_id.to_string(),
                is_typing,
            }),
            _ => {
                let payload = TypingPayload {
                    conversation_key: conversation.to_string(),
                    subject_id: self.self_subject.to_string(),
                    is_typing,
                };
                if is_typing {
                    OutboundEvent::TypingStart(payload)
                } else {
                    OutboundEvent::TypingStop(payload)
                }
            }
        }
    }

    /// Called on every local input change.
    pub fn notify_typing(&mut self, conversation: &ConversationKey) {
        let now = self.now();
        let due = self
            .last_start
            .get(conversation)
            .is_none_or(|last| now.millis_since(*last) >= self.config.debounce_ms);
        if due {
            self.connection
                .emit(self.typing_event(conversation, true));
            self.last_start.insert(conversation.clone(), now);
        }
        self.scheduler.schedule_once(
            TimerKey::TypingStop(conversation.clone()),
            Duration::from_millis(self.config.idle_stop_ms),
        );
    }

    /// Emit stop now, e.g. because the message was sent.
    pub fn stop_typing(&mut self, conversation: &ConversationKey) {
        self.scheduler
            .cancel(&TimerKey::TypingStop(conversation.clone()));
        if self.last_start.remove(conversation).is_some() {
            self.connection
                .emit(self.typing_event(conversation, false));
        }
    }

    pub fn on_idle_timeout(&mut self, conversation: &ConversationKey) {
        tracing::debug!(conversation = %conversation, "Local typing went idle");
        self.stop_typing(conversation);
    }

    /// Inbound `typing` / `group:typing`.
    pub fn apply_remote(&mut self, conversation: ConversationKey, subject: SubjectId, is_typing: bool) {
        if subject == self.self_subject {
            return;
        }
        let key = TimerKey::TypingExpiry(conversation.clone(), subject.clone());
        let changed = if is_typing {
            let expires_at = self.now().plus_millis(self.config.remote_ttl_ms);
            self.scheduler
                .schedule_once(key, Duration::from_millis(self.config.remote_ttl_ms));
            self.remote
                .entry(conversation.clone())
                .or_default()
                .insert(subject, expires_at)
                .is_none()
        } else {
            self.scheduler.cancel(&key);
            self.remove_remote(&conversation, &subject)
        };
        if changed {
            self.events.emit(SyncEvent::TypingChanged(conversation));
        }
    }

    pub fn on_expiry(&mut self, conversation: &ConversationKey, subject: &SubjectId) {
        if self.remove_remote(conversation, subject) {
            tracing::debug!(conversation = %conversation, subject = %subject, "Typing indicator expired");
            self.events
                .emit(SyncEvent::TypingChanged(conversation.clone()));
        }
    }

    fn remove_remote(&mut self, conversation: &ConversationKey, subject: &SubjectId) -> bool {
        let Some(typers) = self.remote.get_mut(conversation) else {
            return false;
        };
        let removed = typers.remove(subject).is_some();
        if typers.is_empty() {
            self.remote.remove(conversation);
        }
        removed
    }

    pub fn is_typing(&self, conversation: &ConversationKey, subject: &SubjectId) -> bool {
        let now = self.now();
        self.remote
            .get(conversation)
            .and_then(|typers| typers.get(subject))
            .is_some_and(|expires_at| *expires_at > now)
    }

    /// Current remote typers, sorted by subject id.
    pub fn typers(&self, conversation: &ConversationKey) -> Vec<SubjectId> {
        let now = self.now();
        self.remote
            .get(conversation)
            .map(|typers| {
                typers
                    .iter()
                    .filter(|(_, expires_at)| **expires_at > now)
                    .map(|(subject, _)| subject.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Announce stop everywhere we were typing and forget remote state.
    pub fn shutdown(&mut self) {
        let conversations: Vec<ConversationKey> = self.last_start.keys().cloned().collect();
        for conversation in conversations {
            self.stop_typing(&conversation);
        }
        for (conversation, typers) in self.remote.drain() {
            for subject in typers.into_keys() {
                self.scheduler
                    .cancel(&TimerKey::TypingExpiry(conversation.clone(), subject));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionCommand, drain_emitted};
    use crate::scheduler::TimerFired;
    use kizuna_shared::time::ManualClock;
    use tokio::sync::{broadcast, mpsc};

    struct Fixture {
        typing: TypingCoordinator,
        commands: mpsc::UnboundedReceiver<ConnectionCommand>,
        scheduler: Scheduler,
        fired: mpsc::UnboundedReceiver<TimerFired>,
        clock: Arc<ManualClock>,
        events: broadcast::Receiver<SyncEvent>,
    }

    fn fixture() -> Fixture {
        let (connection, commands, _state) = ConnectionHandle::detached();
        let (scheduler, fired) = Scheduler::new();
        let clock = Arc::new(ManualClock::new(10_000));
        let sink = EventSink::new(16);
        let events = sink.subscribe();
        let typing = TypingCoordinator::new(
            SubjectId::new("alice").unwrap(),
            TypingConfig::default(),
            connection,
            scheduler.clone(),
            clock.clone(),
            sink,
        );
        Fixture {
            typing,
            commands,
            scheduler,
            fired,
            clock,
            events,
        }
    }

    fn dm() -> ConversationKey {
        ConversationKey::new("dm:alice:bob").unwrap()
    }

    fn bob() -> SubjectId {
        SubjectId::new("bob").unwrap()
    }

    fn names(commands: &mut mpsc::UnboundedReceiver<ConnectionCommand>) -> Vec<&'static str> {
        drain_emitted(commands)
            .iter()
            .map(OutboundEvent::name)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_typing_is_debounced() {
        // テスト項目: 500ms 以内の連続入力では typing:start は 1 回だけ送られる
        // given (前提条件):
        let mut f = fixture();

        // when (操作):
        f.typing.notify_typing(&dm());
        f.clock.advance(200);
        f.typing.notify_typing(&dm());
        f.clock.advance(400);
        f.typing.notify_typing(&dm());

        // then (期待する結果):
        assert_eq!(names(&mut f.commands), vec!["typing:start", "typing:start"]);
        assert!(f.scheduler.is_scheduled(&TimerKey::TypingStop(dm())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_stop_fires_after_inactivity() {
        // テスト項目: 入力が 2 秒止まると typing:stop が送られる
        // given (前提条件):
        let mut f = fixture();
        f.typing.notify_typing(&dm());

        // when (操作):
        let fired = f.fired.recv().await.unwrap();
        let key = f.scheduler.accept(fired);
        if let Some(TimerKey::TypingStop(conversation)) = &key {
            f.typing.on_idle_timeout(conversation);
        }

        // then (期待する結果):
        assert_eq!(key, Some(TimerKey::TypingStop(dm())));
        assert_eq!(names(&mut f.commands), vec!["typing:start", "typing:stop"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_typing_without_start_sends_nothing() {
        // テスト項目: 入力中でない会話の stop_typing は何も送らない
        // given (前提条件):
        let mut f = fixture();

        // when (操作):
        f.typing.stop_typing(&dm());

        // then (期待する結果):
        assert!(names(&mut f.commands).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_conversation_emits_group_typing() {
        // テスト項目: グループ会話では group:typing が送られる
        // given (前提条件):
        let mut f = fixture();
        let group = ConversationKey::group("g1").unwrap();

        // when (操作):
        f.typing.notify_typing(&group);
        f.typing.stop_typing(&group);

        // then (期待する結果):
        let emitted = drain_emitted(&mut f.commands);
        assert!(matches!(
            emitted.as_slice(),
            [
                OutboundEvent::GroupTyping(GroupTypingPayload { is_typing: true, .. }),
                OutboundEvent::GroupTyping(GroupTypingPayload { is_typing: false, .. })
            ]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_typing_expires_without_stop() {
        // テスト項目: stop が届かなくても TTL 経過でリモートの入力中表示が消える
        // given (前提条件):
        let mut f = fixture();
        f.typing.apply_remote(dm(), bob(), true);
        let typing_before = f.typing.is_typing(&dm(), &bob());

        // when (操作):
        let fired = f.fired.recv().await.unwrap();
        f.clock.advance(5_000);
        if let Some(TimerKey::TypingExpiry(conversation, subject)) = f.scheduler.accept(fired) {
            f.typing.on_expiry(&conversation, &subject);
        }

        // then (期待する結果):
        assert!(typing_before);
        assert!(!f.typing.is_typing(&dm(), &bob()));
        assert!(f.typing.typers(&dm()).is_empty());
        assert_eq!(f.events.try_recv().unwrap(), SyncEvent::TypingChanged(dm()));
        assert_eq!(f.events.try_recv().unwrap(), SyncEvent::TypingChanged(dm()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_typing_answers_false_past_ttl_before_timer() {
        // テスト項目: タイマー処理前でも TTL を過ぎた入力中状態は false を返す
        // given (前提条件):
        let mut f = fixture();
        f.typing.apply_remote(dm(), bob(), true);

        // when (操作):
        f.clock.advance(5_001);

        // then (期待する結果):
        assert!(!f.typing.is_typing(&dm(), &bob()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_clears_and_own_subject_is_ignored() {
        // テスト項目: 明示的な stop で消え、自分自身の typing イベントは無視される
        // given (前提条件):
        let mut f = fixture();
        let alice = SubjectId::new("alice").unwrap();
        f.typing.apply_remote(dm(), bob(), true);

        // when (操作):
        f.typing.apply_remote(dm(), alice.clone(), true);
        let typers_with_self = f.typing.typers(&dm());
        f.typing.apply_remote(dm(), bob(), false);

        // then (期待する結果):
        assert_eq!(typers_with_self, vec![bob()]);
        assert!(!f.typing.is_typing(&dm(), &alice));
        assert!(!f.typing.is_typing(&dm(), &bob()));
        assert!(f.scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_local_typing_and_clears_timers() {
        // テスト項目: shutdown で入力中の会話に stop を送り、タイマーをすべて解除する
        // given (前提条件):
        let mut f = fixture();
        f.typing.notify_typing(&dm());
        f.typing.apply_remote(dm(), bob(), true);

        // when (操作):
        f.typing.shutdown();

        // then (期待する結果):
        assert_eq!(names(&mut f.commands), vec!["typing:start", "typing:stop"]);
        assert!(f.scheduler.is_empty());
        assert!(f.typing.typers(&dm()).is_empty());
    }
}
