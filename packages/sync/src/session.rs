//! ChatSession
//!
//! ## 責務
//!
//! - 全コンポーネントを生成し、1 つのイベントループに所有させる
//! - UI コマンド、接続イベント、タイマー発火、履歴ページをループ内で直列に処理する
//! - 受信イベントを種類ごとに担当コンポーネントへ振り分ける
//!
//! ## 設計ノート
//!
//! 状態を変更するのはループだけなので、コンポーネントは同期的でロックを持ちません。
//! `SessionHandle` はコマンドを送って oneshot で応答を受け取るだけの薄いハンドルです。
//! teardown は「受信の購読解除 → タイマー全解除 → presence の leave → ソケット切断」の順で行います。

use std::{ops::ControlFlow, sync::Arc, time::Duration};

use kizuna_shared::time::Clock;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};

use crate::{
    activity::{ActivitySignal, ActivityTracker, HeartbeatScheduler},
    config::SyncConfig,
    connection::{ConnectionEvent, ConnectionHandle, ConnectionManager},
    domain::{
        Attachment, CanonicalId, ConnectionState, ConversationKey, CredentialProvider,
        DeleteScope, HistoryPage, HistoryRepository, IncomingMessage, LocalId, PresenceRecord,
        PresenceStatus, PresenceStore, PresenceView, SubjectId, TimelineEntry,
    },
    error::{HistoryError, ProtocolError, SyncError},
    events::{EventSink, SyncEvent},
    infrastructure::{
        dto::websocket::{InboundEvent, OutboundEvent},
        transport::Transport,
    },
    messaging::{MessageSyncEngine, SendHandle},
    presence::{PersistenceOutbox, PresenceChannel},
    scheduler::{Scheduler, TimerFired, TimerKey},
    typing::TypingCoordinator,
};

const EVENT_CAPACITY: usize = 256;
const OUTBOX_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Collaborators a session is built from.
pub struct SessionParts {
    pub config: SyncConfig,
    pub self_subject: SubjectId,
    pub transport: Arc<dyn Transport>,
    pub credentials: Arc<dyn CredentialProvider>,
    /// `None` disables `load_history`.
    pub history: Option<Arc<dyn HistoryRepository>>,
    pub presence_store: Arc<dyn PresenceStore>,
    pub clock: Arc<dyn Clock>,
}

type Reply<T> = oneshot::Sender<T>;

enum SessionCommand {
    Send {
        conversation: ConversationKey,
        content: String,
        attachments: Vec<Attachment>,
        reply: Reply<SendHandle>,
    },
    Edit {
        id: CanonicalId,
        content: String,
        reply: Reply<Result<(), SyncError>>,
    },
    Delete {
        id: CanonicalId,
        for_everyone: bool,
        reply: Reply<Result<(), SyncError>>,
    },
    MarkRead(CanonicalId),
    Retry {
        local_id: LocalId,
        reply: Reply<Result<SendHandle, SyncError>>,
    },
    React {
        id: CanonicalId,
        emoji: String,
        added: bool,
        reply: Reply<Result<(), SyncError>>,
    },
    SaveDraft {
        conversation: ConversationKey,
        content: String,
    },
    JoinGroup(String),
    JoinThread(CanonicalId),
    LeaveThread(CanonicalId),
    NotifyTyping(ConversationKey),
    StopTyping(ConversationKey),
    RecordActivity(ActivitySignal),
    Timeline {
        conversation: ConversationKey,
        reply: Reply<Vec<TimelineEntry>>,
    },
    Presence {
        subject: SubjectId,
        reply: Reply<PresenceView>,
    },
    OnlineSubjects(Reply<Vec<SubjectId>>),
    Typers {
        conversation: ConversationKey,
        reply: Reply<Vec<SubjectId>>,
    },
    IsTyping {
        conversation: ConversationKey,
        subject: SubjectId,
        reply: Reply<bool>,
    },
    Reconnect,
    LoadHistory {
        conversation: ConversationKey,
        reply: Reply<Result<usize, SyncError>>,
    },
    Teardown(Reply<()>),
}

struct HistoryResult {
    conversation: ConversationKey,
    result: Result<HistoryPage, HistoryError>,
    reply: Reply<Result<usize, SyncError>>,
}

enum Step {
    Command(Option<SessionCommand>),
    Connection(ConnectionEvent),
    Timer(TimerFired),
    History(HistoryResult),
}

/// Event loop owning every sync component of one client session.
pub struct ChatSession {
    self_subject: SubjectId,
    config: SyncConfig,
    manager: ConnectionManager,
    connection: ConnectionHandle,
    scheduler: Scheduler,
    events: EventSink,
    presence: PresenceChannel,
    tracker: ActivityTracker,
    heartbeat: HeartbeatScheduler,
    engine: MessageSyncEngine,
    typing: TypingCoordinator,
    history: Option<Arc<dyn HistoryRepository>>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    timers: mpsc::UnboundedReceiver<TimerFired>,
    history_tx: mpsc::UnboundedSender<HistoryResult>,
    history_rx: mpsc::UnboundedReceiver<HistoryResult>,
    outbox_worker: JoinHandle<()>,
}

impl ChatSession {
    /// Build every component, connect, join presence and spawn the loop.
    pub fn start(parts: SessionParts) -> Result<SessionHandle, SyncError> {
        let SessionParts {
            config,
            self_subject,
            transport,
            credentials,
            history,
            presence_store,
            clock,
        } = parts;

        let events = EventSink::new(EVENT_CAPACITY);
        let (scheduler, timers) = Scheduler::new();
        let mut manager = ConnectionManager::new(config.connection.clone(), transport);
        let connection = manager.handle();
        let connection_events = manager.connect(credentials)?;

        let (outbox, outbox_worker) = PersistenceOutbox::spawn(
            presence_store,
            config.presence.persistence_outbox_capacity,
        );
        let mut presence = PresenceChannel::new(
            self_subject.clone(),
            connection.clone(),
            outbox,
            clock.clone(),
            events.clone(),
        );
        let tracker = ActivityTracker::new(clock.clone(), config.presence.activity_throttle_ms);
        let heartbeat = HeartbeatScheduler::new(scheduler.clone(), &config.presence);
        let engine = MessageSyncEngine::new(
            self_subject.clone(),
            config.messaging.clone(),
            connection.clone(),
            scheduler.clone(),
            clock.clone(),
            events.clone(),
        );
        let typing = TypingCoordinator::new(
            self_subject.clone(),
            config.typing.clone(),
            connection.clone(),
            scheduler.clone(),
            clock,
            events.clone(),
        );

        presence.join();
        heartbeat.start();

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (history_tx, history_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            commands: command_tx,
            events: events.clone(),
            state: connection.subscribe_state(),
        };

        tracing::info!(subject = %self_subject, "Starting chat session");
        let session = ChatSession {
            self_subject,
            config,
            manager,
            connection,
            scheduler,
            events,
            presence,
            tracker,
            heartbeat,
            engine,
            typing,
            history,
            commands,
            connection_events,
            timers,
            history_tx,
            history_rx,
            outbox_worker,
        };
        tokio::spawn(session.run());
        Ok(handle)
    }

    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                Some(event) = self.connection_events.recv() => Step::Connection(event),
                Some(fired) = self.timers.recv() => Step::Timer(fired),
                Some(result) = self.history_rx.recv() => Step::History(result),
            };

            match step {
                Step::Command(Some(command)) => {
                    if let ControlFlow::Break(reply) = self.handle_command(command) {
                        self.teardown().await;
                        let _ = reply.send(());
                        return;
                    }
                }
                Step::Command(None) => {
                    tracing::debug!("All session handles dropped");
                    self.teardown().await;
                    return;
                }
                Step::Connection(event) => self.on_connection_event(event),
                Step::Timer(fired) => {
                    if let Some(key) = self.scheduler.accept(fired) {
                        self.on_timer(key);
                    }
                }
                Step::History(result) => self.on_history(result),
            }
        }
    }

    /// Breaks with the reply channel when teardown was requested.
    fn handle_command(&mut self, command: SessionCommand) -> ControlFlow<Reply<()>> {
        match command {
            SessionCommand::Send {
                conversation,
                content,
                attachments,
                reply,
            } => {
                self.typing.stop_typing(&conversation);
                let _ = reply.send(self.engine.send(conversation, content, attachments));
            }
            SessionCommand::Edit { id, content, reply } => {
                let _ = reply.send(self.engine.edit(&id, content));
            }
            SessionCommand::Delete {
                id,
                for_everyone,
                reply,
            } => {
                let _ = reply.send(self.engine.delete(&id, for_everyone));
            }
            SessionCommand::MarkRead(id) => self.engine.mark_read(&id),
            SessionCommand::Retry { local_id, reply } => {
                let _ = reply.send(self.engine.retry(&local_id));
            }
            SessionCommand::React {
                id,
                emoji,
                added,
                reply,
            } => {
                let _ = reply.send(self.engine.react(&id, &emoji, added));
            }
            SessionCommand::SaveDraft {
                conversation,
                content,
            } => self.engine.save_draft(&conversation, content),
            SessionCommand::JoinGroup(group_id) => self.engine.join_group(&group_id),
            SessionCommand::JoinThread(parent) => self.engine.join_thread(&parent),
            SessionCommand::LeaveThread(parent) => self.engine.leave_thread(&parent),
            SessionCommand::NotifyTyping(conversation) => self.typing.notify_typing(&conversation),
            SessionCommand::StopTyping(conversation) => self.typing.stop_typing(&conversation),
            SessionCommand::RecordActivity(signal) => self.record_activity(signal),
            SessionCommand::Timeline {
                conversation,
                reply,
            } => {
                let _ = reply.send(self.engine.timeline(&conversation));
            }
            SessionCommand::Presence { subject, reply } => {
                let _ = reply.send(self.presence.get_status(&subject, None));
            }
            SessionCommand::OnlineSubjects(reply) => {
                let _ = reply.send(self.presence.online_subjects());
            }
            SessionCommand::Typers {
                conversation,
                reply,
            } => {
                let _ = reply.send(self.typing.typers(&conversation));
            }
            SessionCommand::IsTyping {
                conversation,
                subject,
                reply,
            } => {
                let _ = reply.send(self.typing.is_typing(&conversation, &subject));
            }
            SessionCommand::Reconnect => self.connection.reconnect(),
            SessionCommand::LoadHistory {
                conversation,
                reply,
            } => self.load_history(conversation, reply),
            SessionCommand::Teardown(reply) => return ControlFlow::Break(reply),
        }
        ControlFlow::Continue(())
    }

    /// Activity returns an AWAY subject to ONLINE at once instead of at the
    /// next heartbeat.
    fn record_activity(&mut self, signal: ActivitySignal) {
        if !self.tracker.record(signal) {
            return;
        }
        if self.presence.local_status() == Some(PresenceStatus::Away) {
            self.presence
                .update_status(PresenceStatus::Online, self.tracker.last_activity_at());
        }
    }

    fn on_heartbeat(&mut self) {
        let status = self.heartbeat.evaluate(&self.tracker);
        self.presence
            .update_status(status, self.tracker.last_activity_at());
        self.connection.emit(OutboundEvent::PresenceHeartbeat);
    }

    fn load_history(&self, conversation: ConversationKey, reply: Reply<Result<usize, SyncError>>) {
        let Some(repository) = self.history.clone() else {
            tracing::debug!("No history repository configured");
            let _ = reply.send(Ok(0));
            return;
        };
        let before = self.engine.history_cursor(&conversation);
        let limit = self.config.messaging.history_page_size;
        let results = self.history_tx.clone();
        tokio::spawn(async move {
            let result = repository.fetch_page(&conversation, before, limit).await;
            let _ = results.send(HistoryResult {
                conversation,
                result,
                reply,
            });
        });
    }

    fn on_history(&mut self, history: HistoryResult) {
        let HistoryResult {
            conversation,
            result,
            reply,
        } = history;
        let outcome = match result {
            Ok(page) => Ok(self.engine.apply_history(&conversation, page)),
            Err(e) => {
                tracing::warn!(conversation = %conversation, "Failed to load history: {}", e);
                Err(SyncError::from(e))
            }
        };
        let _ = reply.send(outcome);
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(state) => {
                self.engine.on_connection_state(state);
                self.presence.on_connection_state(state);
                self.events.emit(SyncEvent::ConnectionChanged(state));
            }
            ConnectionEvent::Inbound(event) => {
                if let Err(e) = self.route_inbound(event) {
                    tracing::warn!("Dropping inbound event: {}", e);
                }
            }
            ConnectionEvent::AuthenticationFailed(reason) => {
                self.events.emit(SyncEvent::AuthenticationFailed(reason));
            }
            ConnectionEvent::PersistentFailure { attempts } => {
                self.events.emit(SyncEvent::PersistentFailure { attempts });
            }
            ConnectionEvent::OutboundDropped(event) => {
                tracing::warn!("Outbound queue full, dropped {}", event.name());
            }
        }
    }

    fn on_timer(&mut self, key: TimerKey) {
        match key {
            TimerKey::Heartbeat => self.on_heartbeat(),
            TimerKey::AckTimeout(local_id) => self.engine.on_ack_timeout(&local_id),
            TimerKey::TypingStop(conversation) => self.typing.on_idle_timeout(&conversation),
            TimerKey::TypingExpiry(conversation, subject) => {
                self.typing.on_expiry(&conversation, &subject)
            }
            TimerKey::MutationExpiry(id) => self.engine.on_mutation_expired(&id),
        }
    }

    /// Hand an inbound event to the component that owns its state.
    fn route_inbound(&mut self, event: InboundEvent) -> Result<(), ProtocolError> {
        match event {
            InboundEvent::NewMessage(payload) => {
                self.engine.apply_new(IncomingMessage::try_from(payload)?);
            }
            InboundEvent::MessageSent(payload) => {
                self.engine.apply_sent(IncomingMessage::try_from(payload)?);
            }
            InboundEvent::SendRejected(payload) => {
                let local_id = LocalId::new(payload.local_id)?;
                self.engine.on_send_rejected(&local_id, &payload.reason);
            }
            InboundEvent::MessageEdited(payload) => {
                let id = CanonicalId::new(payload.message_id)?;
                self.engine.apply_remote_edit(id, payload.content);
            }
            InboundEvent::MessageDeleted(payload) => {
                let id = CanonicalId::new(payload.message_id)?;
                self.engine
                    .apply_remote_delete(id, DeleteScope::from_flag(payload.for_everyone));
            }
            InboundEvent::MessageRead(payload) => {
                if payload.reader_id.as_deref() == Some(self.self_subject.as_str()) {
                    return Ok(());
                }
                self.engine
                    .apply_read_receipt(CanonicalId::new(payload.message_id)?);
            }
            InboundEvent::Typing(payload) => {
                let is_typing = payload.is_typing;
                self.route_typing(payload.conversation_key, payload.subject_id, is_typing)?;
            }
            InboundEvent::TypingStart(payload) => {
                self.route_typing(payload.conversation_key, payload.subject_id, true)?;
            }
            InboundEvent::TypingStop(payload) => {
                self.route_typing(payload.conversation_key, payload.subject_id, false)?;
            }
            InboundEvent::ReactionAdded(payload) => {
                self.engine.apply_remote_reaction(
                    CanonicalId::new(payload.message_id)?,
                    payload.emoji,
                    SubjectId::new(payload.subject_id)?,
                    true,
                );
            }
            InboundEvent::ReactionRemoved(payload) => {
                self.engine.apply_remote_reaction(
                    CanonicalId::new(payload.message_id)?,
                    payload.emoji,
                    SubjectId::new(payload.subject_id)?,
                    false,
                );
            }
            InboundEvent::ThreadReply(payload) => {
                let parent = CanonicalId::new(payload.parent_id)?;
                let mut message = IncomingMessage::try_from(payload.message)?;
                message.conversation = ConversationKey::thread(&parent)?;
                self.engine.apply_new(message);
            }
            InboundEvent::ThreadUpdated(payload) => {
                let parent = CanonicalId::new(payload.parent_id)?;
                self.engine
                    .apply_thread_updated(parent.clone(), payload.reply_count);
                self.events.emit(SyncEvent::ThreadUpdated {
                    parent,
                    reply_count: payload.reply_count,
                });
            }
            InboundEvent::GroupMessage(payload) => {
                let mut message = IncomingMessage::try_from(payload.message)?;
                message.conversation = ConversationKey::group(&payload.group_id)?;
                self.engine.apply_new(message);
            }
            InboundEvent::GroupTyping(payload) => {
                let conversation = ConversationKey::group(&payload.group_id)?;
                let subject = SubjectId::new(payload.subject_id)?;
                self.typing
                    .apply_remote(conversation, subject, payload.is_typing);
            }
            InboundEvent::GroupJoined(payload) => {
                self.events.emit(SyncEvent::GroupMembership {
                    subject: SubjectId::new(payload.subject_id)?,
                    group_id: payload.group_id,
                    joined: true,
                });
            }
            InboundEvent::GroupLeft(payload) => {
                self.events.emit(SyncEvent::GroupMembership {
                    subject: SubjectId::new(payload.subject_id)?,
                    group_id: payload.group_id,
                    joined: false,
                });
            }
            InboundEvent::PresenceSync(payload) => {
                let members = payload
                    .members
                    .into_iter()
                    .map(PresenceRecord::try_from)
                    .collect::<Result<Vec<_>, _>>()?;
                self.presence.apply_sync(members);
            }
            InboundEvent::PresenceJoin(payload) => {
                self.presence.apply_join(PresenceRecord::try_from(payload)?);
            }
            InboundEvent::PresenceLeave(payload) => {
                self.presence
                    .apply_leave(&SubjectId::new(payload.subject_id)?);
            }
        }
        Ok(())
    }

    fn route_typing(
        &mut self,
        conversation: String,
        subject: String,
        is_typing: bool,
    ) -> Result<(), ProtocolError> {
        let conversation = ConversationKey::new(conversation)?;
        let subject = SubjectId::new(subject)?;
        self.typing.apply_remote(conversation, subject, is_typing);
        Ok(())
    }

    async fn teardown(mut self) {
        tracing::info!(subject = %self.self_subject, "Tearing down chat session");
        self.connection_events.close();
        self.scheduler.cancel_all();
        self.heartbeat.stop();
        self.typing.shutdown();
        self.presence.leave();
        self.manager.disconnect().await;

        // Dropping the channel closes the outbox so its worker drains and exits.
        drop(self.presence);
        if tokio::time::timeout(OUTBOX_DRAIN_TIMEOUT, self.outbox_worker)
            .await
            .is_err()
        {
            tracing::warn!("Presence outbox did not drain in time");
        }
        self.events
            .emit(SyncEvent::ConnectionChanged(ConnectionState::Disconnected));
    }
}

/// Cloneable entry point to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    events: EventSink,
    state: watch::Receiver<ConnectionState>,
}

impl SessionHandle {
    fn notify(&self, command: SessionCommand) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::SessionClosed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, SyncError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.notify(build(reply_tx))?;
        reply_rx.await.map_err(|_| SyncError::SessionClosed)
    }

    pub async fn send(
        &self,
        conversation: ConversationKey,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<SendHandle, SyncError> {
        let content = content.into();
        self.request(|reply| SessionCommand::Send {
            conversation,
            content,
            attachments,
            reply,
        })
        .await
    }

    pub async fn edit(&self, id: CanonicalId, content: impl Into<String>) -> Result<(), SyncError> {
        let content = content.into();
        self.request(|reply| SessionCommand::Edit { id, content, reply })
            .await?
    }

    pub async fn delete(&self, id: CanonicalId, for_everyone: bool) -> Result<(), SyncError> {
        self.request(|reply| SessionCommand::Delete {
            id,
            for_everyone,
            reply,
        })
        .await?
    }

    pub fn mark_read(&self, id: CanonicalId) -> Result<(), SyncError> {
        self.notify(SessionCommand::MarkRead(id))
    }

    pub async fn retry(&self, local_id: LocalId) -> Result<SendHandle, SyncError> {
        self.request(|reply| SessionCommand::Retry { local_id, reply })
            .await?
    }

    pub async fn react(&self, id: CanonicalId, emoji: impl Into<String>) -> Result<(), SyncError> {
        let emoji = emoji.into();
        self.request(|reply| SessionCommand::React {
            id,
            emoji,
            added: true,
            reply,
        })
        .await?
    }

    pub async fn unreact(&self, id: CanonicalId, emoji: impl Into<String>) -> Result<(), SyncError> {
        let emoji = emoji.into();
        self.request(|reply| SessionCommand::React {
            id,
            emoji,
            added: false,
            reply,
        })
        .await?
    }

    pub fn save_draft(&self, conversation: ConversationKey, content: impl Into<String>) -> Result<(), SyncError> {
        self.notify(SessionCommand::SaveDraft {
            conversation,
            content: content.into(),
        })
    }

    pub fn join_group(&self, group_id: impl Into<String>) -> Result<(), SyncError> {
        self.notify(SessionCommand::JoinGroup(group_id.into()))
    }

    pub fn join_thread(&self, parent: CanonicalId) -> Result<(), SyncError> {
        self.notify(SessionCommand::JoinThread(parent))
    }

    pub fn leave_thread(&self, parent: CanonicalId) -> Result<(), SyncError> {
        self.notify(SessionCommand::LeaveThread(parent))
    }

    pub fn notify_typing(&self, conversation: ConversationKey) -> Result<(), SyncError> {
        self.notify(SessionCommand::NotifyTyping(conversation))
    }

    pub fn stop_typing(&self, conversation: ConversationKey) -> Result<(), SyncError> {
        self.notify(SessionCommand::StopTyping(conversation))
    }

    pub fn record_activity(&self, signal: ActivitySignal) -> Result<(), SyncError> {
        self.notify(SessionCommand::RecordActivity(signal))
    }

    pub async fn timeline(&self, conversation: ConversationKey) -> Result<Vec<TimelineEntry>, SyncError> {
        self.request(|reply| SessionCommand::Timeline {
            conversation,
            reply,
        })
        .await
    }

    pub async fn presence(&self, subject: SubjectId) -> Result<PresenceView, SyncError> {
        self.request(|reply| SessionCommand::Presence { subject, reply })
            .await
    }

    pub async fn online_subjects(&self) -> Result<Vec<SubjectId>, SyncError> {
        self.request(SessionCommand::OnlineSubjects).await
    }

    pub async fn typers(&self, conversation: ConversationKey) -> Result<Vec<SubjectId>, SyncError> {
        self.request(|reply| SessionCommand::Typers {
            conversation,
            reply,
        })
        .await
    }

    pub async fn is_typing(
        &self,
        conversation: ConversationKey,
        subject: SubjectId,
    ) -> Result<bool, SyncError> {
        self.request(|reply| SessionCommand::IsTyping {
            conversation,
            subject,
            reply,
        })
        .await
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn reconnect(&self) -> Result<(), SyncError> {
        self.notify(SessionCommand::Reconnect)
    }

    /// Fetch the page before the oldest known entry. Returns how many
    /// entries were new.
    pub async fn load_history(&self, conversation: ConversationKey) -> Result<usize, SyncError> {
        self.request(|reply| SessionCommand::LoadHistory {
            conversation,
            reply,
        })
        .await?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Leave presence, close the socket and stop the loop.
    pub async fn teardown(&self) -> Result<(), SyncError> {
        self.request(SessionCommand::Teardown).await
    }
}
