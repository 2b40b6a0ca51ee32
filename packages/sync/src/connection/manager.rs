//! ConnectionManager と接続ループ
//!
//! ## 責務
//!
//! - 単一のソケットを所有し、接続・再接続・切断を管理する
//! - 切断中の送信イベントをキューに保持し、再接続後に元の順序で送る
//! - 状態遷移と受信イベントを `ConnectionEvent` としてセッションに流す
//!
//! ## 設計ノート
//!
//! ソケットを触るのは `ConnectionLoop` のタスクだけです。
//! 他のコンポーネントは `ConnectionHandle` 経由でコマンドを送るだけで、
//! ソケットの実装には依存しません。
//!
//! 認証失敗と再接続回数の上限到達ではループは終了せず「待機」に入り、
//! `reconnect()` か `disconnect()` を待ちます。待機中の送信もキューに積まれます。

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use super::{
    backoff::Backoff,
    policy::{Failure, is_fatal, should_attempt_reconnect},
    queue::OutboundQueue,
    types::{ConnectionCommand, ConnectionEvent, ConnectionHandle},
};
use crate::{
    config::ConnectionConfig,
    domain::{ConnectionState, CredentialProvider},
    error::{ConnectionError, ProtocolError, TransportError},
    infrastructure::{
        dto::websocket::{InboundEvent, OutboundEvent},
        transport::{Transport, TransportLink},
    },
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct LoopChannels {
    command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
    state_tx: watch::Sender<ConnectionState>,
}

/// Owner of the session's single socket.
pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    handle: ConnectionHandle,
    channels: Option<LoopChannels>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            transport,
            handle: ConnectionHandle::new(command_tx, state_rx),
            channels: Some(LoopChannels {
                command_rx,
                state_tx,
            }),
            task: None,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn emit(&self, event: OutboundEvent) {
        self.handle.emit(event);
    }

    pub fn reconnect(&self) {
        self.handle.reconnect();
    }

    /// Start the connection loop.
    ///
    /// `credentials` is asked for a token on every attempt, so a refreshed
    /// token is used on the next reconnect. Returns the stream of connection
    /// events, which ends when the loop stops.
    pub fn connect(
        &mut self,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<mpsc::UnboundedReceiver<ConnectionEvent>, ConnectionError> {
        let Some(channels) = self.channels.take() else {
            return Err(if self.task.is_some() {
                ConnectionError::AlreadyConnected
            } else {
                ConnectionError::Closed
            });
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connection_loop = ConnectionLoop {
            backoff: Backoff::from_config(&self.config),
            queue: OutboundQueue::new(self.config.outbound_queue_capacity),
            config: self.config.clone(),
            transport: self.transport.clone(),
            credentials,
            commands: channels.command_rx,
            state_tx: channels.state_tx,
            events: event_tx,
            attempts: 0,
        };
        self.task = Some(tokio::spawn(connection_loop.run()));
        Ok(event_rx)
    }

    /// Close the socket and stop the loop, including any backoff sleep.
    pub async fn disconnect(&mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };
        self.handle.disconnect();
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("Connection loop ended abnormally: {}", e),
            Err(_) => {
                tracing::warn!("Connection loop did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum Step {
    Continue,
    Reconnect,
    Shutdown,
}

enum Attempt {
    Linked(Box<dyn TransportLink>),
    Failed(Failure),
    Shutdown,
}

enum LinkEnd {
    Lost(Failure),
    Shutdown,
}

enum Resume {
    Retry,
    Shutdown,
}

struct ConnectionLoop {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    queue: OutboundQueue,
    backoff: Backoff,
    /// Reconnect attempts since the last successful connect.
    attempts: u32,
}

impl ConnectionLoop {
    async fn run(mut self) {
        self.set_state(ConnectionState::Connecting);

        loop {
            tracing::info!(
                "Connecting to {} (attempt {}/{})",
                self.config.url,
                self.attempts + 1,
                self.config.max_reconnect_attempts + 1
            );
            let failure = match self.attempt().await {
                Attempt::Linked(link) => {
                    self.attempts = 0;
                    self.set_state(ConnectionState::Connected);
                    tracing::info!("Connected to {}", self.config.url);
                    match self.serve(link).await {
                        LinkEnd::Lost(failure) => failure,
                        LinkEnd::Shutdown => break,
                    }
                }
                Attempt::Failed(failure) => failure,
                Attempt::Shutdown => break,
            };

            if is_fatal(&failure) {
                tracing::error!("Authentication failed: {}", failure);
                self.report(ConnectionEvent::AuthenticationFailed(failure.to_string()));
                self.set_state(ConnectionState::Disconnected);
                match self.park().await {
                    Resume::Retry => {
                        self.set_state(ConnectionState::Connecting);
                        continue;
                    }
                    Resume::Shutdown => break,
                }
            }

            if !should_attempt_reconnect(
                &failure,
                self.attempts,
                self.config.max_reconnect_attempts,
            ) {
                tracing::error!(
                    "Failed to reconnect after {} attempts: {}",
                    self.attempts,
                    failure
                );
                self.report(ConnectionEvent::PersistentFailure {
                    attempts: self.attempts,
                });
                self.set_state(ConnectionState::Disconnected);
                match self.park().await {
                    Resume::Retry => {
                        self.set_state(ConnectionState::Connecting);
                        continue;
                    }
                    Resume::Shutdown => break,
                }
            }

            self.attempts += 1;
            self.set_state(ConnectionState::Reconnecting);
            let delay = self.backoff.delay(self.attempts);
            tracing::warn!(
                "Connection lost: {}. Reconnecting in {}ms (attempt {}/{})",
                failure,
                delay.as_millis(),
                self.attempts,
                self.config.max_reconnect_attempts
            );
            if let Resume::Shutdown = self.sleep(delay).await {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        let dropped = self.queue.clear();
        if dropped > 0 {
            tracing::debug!("Discarded {} queued events on shutdown", dropped);
        }
        tracing::info!("Connection loop stopped");
    }

    async fn attempt(&mut self) -> Attempt {
        let opening = open_link(
            self.transport.clone(),
            self.credentials.clone(),
            self.config.url.clone(),
            self.config.connect_timeout(),
        );
        tokio::pin!(opening);

        loop {
            tokio::select! {
                result = &mut opening => {
                    return match result {
                        Ok(link) => Attempt::Linked(link),
                        Err(failure) => Attempt::Failed(failure),
                    };
                }
                command = self.commands.recv() => {
                    if let Step::Shutdown = self.on_idle_command(command) {
                        return Attempt::Shutdown;
                    }
                }
            }
        }
    }

    async fn serve(&mut self, mut link: Box<dyn TransportLink>) -> LinkEnd {
        if !self.queue.is_empty() {
            tracing::info!("Flushing {} queued events", self.queue.len());
        }
        while let Some(event) = self.queue.pop() {
            if let Err(e) = write(link.as_mut(), &event).await {
                self.queue.requeue(event);
                return LinkEnd::Lost(Failure::Transport(e));
            }
        }

        loop {
            tokio::select! {
                frame = link.recv() => match frame {
                    Some(Ok(text)) => self.dispatch(&text),
                    Some(Err(e)) => return LinkEnd::Lost(Failure::Transport(e)),
                    None => {
                        let closed = TransportError::Closed("closed by server".to_string());
                        return LinkEnd::Lost(Failure::Transport(closed));
                    }
                },
                command = self.commands.recv() => match command {
                    Some(ConnectionCommand::Emit(event)) => {
                        if let Err(e) = write(link.as_mut(), &event).await {
                            if !event.is_transient() {
                                self.queue.requeue(event);
                            }
                            return LinkEnd::Lost(Failure::Transport(e));
                        }
                    }
                    Some(ConnectionCommand::Reconnect) => {
                        self.attempts = 0;
                        tracing::debug!("Reconnect requested while connected, ignoring");
                    }
                    Some(ConnectionCommand::Disconnect) | None => {
                        link.close().await;
                        return LinkEnd::Shutdown;
                    }
                },
            }
        }
    }

    /// Backoff sleep, cut short by `reconnect()` or `disconnect()`.
    async fn sleep(&mut self, delay: Duration) -> Resume {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Resume::Retry,
                command = self.commands.recv() => match self.on_idle_command(command) {
                    Step::Continue => {}
                    Step::Reconnect => return Resume::Retry,
                    Step::Shutdown => return Resume::Shutdown,
                },
            }
        }
    }

    /// Wait for a manual reconnect after a fatal or persistent failure.
    async fn park(&mut self) -> Resume {
        loop {
            let command = self.commands.recv().await;
            match self.on_idle_command(command) {
                Step::Continue => {}
                Step::Reconnect => return Resume::Retry,
                Step::Shutdown => return Resume::Shutdown,
            }
        }
    }

    fn on_idle_command(&mut self, command: Option<ConnectionCommand>) -> Step {
        match command {
            Some(ConnectionCommand::Emit(event)) => {
                self.enqueue(event);
                Step::Continue
            }
            Some(ConnectionCommand::Reconnect) => {
                tracing::info!("Manual reconnect requested, resetting backoff");
                self.attempts = 0;
                Step::Reconnect
            }
            Some(ConnectionCommand::Disconnect) | None => Step::Shutdown,
        }
    }

    fn enqueue(&mut self, event: OutboundEvent) {
        if event.is_transient() {
            tracing::trace!("Dropping transient {} while disconnected", event.name());
            return;
        }
        if let Some(evicted) = self.queue.push(event) {
            tracing::warn!("Outbound queue full, dropped oldest {}", evicted.name());
            self.report(ConnectionEvent::OutboundDropped(evicted));
        }
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<InboundEvent>(text) {
            Ok(event) => self.report(ConnectionEvent::Inbound(event)),
            Err(e) => {
                let error = ProtocolError::from(e);
                tracing::warn!(%error, "Dropping inbound frame");
            }
        }
    }

    fn set_state(&mut self, next: ConnectionState) {
        let current = *self.state_tx.borrow();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            tracing::error!("Illegal connection transition {:?} -> {:?}", current, next);
            return;
        }
        self.state_tx.send_replace(next);
        tracing::debug!("Connection state {:?} -> {:?}", current, next);
        self.report(ConnectionEvent::StateChanged(next));
    }

    fn report(&self, event: ConnectionEvent) {
        // The session may already be gone during shutdown.
        let _ = self.events.send(event);
    }
}

async fn open_link(
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialProvider>,
    url: String,
    timeout: Duration,
) -> Result<Box<dyn TransportLink>, Failure> {
    let token = credentials
        .bearer_token()
        .await
        .map_err(Failure::Credential)?;
    match tokio::time::timeout(timeout, transport.connect(&url, &token)).await {
        Ok(result) => result.map_err(Failure::Transport),
        Err(_) => Err(Failure::Transport(TransportError::Timeout(
            timeout.as_millis() as u64,
        ))),
    }
}

async fn write(link: &mut dyn TransportLink, event: &OutboundEvent) -> Result<(), TransportError> {
    let frame = match serde_json::to_string(event) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!("Failed to serialize {}: {}", event.name(), e);
            return Ok(());
        }
    };
    tracing::trace!("Sending {}", event.name());
    link.send(frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{MockCredentialProvider, StaticCredential},
        error::CredentialError,
        infrastructure::{
            dto::websocket::{MessageRefPayload, TypingPayload},
            transport::{ConnectOutcome, MemoryTransport},
        },
    };

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            url: "ws://memory/ws".to_string(),
            max_reconnect_attempts: 3,
            ..ConnectionConfig::default()
        }
    }

    fn credentials() -> Arc<dyn CredentialProvider> {
        Arc::new(StaticCredential::new("token"))
    }

    fn read(id: &str) -> OutboundEvent {
        OutboundEvent::MarkRead(MessageRefPayload {
            message_id: id.to_string(),
        })
    }

    fn typing() -> OutboundEvent {
        OutboundEvent::TypingStart(TypingPayload {
            conversation_key: "c1".to_string(),
            subject_id: "alice".to_string(),
            is_typing: true,
        })
    }

    /// Next state change, skipping other events.
    async fn next_state(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionState {
        loop {
            match events.recv().await {
                Some(ConnectionEvent::StateChanged(state)) => return state,
                Some(_) => {}
                None => panic!("connection event stream ended"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_reports_states_and_emits() {
        // テスト項目: 接続で Connecting → Connected と遷移し、emit したイベントがサーバーに届く
        // given (前提条件):
        let (transport, mut server) = MemoryTransport::new();
        let mut manager = ConnectionManager::new(test_config(), Arc::new(transport));
        let mut events = manager.connect(credentials()).unwrap();

        // when (操作):
        let first = next_state(&mut events).await;
        let second = next_state(&mut events).await;
        let mut peer = server.accept().await.unwrap();
        manager.emit(read("m1"));

        // then (期待する結果):
        assert_eq!(first, ConnectionState::Connecting);
        assert_eq!(second, ConnectionState::Connected);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(peer.next_event().await, Some(read("m1")));
        assert_eq!(server.tokens(), vec!["token".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_twice_is_rejected() {
        // テスト項目: 接続ループの二重起動はエラーになる
        // given (前提条件):
        let (transport, _server) = MemoryTransport::new();
        let mut manager = ConnectionManager::new(test_config(), Arc::new(transport));
        let _events = manager.connect(credentials()).unwrap();

        // when (操作):
        let result = manager.connect(credentials());

        // then (期待する結果):
        assert_eq!(result.err(), Some(ConnectionError::AlreadyConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_events_flush_in_order_and_transient_are_dropped() {
        // テスト項目: 再接続中の送信はキューに積まれ、再接続後に元の順序で送られる（一時イベントは捨てられる）
        // given (前提条件):
        let (transport, mut server) = MemoryTransport::new();
        transport.script(ConnectOutcome::Reject(TransportError::ConnectFailed(
            "refused".to_string(),
        )));
        let mut manager = ConnectionManager::new(test_config(), Arc::new(transport));
        let mut events = manager.connect(credentials()).unwrap();
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Reconnecting);

        // when (操作):
        manager.emit(read("m1"));
        manager.emit(typing());
        manager.emit(read("m2"));
        let mut peer = server.accept().await.unwrap();

        // then (期待する結果):
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
        assert_eq!(peer.next_event().await, Some(read("m1")));
        assert_eq!(peer.next_event().await, Some(read("m2")));
        manager.emit(read("m3"));
        assert_eq!(peer.next_event().await, Some(read("m3")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_authentication_failure_parks_until_reconnect() {
        // テスト項目: 認証失敗は即座に通知され、自動再試行せず、手動 reconnect で再接続する
        // given (前提条件):
        let (transport, mut server) = MemoryTransport::new();
        transport.script(ConnectOutcome::Reject(TransportError::Unauthorized(
            "401 Unauthorized".to_string(),
        )));
        let mut manager = ConnectionManager::new(test_config(), Arc::new(transport));
        let mut events = manager.connect(credentials()).unwrap();

        // when (操作):
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        let failure = events.recv().await.unwrap();
        let parked = next_state(&mut events).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        let attempts_while_parked = server.attempts();
        manager.reconnect();

        // then (期待する結果):
        assert!(matches!(failure, ConnectionEvent::AuthenticationFailed(_)));
        assert_eq!(parked, ConnectionState::Disconnected);
        assert_eq!(attempts_while_parked, 1);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
        assert!(server.accept().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_error_is_authentication_failure() {
        // テスト項目: クレデンシャル取得に失敗した場合も認証失敗として扱われ、接続は試行されない
        // given (前提条件):
        let (transport, server) = MemoryTransport::new();
        let mut provider = MockCredentialProvider::new();
        provider
            .expect_bearer_token()
            .times(1)
            .returning(|| Err(CredentialError::Unavailable("expired".to_string())));
        let mut manager = ConnectionManager::new(test_config(), Arc::new(transport));
        let mut events = manager.connect(Arc::new(provider)).unwrap();

        // when (操作):
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        let failure = events.recv().await.unwrap();

        // then (期待する結果):
        assert!(matches!(failure, ConnectionEvent::AuthenticationFailed(_)));
        assert_eq!(next_state(&mut events).await, ConnectionState::Disconnected);
        assert_eq!(server.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_report_persistent_failure() {
        // テスト項目: 再接続回数が上限に達すると PersistentFailure が通知される
        // given (前提条件):
        let (transport, server) = MemoryTransport::new();
        for _ in 0..4 {
            transport.script(ConnectOutcome::Reject(TransportError::ConnectFailed(
                "refused".to_string(),
            )));
        }
        let mut manager = ConnectionManager::new(test_config(), Arc::new(transport));
        let mut events = manager.connect(credentials()).unwrap();

        // when (操作):
        let failure = loop {
            match events.recv().await.unwrap() {
                event @ ConnectionEvent::PersistentFailure { .. } => break event,
                _ => {}
            }
        };

        // then (期待する結果):
        assert_eq!(failure, ConnectionEvent::PersistentFailure { attempts: 3 });
        assert_eq!(server.attempts(), 4);
        assert_eq!(next_state(&mut events).await, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_during_backoff_resets_attempts() {
        // テスト項目: バックオフ待機中の手動 reconnect で試行回数がリセットされ、上限まで再び試行される
        // given (前提条件):
        let (transport, server) = MemoryTransport::new();
        for _ in 0..5 {
            transport.script(ConnectOutcome::Reject(TransportError::ConnectFailed(
                "refused".to_string(),
            )));
        }
        let mut manager = ConnectionManager::new(test_config(), Arc::new(transport));
        let mut events = manager.connect(credentials()).unwrap();
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Reconnecting);

        // when (操作):
        manager.reconnect();
        let failure = loop {
            match events.recv().await.unwrap() {
                event @ ConnectionEvent::PersistentFailure { .. } => break event,
                _ => {}
            }
        };

        // then (期待する結果):
        assert_eq!(failure, ConnectionEvent::PersistentFailure { attempts: 3 });
        assert_eq!(server.attempts(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_link_reconnects_and_delivers_inbound() {
        // テスト項目: 接続が切れると Reconnecting を経て再接続し、不正なフレームは捨てて後続を配送する
        // given (前提条件):
        let (transport, mut server) = MemoryTransport::new();
        let mut manager = ConnectionManager::new(test_config(), Arc::new(transport));
        let mut events = manager.connect(credentials()).unwrap();
        assert_eq!(next_state(&mut events).await, ConnectionState::Connecting);
        assert_eq!(next_state(&mut events).await, ConnectionState::Connected);
        let mut first = server.accept().await.unwrap();

        // when (操作):
        first.hang_up();
        let reconnecting = next_state(&mut events).await;
        let connected = next_state(&mut events).await;
        let second = server.accept().await.unwrap();
        second.push_raw("{not json");
        second.push_raw(r#"{"event":"presence:leave","data":{"subjectId":"bob"}}"#);

        // then (期待する結果):
        assert_eq!(reconnecting, ConnectionState::Reconnecting);
        assert_eq!(connected, ConnectionState::Connected);
        match events.recv().await.unwrap() {
            ConnectionEvent::Inbound(InboundEvent::PresenceLeave(payload)) => {
                assert_eq!(payload.subject_id, "bob");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_loop() {
        // テスト項目: disconnect で状態が Disconnected になり、イベントストリームが終了する
        // given (前提条件):
        let (transport, mut server) = MemoryTransport::new();
        let mut manager = ConnectionManager::new(test_config(), Arc::new(transport));
        let mut events = manager.connect(credentials()).unwrap();
        let mut peer = server.accept().await.unwrap();

        // when (操作):
        manager.disconnect().await;

        // then (期待する結果):
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        let mut states = Vec::new();
        while let Some(event) = events.recv().await {
            if let ConnectionEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(states.last(), Some(&ConnectionState::Disconnected));
        assert_eq!(peer.next_event().await, None);
        assert_eq!(
            manager.connect(credentials()).err(),
            Some(ConnectionError::Closed)
        );
    }
}
