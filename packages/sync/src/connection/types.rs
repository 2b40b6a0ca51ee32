//! Messages exchanged with the connection loop.

use tokio::sync::{mpsc, watch};

use crate::{
    domain::ConnectionState,
    infrastructure::dto::websocket::{InboundEvent, OutboundEvent},
};

/// Commands from consumers to the connection loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCommand {
    Emit(OutboundEvent),
    /// Reset the backoff counter and retry now if not connected.
    Reconnect,
    Disconnect,
}

/// Everything the connection loop reports back, in transport order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Inbound(InboundEvent),
    /// The credential was refused. The loop is parked until `reconnect()`.
    AuthenticationFailed(String),
    /// Reconnect attempts are exhausted. The loop is parked until `reconnect()`.
    PersistentFailure { attempts: u32 },
    /// A queued event was evicted by overflow while disconnected.
    OutboundDropped(OutboundEvent),
}

/// Cheap, cloneable access to the shared socket.
///
/// Consumers emit through the handle; they never own the socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        command_tx: mpsc::UnboundedSender<ConnectionCommand>,
        state_rx: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            command_tx,
            state_rx,
        }
    }

    /// Hand `event` to the connection loop. Never blocks; while disconnected
    /// durable events are queued and transient ones dropped.
    pub fn emit(&self, event: OutboundEvent) {
        let name = event.name();
        if self.command_tx.send(ConnectionCommand::Emit(event)).is_err() {
            tracing::debug!("Connection closed, dropping {}", name);
        }
    }

    pub fn reconnect(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Reconnect);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub(crate) fn disconnect(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Disconnect);
    }

    /// A handle wired to nothing but the returned ends, for component tests.
    #[cfg(test)]
    pub(crate) fn detached() -> (
        Self,
        mpsc::UnboundedReceiver<ConnectionCommand>,
        watch::Sender<ConnectionState>,
    ) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        (Self::new(command_tx, state_rx), command_rx, state_tx)
    }
}

/// Drain every event emitted so far through a detached handle.
#[cfg(test)]
pub(crate) fn drain_emitted(
    commands: &mut mpsc::UnboundedReceiver<ConnectionCommand>,
) -> Vec<OutboundEvent> {
    let mut events = Vec::new();
    while let Ok(command) = commands.try_recv() {
        if let ConnectionCommand::Emit(event) = command {
            events.push(event);
        }
    }
    events
}
