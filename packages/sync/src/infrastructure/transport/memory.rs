//! In-process `Transport` for tests and embedding.
//!
//! `MemoryTransport` hands every accepted link to a [`MemoryServer`], which
//! plays the server side through a [`MemoryPeer`]. Connect outcomes can be
//! scripted to reproduce refused handshakes and network failures.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Transport, TransportLink};
use crate::{
    error::TransportError,
    infrastructure::dto::websocket::{InboundEvent, OutboundEvent},
};

/// Result of one scripted connect attempt.
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    Accept,
    Reject(TransportError),
}

#[derive(Default)]
struct Shared {
    script: VecDeque<ConnectOutcome>,
    tokens: Vec<String>,
}

#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
    peers_tx: mpsc::UnboundedSender<MemoryPeer>,
}

pub struct MemoryServer {
    shared: Arc<Mutex<Shared>>,
    peers_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryServer) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        (
            Self {
                shared: shared.clone(),
                peers_tx,
            },
            MemoryServer { shared, peers_rx },
        )
    }

    /// Queue the outcome of a future connect attempt. Unscripted attempts
    /// are accepted.
    pub fn script(&self, outcome: ConnectOutcome) {
        lock(&self.shared).script.push_back(outcome);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        _url: &str,
        bearer_token: &str,
    ) -> Result<Box<dyn TransportLink>, TransportError> {
        let outcome = {
            let mut shared = lock(&self.shared);
            shared.tokens.push(bearer_token.to_string());
            shared.script.pop_front().unwrap_or(ConnectOutcome::Accept)
        };
        if let ConnectOutcome::Reject(error) = outcome {
            return Err(error);
        }

        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            to_client: Some(server_tx),
            from_client: server_rx,
        };
        self.peers_tx
            .send(peer)
            .map_err(|_| TransportError::ConnectFailed("memory server dropped".to_string()))?;

        Ok(Box::new(MemoryLink {
            to_server: client_tx,
            from_server: client_rx,
        }))
    }
}

impl MemoryServer {
    /// Wait for the next accepted link.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers_rx.recv().await
    }

    /// Number of connect attempts made so far, accepted or not.
    pub fn attempts(&self) -> usize {
        lock(&self.shared).tokens.len()
    }

    /// Bearer tokens presented, in attempt order.
    pub fn tokens(&self) -> Vec<String> {
        lock(&self.shared).tokens.clone()
    }
}

/// Server side of one accepted memory link.
pub struct MemoryPeer {
    to_client: Option<mpsc::UnboundedSender<String>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Push an event to the client. Returns `false` once the link is gone.
    pub fn push(&self, event: &InboundEvent) -> bool {
        match serde_json::to_string(event) {
            Ok(frame) => self.push_raw(frame),
            Err(_) => false,
        }
    }

    pub fn push_raw(&self, frame: impl Into<String>) -> bool {
        self.to_client
            .as_ref()
            .is_some_and(|tx| tx.send(frame.into()).is_ok())
    }

    /// Next event written by the client. `None` once the client closed.
    ///
    /// Frames that do not decode as an outbound event are skipped.
    pub async fn next_event(&mut self) -> Option<OutboundEvent> {
        loop {
            let frame = self.from_client.recv().await?;
            match serde_json::from_str(&frame) {
                Ok(event) => return Some(event),
                Err(e) => tracing::warn!("memory peer skipped frame {}: {}", frame, e),
            }
        }
    }

    /// Drop the link from the server side, as a network failure would.
    pub fn hang_up(&mut self) {
        self.to_client = None;
    }
}

struct MemoryLink {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl TransportLink for MemoryLink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.to_server
            .send(frame)
            .map_err(|_| TransportError::Closed("memory peer dropped".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.from_server.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::dto::websocket::TypingPayload;

    #[tokio::test]
    async fn test_scripted_rejection_then_accept() {
        // テスト項目: スクリプトされた拒否が返され、次の試行は受け入れられる
        // given (前提条件):
        let (transport, mut server) = MemoryTransport::new();
        transport.script(ConnectOutcome::Reject(TransportError::Unauthorized(
            "401".to_string(),
        )));

        // when (操作):
        let first = transport.connect("ws://memory", "t1").await;
        let second = transport.connect("ws://memory", "t2").await;

        // then (期待する結果):
        assert!(matches!(first, Err(TransportError::Unauthorized(_))));
        assert!(second.is_ok());
        assert!(server.accept().await.is_some());
        assert_eq!(server.tokens(), vec!["t1".to_string(), "t2".to_string()]);
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways_and_hang_up_closes() {
        // テスト項目: 双方向にフレームが流れ、サーバー側の切断でクライアントは None を受け取る
        // given (前提条件):
        let (transport, mut server) = MemoryTransport::new();
        let mut link = transport.connect("ws://memory", "token").await.unwrap();
        let mut peer = server.accept().await.unwrap();

        // when (操作):
        link.send(serde_json::to_string(&OutboundEvent::PresenceHeartbeat).unwrap())
            .await
            .unwrap();
        let typing = InboundEvent::Typing(TypingPayload {
            conversation_key: "c1".to_string(),
            subject_id: "bob".to_string(),
            is_typing: true,
        });
        assert!(peer.push(&typing));
        peer.hang_up();

        // then (期待する結果):
        assert_eq!(peer.next_event().await, Some(OutboundEvent::PresenceHeartbeat));
        let frame = link.recv().await.unwrap().unwrap();
        assert!(frame.contains("\"typing\""));
        assert!(link.recv().await.is_none());
    }
}
