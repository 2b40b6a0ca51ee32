//! Socket abstraction used by the connection manager.
//!
//! ## 責務
//!
//! - `Transport`: 認証情報を付けてソケットを開く
//! - `TransportLink`: 開いたソケット上でテキストフレームを送受信する
//!
//! ## 設計ノート
//!
//! 接続の状態遷移・再接続・キューイングは `connection` モジュールの責務であり、
//! ここでは 1 回分の接続だけを扱います。テストでは `MemoryTransport` を使い、
//! 実ソケットなしで接続断や認証失敗を再現します。

mod memory;
mod websocket;

use async_trait::async_trait;

use crate::error::TransportError;

pub use memory::{ConnectOutcome, MemoryPeer, MemoryServer, MemoryTransport};
pub use websocket::WebSocketTransport;

/// Opens authenticated links to the realtime endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link to `url`, presenting `bearer_token` in the handshake.
    ///
    /// A refused handshake returns [`TransportError::Unauthorized`].
    async fn connect(
        &self,
        url: &str,
        bearer_token: &str,
    ) -> Result<Box<dyn TransportLink>, TransportError>;
}

/// One open socket carrying JSON text frames.
#[async_trait]
pub trait TransportLink: Send {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// Next text frame. `None` once the peer has closed the link.
    ///
    /// Must be cancel-safe: it is polled inside `select!`.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self);
}
