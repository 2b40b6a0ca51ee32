//! End-to-end tests of a session against a real WebSocket server.

use std::{sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use kizuna_shared::time::SystemClock;
use kizuna_sync::{
    ChatSession, SessionHandle, SessionParts, SyncConfig, SyncEvent,
    domain::{
        ConnectionState, ConversationKey, DeliveryState, NoopPresenceStore, StaticCredential,
        SubjectId,
    },
    infrastructure::transport::WebSocketTransport,
};
use serde_json::{Value, json};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::{StatusCode, header::AUTHORIZATION},
        protocol::Message,
    },
};

const TOKEN: &str = "secret-token";
const WAIT: Duration = Duration::from_secs(5);

/// Accept one client. Every received frame is forwarded to the returned
/// channel, and every `message:send` is acknowledged with `message:sent`.
async fn spawn_server() -> (String, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut sequence = 0u64;
        let (stream, _) = listener.accept().await.unwrap();
        let check_token = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let authorized = request
                .headers()
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                == Some(format!("Bearer {}", TOKEN).as_str());
            if authorized {
                Ok(response)
            } else {
                let mut rejection = ErrorResponse::new(Some("unauthorized".to_string()));
                *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                Err(rejection)
            }
        };
        let Ok(mut socket) = accept_hdr_async(stream, check_token).await else {
            return;
        };

        while let Some(Ok(message)) = socket.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            if frame["event"] == "message:send" {
                sequence += 1;
                let data = &frame["data"];
                let ack = json!({
                    "event": "message:sent",
                    "data": {
                        "id": format!("S{}", sequence),
                        "conversationKey": data["conversationKey"],
                        "senderId": "alice",
                        "content": data["content"],
                        "createdAt": 1_700_000_000_000i64,
                        "sequence": sequence,
                        "localId": data["localId"],
                    }
                });
                socket
                    .send(Message::Text(ack.to_string().into()))
                    .await
                    .unwrap();
            }
            if frames_tx.send(frame).is_err() {
                break;
            }
        }
    });

    (url, frames_rx)
}

fn start_session(url: String, token: &str) -> SessionHandle {
    let mut config = SyncConfig::default();
    config.connection.url = url;
    config.connection.max_reconnect_attempts = 1;
    ChatSession::start(SessionParts {
        config,
        self_subject: SubjectId::new("alice").unwrap(),
        transport: Arc::new(WebSocketTransport::new()),
        credentials: Arc::new(StaticCredential::new(token)),
        history: None,
        presence_store: Arc::new(NoopPresenceStore),
        clock: Arc::new(SystemClock),
    })
    .unwrap()
}

async fn next_frame_named(frames: &mut mpsc::UnboundedReceiver<Value>, name: &str) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            let frame = frames.recv().await.unwrap();
            if frame["event"] == name {
                return frame;
            }
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_send_is_acknowledged_over_websocket() {
    // テスト項目: 実 WebSocket 上で送信が確認され、タイムラインが SENT 1 件になる
    // given (前提条件):
    let (url, mut frames) = spawn_server().await;
    let session = start_session(url, TOKEN);
    let track = next_frame_named(&mut frames, "presence:track").await;
    let conversation = ConversationKey::new("dm:alice:bob").unwrap();

    // when (操作):
    let mut handle = session
        .send(conversation.clone(), "hello", vec![])
        .await
        .unwrap();
    let send = next_frame_named(&mut frames, "message:send").await;
    let state = tokio::time::timeout(WAIT, handle.settled()).await.unwrap();

    // then (期待する結果):
    assert_eq!(track["data"]["subjectId"], "alice");
    assert_eq!(track["data"]["status"], "online");
    assert_eq!(send["data"]["content"], "hello");
    assert_eq!(send["data"]["localId"], handle.local_id().as_str());
    assert_eq!(state, DeliveryState::Sent);
    let timeline = session.timeline(conversation).await.unwrap();
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].canonical_id().map(|id| id.as_str()), Some("S1"));
    assert_eq!(session.connection_state(), ConnectionState::Connected);

    session.teardown().await.unwrap();
    next_frame_named(&mut frames, "presence:untrack").await;
}

#[tokio::test]
async fn test_rejected_credential_reports_authentication_failure() {
    // テスト項目: ハンドシェイクで 401 が返ると AuthenticationFailed が通知され、再接続しない
    // given (前提条件):
    let (url, _frames) = spawn_server().await;
    let session = start_session(url, "wrong-token");
    let mut events = session.subscribe();

    // when (操作):
    let failure = tokio::time::timeout(WAIT, async {
        loop {
            if let SyncEvent::AuthenticationFailed(reason) = events.recv().await.unwrap() {
                return reason;
            }
        }
    })
    .await
    .unwrap();

    // then (期待する結果):
    assert!(failure.contains("401"));
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    session.teardown().await.unwrap();
}
