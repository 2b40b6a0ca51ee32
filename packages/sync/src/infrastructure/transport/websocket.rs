//! `Transport` over tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Error as WsError,
        client::IntoClientRequest,
        http::{HeaderValue, StatusCode, header::AUTHORIZATION},
        protocol::Message,
    },
};

use super::{Transport, TransportLink};
use crate::error::TransportError;

/// Connects with `Authorization: Bearer <token>` on the upgrade request.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        url: &str,
        bearer_token: &str,
    ) -> Result<Box<dyn TransportLink>, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let authorization = HeaderValue::from_str(&format!("Bearer {}", bearer_token))
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, authorization);

        match connect_async(request).await {
            Ok((stream, response)) => {
                tracing::debug!("WebSocket handshake completed ({})", response.status());
                Ok(Box::new(WebSocketLink { stream }))
            }
            Err(WsError::Http(response)) => {
                let status = response.status();
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    Err(TransportError::Unauthorized(status.to_string()))
                } else {
                    Err(TransportError::ConnectFailed(format!(
                        "handshake rejected with {}",
                        status
                    )))
                }
            }
            Err(e) => Err(TransportError::ConnectFailed(e.to_string())),
        }
    }
}

struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportLink for WebSocketLink {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::Closed(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => {
                    tracing::debug!("Ignoring {} bytes of binary data", data.len());
                }
                Ok(Message::Close(frame)) => {
                    tracing::info!("Server closed the connection: {:?}", frame);
                    return None;
                }
                // Ping/pong are answered by tungstenite.
                Ok(_) => {}
                Err(e) => return Some(Err(TransportError::Closed(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("WebSocket close failed: {}", e);
        }
    }
}
