//! WebSocket transport implementation.
//!
//! This module provides a WebSocket client connector using tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, warn};

use veil_protocol::{codec, ClientFrame, ServerFrame};

use crate::traits::{Connection, Connector, TransportError};

/// WebSocket connector configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Server URL, e.g. `ws://127.0.0.1:3001/ws`.
    pub url: String,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3001/ws".to_string(),
            max_message_size: codec::MAX_FRAME_SIZE,
        }
    }
}

/// WebSocket connector.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    /// Create a connector.
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    /// Create a connector for a URL with default limits.
    #[must_use]
    pub fn to_url(url: impl Into<String>) -> Self {
        Self::new(WebSocketConfig {
            url: url.into(),
            ..Default::default()
        })
    }

    /// Get the server URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, _response) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        debug!(url = %self.config.url, "WebSocket handshake completed");
        Ok(Box::new(WebSocketConnection::new(
            stream,
            self.config.max_message_size,
        )))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// A client WebSocket connection.
pub struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    is_open: AtomicBool,
    max_message_size: usize,
}

impl WebSocketConnection {
    fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>, max_message_size: usize) -> Self {
        Self {
            stream,
            is_open: AtomicBool::new(true),
            max_message_size,
        }
    }

    fn decode(&self, text: &str) -> Result<ServerFrame, TransportError> {
        if text.len() > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                text.len(),
                self.max_message_size
            );
            return Err(veil_protocol::ProtocolError::FrameTooLarge(text.len(), self.max_message_size).into());
        }
        Ok(codec::decode_server(text)?)
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn recv(&mut self) -> Result<Option<ServerFrame>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return self.decode(&text).map(Some);
                }
                Some(Ok(Message::Binary(data))) => {
                    let text = String::from_utf8(data)
                        .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
                    return self.decode(&text).map(Some);
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        warn!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    self.is_open.store(false, Ordering::SeqCst);
                    return match frame {
                        Some(f) if f.code == CloseCode::Normal => Ok(None),
                        None => {
                            debug!("Server closed connection without a status code");
                            Err(TransportError::ConnectionClosed("no status code".to_string()))
                        }
                        Some(f) => {
                            debug!(code = %f.code, reason = %f.reason, "Server closed connection");
                            Err(TransportError::ConnectionClosed(format!("{}: {}", f.code, f.reason)))
                        }
                    };
                }
                Some(Err(WsError::ConnectionClosed)) => {
                    self.is_open.store(false, Ordering::SeqCst);
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    self.is_open.store(false, Ordering::SeqCst);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    self.is_open.store(false, Ordering::SeqCst);
                    return Err(TransportError::ConnectionClosed("stream ended".to_string()));
                }
            }
        }
    }

    async fn send(&mut self, frame: &ClientFrame) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed("already closed".to_string()));
        }
        let text = codec::encode(frame)?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.stream
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "Client disconnect".into(),
            }))
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}
