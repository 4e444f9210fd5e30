//! Transport abstraction traits for Veil clients.
//!
//! A [`Connector`] opens connections; a [`Connection`] carries protocol
//! frames to and from the server. The reconnecting client is written
//! against these traits only.

use async_trait::async_trait;
use thiserror::Error;
use veil_protocol::{ClientFrame, ServerFrame};

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The client is not connected; nothing was sent.
    #[error("Not connected")]
    NotConnected,

    /// The connection closed abnormally.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The handshake failed.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] veil_protocol::ProtocolError),

    /// The client task has stopped.
    #[error("Client stopped")]
    Stopped,
}

/// Opens connections to a server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection, completing the handshake.
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Get the transport name (e.g., "websocket").
    fn name(&self) -> &'static str;
}

/// An open connection to a server.
#[async_trait]
pub trait Connection: Send {
    /// Receive the next frame.
    ///
    /// Returns `Ok(None)` only on a close with status 1000 and an error on any other close.
    async fn recv(&mut self) -> Result<Option<ServerFrame>, TransportError>;

    /// Send a frame.
    async fn send(&mut self, frame: &ClientFrame) -> Result<(), TransportError>;

    /// Close the connection cleanly.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}
