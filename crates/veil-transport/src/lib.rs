//! # veil-transport
//!
//! Client transport for the Veil room chat service.
//!
//! - **Connector / Connection** - Transport-agnostic traits
//! - **WebSocket** - tokio-tungstenite connector (feature `websocket`)
//! - **Client** - Reconnecting state machine with heartbeat and backoff
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use veil_transport::{Client, ClientConfig, ClientEvent, WebSocketConnector};
//!
//! let connector = Arc::new(WebSocketConnector::to_url("ws://127.0.0.1:3001/ws"));
//! let (client, mut events) = Client::spawn(connector, ClientConfig::default());
//! client.connect()?;
//!
//! while let Some(event) = events.recv().await {
//!     // Decrypt and ack incoming messages
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use backoff::Backoff;
pub use client::{Client, ClientConfig, ClientEvent, ConnectionState, Trigger};
pub use traits::{Connection, Connector, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnector};
