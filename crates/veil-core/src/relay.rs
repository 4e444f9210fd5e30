//! External relay adapter contract.
//!
//! Message payloads are parked on an external relay until every participant
//! has acknowledged them, then deleted. The relay may also deliver messages
//! inbound, which are routed into the room like any other message.

use async_trait::async_trait;
use thiserror::Error;

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The relay has no credentials or destination configured.
    #[error("Relay not configured")]
    NotConfigured,

    /// The relay could not be reached.
    #[error("Relay request failed: {0}")]
    Request(String),

    /// The relay refused the request.
    #[error("Relay rejected request: {0}")]
    Rejected(String),
}

/// Coordinates of a relayed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relayed {
    /// Message ID assigned by the relay.
    pub relay_msg_id: String,
    /// Where the message lives on the relay.
    pub location: String,
}

/// A message delivered by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRelayed {
    /// Target room.
    pub room_id: String,
    /// Opaque payload.
    pub payload: String,
    /// Message ID assigned by the relay.
    pub relay_msg_id: String,
    /// Where the message lives on the relay.
    pub location: String,
    /// Relay timestamp in milliseconds.
    pub timestamp: u64,
}

/// An external relay for message payloads.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Park a payload on the relay.
    async fn relay(&self, room_id: &str, payload: &str) -> Result<Relayed, RelayError>;

    /// Delete a relayed message. Returns `true` on success.
    async fn delete_relayed(&self, location: &str, relay_msg_id: &str) -> bool;
}
