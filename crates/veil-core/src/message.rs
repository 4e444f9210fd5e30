//! Message and connection identifiers.

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// A unique message identifier.
pub type MessageId = String;

/// A connection identifier, unique across instances.
pub type ConnectionId = String;

/// Generate a globally unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    format!("msg_{}", Uuid::new_v4())
}

/// Generate a globally unique connection ID.
#[must_use]
pub fn generate_connection_id() -> ConnectionId {
    format!("conn_{}", Uuid::new_v4().simple())
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
