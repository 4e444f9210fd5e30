//! Envelopes exchanged between server instances over the shared pub/sub
//! channel of a room.

use serde::{Deserialize, Serialize};

use crate::frames::ServerFrame;

/// Sender token for messages that arrived through the external relay.
///
/// No participant may hold this identity, so relay messages reach every
/// subscribed connection.
pub const EXTERNAL_SENDER: &str = "external";

/// Kind of event carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Message,
    UserJoined,
    UserLeft,
}

/// A room event published to the shared channel `room:{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Room the event belongs to.
    pub room: String,
    /// Message ID, for message events.
    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Opaque payload, for message events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Subject identity, for presence events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Relay timestamp in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Token of the author; never delivered back to a connection holding it.
    pub sender: String,
}

impl Envelope {
    /// Create a message envelope.
    #[must_use]
    pub fn message(
        room: impl Into<String>,
        message_id: impl Into<String>,
        payload: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Message,
            room: room.into(),
            message_id: Some(message_id.into()),
            payload: Some(payload.into()),
            identity: None,
            timestamp: None,
            sender: sender.into(),
        }
    }

    /// Create a `user_joined` envelope. The joiner is the sender.
    #[must_use]
    pub fn user_joined(room: impl Into<String>, identity: impl Into<String>) -> Self {
        let identity = identity.into();
        Self {
            kind: EnvelopeKind::UserJoined,
            room: room.into(),
            message_id: None,
            payload: None,
            identity: Some(identity.clone()),
            timestamp: None,
            sender: identity,
        }
    }

    /// Create a `user_left` envelope. The leaver is the sender.
    #[must_use]
    pub fn user_left(room: impl Into<String>, identity: impl Into<String>) -> Self {
        let identity = identity.into();
        Self {
            kind: EnvelopeKind::UserLeft,
            room: room.into(),
            message_id: None,
            payload: None,
            identity: Some(identity.clone()),
            timestamp: None,
            sender: identity,
        }
    }

    /// Attach a relay timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Whether this envelope came from the external relay.
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.sender == EXTERNAL_SENDER
    }

    /// Convert to the frame delivered to recipients.
    ///
    /// Returns `None` when a required field for the kind is missing.
    #[must_use]
    pub fn to_frame(&self) -> Option<ServerFrame> {
        match self.kind {
            EnvelopeKind::Message => Some(ServerFrame::Message {
                room: self.room.clone(),
                message_id: self.message_id.clone()?,
                payload: self.payload.clone()?,
                timestamp: self.timestamp,
            }),
            EnvelopeKind::UserJoined => Some(ServerFrame::UserJoined {
                room: self.room.clone(),
                identity: self.identity.clone()?,
            }),
            EnvelopeKind::UserLeft => Some(ServerFrame::UserLeft {
                room: self.room.clone(),
                identity: self.identity.clone()?,
            }),
        }
    }
}
