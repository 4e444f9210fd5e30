//! Frame types for the Veil protocol.
//!
//! Frames are JSON objects carrying a `type` discriminant. Payloads are
//! opaque ciphertext strings produced by clients; the server never looks
//! inside them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Frame type names accepted from clients.
pub const CLIENT_FRAME_TYPES: [&str; 5] = ["join", "leave", "message", "ack", "ping"];

/// A frame sent by a client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Join a room, optionally asking for a specific identity.
    Join {
        /// Room to join.
        #[serde(default)]
        room: String,
        /// Preferred identity, honoured when free.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity: Option<String>,
        /// Client language code.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lang: Option<String>,
    },

    /// Leave the current room.
    Leave {
        /// Room to leave.
        #[serde(default)]
        room: String,
    },

    /// Send an encrypted payload to the room.
    Message {
        /// Target room.
        #[serde(default)]
        room: String,
        /// Opaque encrypted payload.
        #[serde(default)]
        payload: String,
    },

    /// Acknowledge receipt of a message.
    Ack {
        /// Room the message was received in.
        #[serde(default)]
        room: String,
        /// ID of the acknowledged message.
        #[serde(rename = "messageId", default)]
        message_id: String,
    },

    /// Keepalive ping.
    Ping {},
}

impl ClientFrame {
    /// Get the frame type name.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Join { .. } => "join",
            ClientFrame::Leave { .. } => "leave",
            ClientFrame::Message { .. } => "message",
            ClientFrame::Ack { .. } => "ack",
            ClientFrame::Ping {} => "ping",
        }
    }

    /// Create a Join frame.
    #[must_use]
    pub fn join(room: impl Into<String>, identity: Option<String>, lang: Option<String>) -> Self {
        ClientFrame::Join {
            room: room.into(),
            identity,
            lang,
        }
    }

    /// Create a Leave frame.
    #[must_use]
    pub fn leave(room: impl Into<String>) -> Self {
        ClientFrame::Leave { room: room.into() }
    }

    /// Create a Message frame.
    #[must_use]
    pub fn message(room: impl Into<String>, payload: impl Into<String>) -> Self {
        ClientFrame::Message {
            room: room.into(),
            payload: payload.into(),
        }
    }

    /// Create an Ack frame.
    #[must_use]
    pub fn ack(room: impl Into<String>, message_id: impl Into<String>) -> Self {
        ClientFrame::Ack {
            room: room.into(),
            message_id: message_id.into(),
        }
    }

    /// Create a Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        ClientFrame::Ping {}
    }
}

/// A frame sent by the server to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Join confirmation.
    Joined {
        /// Joined room.
        room: String,
        /// Identity assigned to this connection.
        identity: String,
        /// Participants present before this join.
        participants: Vec<String>,
    },

    /// Another participant joined the room.
    UserJoined {
        /// Room.
        room: String,
        /// Identity of the new participant.
        identity: String,
    },

    /// A participant left the room.
    UserLeft {
        /// Room.
        room: String,
        /// Identity of the departed participant.
        identity: String,
    },

    /// An encrypted message for the room.
    Message {
        /// Room.
        room: String,
        /// Message ID to acknowledge.
        #[serde(rename = "messageId")]
        message_id: String,
        /// Opaque encrypted payload.
        payload: String,
        /// Relay timestamp in milliseconds, for messages arriving via the relay.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Error response.
    Error {
        /// Stable error code.
        code: ErrorCode,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive pong.
    Pong {},
}

impl ServerFrame {
    /// Get the frame type name.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Joined { .. } => "joined",
            ServerFrame::UserJoined { .. } => "user_joined",
            ServerFrame::UserLeft { .. } => "user_left",
            ServerFrame::Message { .. } => "message",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Pong {} => "pong",
        }
    }

    /// Create an Error frame.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code,
            message: message.into(),
        }
    }

    /// Create a Pong frame.
    #[must_use]
    pub fn pong() -> Self {
        ServerFrame::Pong {}
    }
}

/// Stable error codes reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidJson,
    UnknownType,
    InvalidFrame,
    FrameTooLarge,
    MissingRoom,
    MissingPayload,
    MissingMessageId,
    NotInRoom,
    WrongRoom,
    RoomFull,
    IdentityExhausted,
    JoinError,
    SendError,
    StoreUnavailable,
    ShuttingDown,
}

impl ErrorCode {
    /// The wire representation of this code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidJson => "INVALID_JSON",
            ErrorCode::UnknownType => "UNKNOWN_TYPE",
            ErrorCode::InvalidFrame => "INVALID_FRAME",
            ErrorCode::FrameTooLarge => "FRAME_TOO_LARGE",
            ErrorCode::MissingRoom => "MISSING_ROOM",
            ErrorCode::MissingPayload => "MISSING_PAYLOAD",
            ErrorCode::MissingMessageId => "MISSING_MESSAGE_ID",
            ErrorCode::NotInRoom => "NOT_IN_ROOM",
            ErrorCode::WrongRoom => "WRONG_ROOM",
            ErrorCode::RoomFull => "ROOM_FULL",
            ErrorCode::IdentityExhausted => "IDENTITY_EXHAUSTED",
            ErrorCode::JoinError => "JOIN_ERROR",
            ErrorCode::SendError => "SEND_ERROR",
            ErrorCode::StoreUnavailable => "STORE_UNAVAILABLE",
            ErrorCode::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
