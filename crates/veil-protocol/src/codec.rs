//! Codec for encoding and decoding Veil frames.
//!
//! Frames travel as JSON text. Decoding client frames distinguishes
//! malformed JSON, unknown frame types and structurally invalid frames so
//! that each can be reported with its own stable error code.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::envelope::Envelope;
use crate::frames::{ClientFrame, ErrorCode, ServerFrame, CLIENT_FRAME_TYPES};

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {1}")]
    FrameTooLarge(usize, usize),

    /// Input is not valid JSON.
    #[error("Invalid JSON: {0}")]
    InvalidJson(serde_json::Error),

    /// The `type` discriminant is missing or not recognised.
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// JSON is well formed but does not match the frame shape.
    #[error("Invalid frame: {0}")]
    Invalid(String),

    /// Encoding failed.
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ProtocolError {
    /// The error code reported to the client for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::FrameTooLarge(..) => ErrorCode::FrameTooLarge,
            ProtocolError::InvalidJson(_) => ErrorCode::InvalidJson,
            ProtocolError::UnknownType(_) => ErrorCode::UnknownType,
            ProtocolError::Invalid(_) | ProtocolError::Encode(_) => ErrorCode::InvalidFrame,
        }
    }
}

/// Encode any frame or envelope to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode a client frame, enforcing the given size limit.
///
/// # Errors
///
/// Returns an error if the text is too large, not JSON, has an unknown
/// `type`, or does not match the frame shape.
pub fn decode_client_with_limit(text: &str, limit: usize) -> Result<ClientFrame, ProtocolError> {
    if text.len() > limit {
        return Err(ProtocolError::FrameTooLarge(text.len(), limit));
    }

    let value: serde_json::Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;

    let kind = match value.get("type") {
        Some(serde_json::Value::String(kind)) => kind.as_str(),
        Some(other) => return Err(ProtocolError::UnknownType(other.to_string())),
        None => return Err(ProtocolError::UnknownType("<missing>".to_string())),
    };
    if !CLIENT_FRAME_TYPES.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }

    from_value(value)
}

/// Decode a client frame with the default size limit.
///
/// # Errors
///
/// See [`decode_client_with_limit`].
pub fn decode_client(text: &str) -> Result<ClientFrame, ProtocolError> {
    decode_client_with_limit(text, MAX_FRAME_SIZE)
}

/// Decode a server frame (client side).
///
/// # Errors
///
/// Returns an error if the text is not a valid server frame.
pub fn decode_server(text: &str) -> Result<ServerFrame, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
    from_value(value)
}

/// Decode a pub/sub envelope.
///
/// # Errors
///
/// Returns an error if the text is not a valid envelope.
pub fn decode_envelope(text: &str) -> Result<Envelope, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
    from_value(value)
}

fn from_value<T: DeserializeOwned>(value: serde_json::Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::Invalid(e.to_string()))
}
