//! Local room channels for Veil.
//!
//! A [`RoomChannel`] holds the connections of one room that live on this
//! instance. Envelopes received from the shared channel are delivered to
//! every local member except the one whose identity matches the sender.

use dashmap::DashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use veil_protocol::{Envelope, ServerFrame};

use crate::message::ConnectionId;

/// Maximum room ID length.
pub const MAX_ROOM_ID_LENGTH: usize = 256;

/// A room identifier.
pub type RoomId = String;

/// Validate a room ID.
///
/// # Errors
///
/// Returns an error message if the room ID is invalid.
pub fn validate_room_id(room: &str) -> Result<(), &'static str> {
    if room.trim().is_empty() {
        return Err("Room cannot be empty");
    }
    if room.len() > MAX_ROOM_ID_LENGTH {
        return Err("Room ID too long");
    }
    if room.chars().any(char::is_control) {
        return Err("Room ID contains invalid characters");
    }
    Ok(())
}

/// Sender half of a connection's outbound frame queue.
pub type FrameSender = mpsc::UnboundedSender<ServerFrame>;

/// A connection of this instance subscribed to a room.
#[derive(Debug, Clone)]
pub struct LocalMember {
    /// Identity held in the room.
    pub identity: String,
    /// Outbound queue of the connection.
    pub tx: FrameSender,
}

/// Local subscribers of one room.
#[derive(Debug)]
pub struct RoomChannel {
    room: RoomId,
    members: DashMap<ConnectionId, LocalMember>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RoomChannel {
    /// Create an empty channel.
    #[must_use]
    pub fn new(room: impl Into<RoomId>) -> Self {
        Self {
            room: room.into(),
            members: DashMap::new(),
            pump: Mutex::new(None),
        }
    }

    /// Get the room ID.
    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Add a local member. Replaces an existing entry for the connection.
    pub fn add(&self, connection_id: impl Into<ConnectionId>, identity: impl Into<String>, tx: FrameSender) {
        let connection_id = connection_id.into();
        let identity = identity.into();
        debug!(room = %self.room, connection = %connection_id, identity = %identity, "Local member added");
        self.members.insert(connection_id, LocalMember { identity, tx });
    }

    /// Remove a local member.
    ///
    /// Returns `true` if the connection was a member.
    pub fn remove(&self, connection_id: &str) -> bool {
        let removed = self.members.remove(connection_id).is_some();
        if removed {
            debug!(room = %self.room, connection = %connection_id, "Local member removed");
        }
        removed
    }

    /// Get the number of local members.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.members.len()
    }

    /// Check if no local members remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Deliver an envelope to every local member except its sender.
    ///
    /// Returns the number of connections the frame was queued for.
    pub fn deliver(&self, envelope: &Envelope) -> usize {
        let Some(frame) = envelope.to_frame() else {
            debug!(room = %self.room, kind = ?envelope.kind, "Dropping incomplete envelope");
            return 0;
        };

        let mut delivered = 0;
        for member in self.members.iter() {
            if member.identity == envelope.sender {
                continue;
            }
            // A closed queue means the connection is tearing down.
            if member.tx.send(frame.clone()).is_ok() {
                delivered += 1;
            }
        }
        trace!(room = %self.room, kind = frame.kind(), recipients = delivered, "Delivered envelope");
        delivered
    }

    /// Attach the task pumping the shared channel into this room.
    pub fn set_pump(&self, pump: JoinHandle<()>) {
        if let Ok(mut slot) = self.pump.lock() {
            if let Some(old) = slot.replace(pump) {
                old.abort();
            }
        }
    }

    /// Stop the pump, releasing the shared channel subscription.
    pub fn stop(&self) {
        if let Ok(mut slot) = self.pump.lock() {
            if let Some(pump) = slot.take() {
                pump.abort();
                debug!(room = %self.room, "Shared channel released");
            }
        }
    }
}

impl Drop for RoomChannel {
    fn drop(&mut self) {
        self.stop();
    }
}
