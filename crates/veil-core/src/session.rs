//! Per-connection session state and frame dispatch.
//!
//! A [`Session`] is driven by exactly one task per socket, so frames of a
//! connection are processed in arrival order. Replies and room traffic are
//! queued on the session's outbound channel; the transport drains it.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use veil_protocol::{codec, ClientFrame, Envelope, ErrorCode, ProtocolError, ServerFrame};

use crate::channel::{validate_room_id, FrameSender, RoomId};
use crate::hub::Hub;
use crate::liveness::Liveness;
use crate::message::{generate_connection_id, generate_message_id, ConnectionId};
use crate::presence::RoomError;
use crate::router::RouterError;

/// Errors reported to the client as `error` frames.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No room given.
    #[error("Room ID is required")]
    MissingRoom,

    /// The room ID is malformed.
    #[error("Invalid room: {0}")]
    InvalidRoom(&'static str),

    /// No payload given.
    #[error("Message payload is required")]
    MissingPayload,

    /// No message ID given.
    #[error("Message ID is required")]
    MissingMessageId,

    /// The connection has not joined a room.
    #[error("Must join a room first")]
    NotInRoom,

    /// The frame names a room other than the joined one.
    #[error("Room {0} does not match joined room")]
    WrongRoom(String),

    /// The shared store is unreachable.
    #[error("Shared store unavailable")]
    StoreUnavailable,

    /// The hub is shutting down.
    #[error("Server is shutting down")]
    ShuttingDown,

    /// A room operation failed.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// Subscribing to the room failed.
    #[error("Failed to join room: {0}")]
    Join(RouterError),

    /// Publishing the message failed.
    #[error("Failed to send message: {0}")]
    Send(RouterError),
}

impl SessionError {
    /// The error code reported to the client.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::MissingRoom => ErrorCode::MissingRoom,
            SessionError::InvalidRoom(_) => ErrorCode::InvalidFrame,
            SessionError::MissingPayload => ErrorCode::MissingPayload,
            SessionError::MissingMessageId => ErrorCode::MissingMessageId,
            SessionError::NotInRoom => ErrorCode::NotInRoom,
            SessionError::WrongRoom(_) => ErrorCode::WrongRoom,
            SessionError::StoreUnavailable => ErrorCode::StoreUnavailable,
            SessionError::ShuttingDown => ErrorCode::ShuttingDown,
            SessionError::Room(e) => e.code(),
            SessionError::Join(_) => ErrorCode::JoinError,
            SessionError::Send(_) => ErrorCode::SendError,
        }
    }
}

#[derive(Debug, Clone)]
struct Membership {
    room: RoomId,
    identity: String,
}

/// State of one client connection.
pub struct Session {
    hub: Arc<Hub>,
    id: ConnectionId,
    tx: FrameSender,
    membership: Option<Membership>,
    liveness: Liveness,
}

impl Session {
    pub(crate) fn new(hub: Arc<Hub>, tx: FrameSender) -> Self {
        let liveness = Liveness::new(hub.config().missed_pongs);
        let id = generate_connection_id();
        debug!(connection = %id, "Session opened");
        Self {
            hub,
            id,
            tx,
            membership: None,
            liveness,
        }
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the joined room, if any.
    #[must_use]
    pub fn room(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.room.as_str())
    }

    /// Get the identity held in the joined room, if any.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.identity.as_str())
    }

    /// Get the heartbeat tracker.
    pub fn liveness_mut(&mut self) -> &mut Liveness {
        &mut self.liveness
    }

    /// Handle a raw text frame.
    pub async fn handle_text(&mut self, text: &str) {
        self.liveness.mark_alive();
        match codec::decode_client_with_limit(text, self.hub.config().max_frame_size) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(e) => self.reject(&e),
        }
    }

    /// Answer an undecodable frame with an error frame.
    pub fn reject(&mut self, error: &ProtocolError) {
        self.liveness.mark_alive();
        debug!(connection = %self.id, error = %error, "Rejected frame");
        self.reply(ServerFrame::error(error.code(), error.to_string()));
    }

    /// Handle a decoded frame.
    pub async fn handle_frame(&mut self, frame: ClientFrame) {
        self.liveness.mark_alive();
        trace!(connection = %self.id, kind = frame.kind(), "Frame received");

        let result = match frame {
            ClientFrame::Join {
                room,
                identity,
                lang,
            } => self.join(room, identity, lang).await,
            ClientFrame::Leave { room } => self.leave(&room).await,
            ClientFrame::Message { room, payload } => self.message(&room, payload).await,
            ClientFrame::Ack { room, message_id } => self.ack(&room, &message_id).await,
            ClientFrame::Ping {} => {
                self.reply(ServerFrame::pong());
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!(connection = %self.id, code = %e.code(), error = %e, "Frame failed");
            self.reply(ServerFrame::error(e.code(), e.to_string()));
        }
    }

    /// Tear the session down, leaving its room on its behalf.
    pub async fn close(mut self) {
        if let Some(membership) = self.membership.take() {
            self.teardown(membership).await;
        }
        debug!(connection = %self.id, "Session closed");
    }

    fn reply(&self, frame: ServerFrame) {
        // Fails only once the transport has stopped draining.
        let _ = self.tx.send(frame);
    }

    fn require_store(&self) -> Result<(), SessionError> {
        if self.hub.store_ready() {
            Ok(())
        } else {
            Err(SessionError::StoreUnavailable)
        }
    }

    /// The current membership, checked against the room named by a frame.
    fn membership_for(&self, room: &str) -> Result<Membership, SessionError> {
        let membership = self.membership.as_ref().ok_or(SessionError::NotInRoom)?;
        if membership.room != room {
            return Err(SessionError::WrongRoom(room.to_string()));
        }
        Ok(membership.clone())
    }

    async fn join(
        &mut self,
        room: String,
        identity: Option<String>,
        lang: Option<String>,
    ) -> Result<(), SessionError> {
        if room.is_empty() {
            return Err(SessionError::MissingRoom);
        }
        validate_room_id(&room).map_err(SessionError::InvalidRoom)?;
        if !self.hub.is_accepting() {
            return Err(SessionError::ShuttingDown);
        }
        self.require_store()?;

        if let Some(current) = self.membership.take() {
            self.teardown(current).await;
        }

        let joined = self
            .hub
            .presence()
            .join(&room, self.hub.instance_id(), &self.id, identity.as_deref())
            .await?;

        if let Err(e) = self
            .hub
            .router()
            .subscribe(&room, &self.id, &joined.identity, self.tx.clone())
            .await
        {
            if let Err(leave_err) = self.hub.presence().leave(&room, &joined.identity).await {
                warn!(connection = %self.id, room = %room, error = %leave_err, "Rollback of failed join failed");
            }
            return Err(SessionError::Join(e));
        }

        info!(
            connection = %self.id,
            room = %room,
            identity = %joined.identity,
            lang = lang.as_deref().unwrap_or("-"),
            "Joined room"
        );

        self.reply(ServerFrame::Joined {
            room: room.clone(),
            identity: joined.identity.clone(),
            participants: joined.prior_participants,
        });

        if let Err(e) = self
            .hub
            .router()
            .publish(&Envelope::user_joined(&room, &joined.identity))
            .await
        {
            warn!(connection = %self.id, room = %room, error = %e, "Failed to announce join");
        }

        self.membership = Some(Membership {
            room,
            identity: joined.identity,
        });
        Ok(())
    }

    async fn leave(&mut self, room: &str) -> Result<(), SessionError> {
        let Some(current) = self.membership.as_ref() else {
            // Leaving twice is harmless.
            return Ok(());
        };
        if !room.is_empty() && current.room != room {
            return Err(SessionError::WrongRoom(room.to_string()));
        }
        self.require_store()?;

        if let Some(membership) = self.membership.take() {
            self.teardown(membership).await;
        }
        Ok(())
    }

    async fn message(&mut self, room: &str, payload: String) -> Result<(), SessionError> {
        let membership = self.membership_for(room)?;
        if payload.is_empty() {
            return Err(SessionError::MissingPayload);
        }
        self.require_store()?;

        let message_id = generate_message_id();

        match self.hub.relay().relay(room, &payload).await {
            Ok(relayed) => {
                match self
                    .hub
                    .presence()
                    .track_message(
                        room,
                        &message_id,
                        &relayed.relay_msg_id,
                        &relayed.location,
                        Some(&membership.identity),
                    )
                    .await
                {
                    Ok(0) => {
                        self.hub
                            .delete_relay_copy(&message_id, &relayed.location, &relayed.relay_msg_id)
                            .await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(connection = %self.id, message = %message_id, error = %e, "Failed to track message");
                    }
                }
            }
            Err(e) => {
                warn!(connection = %self.id, room = %room, error = %e, "Relay failed, delivering live only");
            }
        }

        let envelope = Envelope::message(room, &message_id, payload, &membership.identity);
        self.hub
            .router()
            .publish(&envelope)
            .await
            .map_err(SessionError::Send)?;

        debug!(connection = %self.id, room = %room, message = %message_id, "Message sent");
        Ok(())
    }

    async fn ack(&mut self, room: &str, message_id: &str) -> Result<(), SessionError> {
        let membership = self.membership_for(room)?;
        if message_id.is_empty() {
            return Err(SessionError::MissingMessageId);
        }
        self.require_store()?;

        let outcome = self
            .hub
            .presence()
            .acknowledge(message_id, &membership.identity)
            .await?;

        if outcome.all_acked {
            if let (Some(relay_msg_id), Some(location)) = (outcome.relay_msg_id, outcome.relay_location) {
                self.hub
                    .delete_relay_copy(message_id, &location, &relay_msg_id)
                    .await;
            }
        }
        Ok(())
    }

    /// Leave the room: presence, local subscription, announcement.
    async fn teardown(&self, membership: Membership) {
        let Membership { room, identity } = membership;

        self.hub.router().unsubscribe(&room, &self.id).await;

        if let Err(e) = self.hub.presence().leave(&room, &identity).await {
            warn!(connection = %self.id, room = %room, error = %e, "Failed to leave room");
            self.hub.defer_leave(&room, &identity);
        }

        if let Err(e) = self
            .hub
            .router()
            .publish(&Envelope::user_left(&room, &identity))
            .await
        {
            warn!(connection = %self.id, room = %room, error = %e, "Failed to announce leave");
        }

        info!(connection = %self.id, room = %room, identity = %identity, "Left room");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.hub.session_closed();
    }
}
