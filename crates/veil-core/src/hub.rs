//! The per-instance hub.
//!
//! A [`Hub`] owns everything one server instance needs to serve
//! connections: the presence manager, the fan-out router and the relay
//! adapter. It is built once the shared store answers and torn down on
//! shutdown; nothing about it is global.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use veil_protocol::codec::MAX_FRAME_SIZE;
use veil_protocol::{Envelope, ErrorCode, ServerFrame, EXTERNAL_SENDER};

use crate::channel::RoomId;
use crate::message::{generate_message_id, now_millis, MessageId};
use crate::presence::{Presence, PresenceConfig, RoomError};
use crate::relay::{InboundRelayed, Relay};
use crate::router::{Router, RouterError};
use crate::session::Session;
use crate::store::{keys, SharedStore};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub no longer accepts connections.
    #[error("Server is shutting down")]
    ShuttingDown,

    /// A room operation failed.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// Publishing failed.
    #[error(transparent)]
    Router(#[from] RouterError),
}

impl HubError {
    /// The error code reported to clients.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            HubError::ShuttingDown => ErrorCode::ShuttingDown,
            HubError::Room(e) => e.code(),
            HubError::Router(_) => ErrorCode::SendError,
        }
    }
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Room and acknowledgement settings.
    pub presence: PresenceConfig,
    /// Maximum inbound frame size in bytes.
    pub max_frame_size: usize,
    /// Unanswered pings before a connection is closed.
    pub missed_pongs: u32,
    /// Lifetime of this instance's liveness marker. Other instances release
    /// its participants once the marker lapses.
    pub instance_ttl: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            presence: PresenceConfig::default(),
            max_frame_size: MAX_FRAME_SIZE,
            missed_pongs: 2,
            instance_ttl: Duration::from_secs(15),
        }
    }
}

/// What happened to a message delivered by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Routed into the room under a fresh message ID.
    Routed(MessageId),
    /// The room no longer exists; relay deletion was requested.
    Discarded,
}

/// Hub statistics.
#[derive(Debug, Clone)]
pub struct HubStats {
    /// Instance ID.
    pub instance_id: String,
    /// Open connections on this instance.
    pub connections: usize,
    /// Rooms with local members.
    pub rooms: usize,
    /// Whether the shared store answered the last health check.
    pub store_ready: bool,
}

/// Per-instance connection hub.
pub struct Hub {
    instance_id: String,
    presence: Presence,
    router: Router,
    relay: Arc<dyn Relay>,
    store: Arc<dyn SharedStore>,
    config: HubConfig,
    connections: AtomicUsize,
    accepting: AtomicBool,
    store_ready: AtomicBool,
    /// Leaves that failed during teardown, retried by [`Hub::maintain`].
    deferred_leaves: Mutex<Vec<(RoomId, String)>>,
}

impl Hub {
    /// Create a hub with a fresh instance ID.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, relay: Arc<dyn Relay>, config: HubConfig) -> Self {
        let instance_id = Uuid::new_v4().to_string();
        info!(instance = %instance_id, "Creating hub");
        Self {
            presence: Presence::new(Arc::clone(&store), config.presence.clone()),
            router: Router::new(Arc::clone(&store)),
            instance_id,
            relay,
            store,
            config,
            connections: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            store_ready: AtomicBool::new(true),
            deferred_leaves: Mutex::new(Vec::new()),
        }
    }

    /// Get the instance ID.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get the presence manager.
    #[must_use]
    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// Get the router.
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Get the relay adapter.
    #[must_use]
    pub fn relay(&self) -> &dyn Relay {
        self.relay.as_ref()
    }

    /// Open connections on this instance.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Whether new connections are accepted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Whether the shared store answered the last health check.
    #[must_use]
    pub fn store_ready(&self) -> bool {
        self.store_ready.load(Ordering::SeqCst)
    }

    /// Record the outcome of a store health check.
    pub fn set_store_ready(&self, ready: bool) {
        let was = self.store_ready.swap(ready, Ordering::SeqCst);
        if was && !ready {
            error!(instance = %self.instance_id, "Shared store unreachable, refusing room operations");
        } else if !was && ready {
            info!(instance = %self.instance_id, "Shared store reachable again");
            self.router.store_recovered();
        }
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            instance_id: self.instance_id.clone(),
            connections: self.connection_count(),
            rooms: self.router.room_count(),
            store_ready: self.store_ready(),
        }
    }

    /// Open a session for a new connection.
    ///
    /// Returns the session and the receiving half of its outbound queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub is shutting down.
    pub fn open_session(
        self: &Arc<Self>,
    ) -> Result<(Session, mpsc::UnboundedReceiver<ServerFrame>), HubError> {
        if !self.is_accepting() {
            return Err(HubError::ShuttingDown);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.fetch_add(1, Ordering::Relaxed);
        Ok((Session::new(Arc::clone(self), tx), rx))
    }

    pub(crate) fn session_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Queue a leave that could not reach the store.
    pub(crate) fn defer_leave(&self, room: &str, identity: &str) {
        let mut deferred = self
            .deferred_leaves
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        deferred.push((room.to_string(), identity.to_string()));
        warn!(room = %room, identity = %identity, queued = deferred.len(), "Leave deferred until the store answers");
    }

    /// Number of leaves waiting for the store.
    #[must_use]
    pub fn deferred_leave_count(&self) -> usize {
        self.deferred_leaves
            .lock()
            .map(|d| d.len())
            .unwrap_or(0)
    }

    /// Delete a relayed copy nobody is waiting for any more.
    pub(crate) async fn delete_relay_copy(&self, message_id: &str, location: &str, relay_msg_id: &str) {
        if self.relay.delete_relayed(location, relay_msg_id).await {
            debug!(message = %message_id, relay_msg = %relay_msg_id, "Relay copy deleted");
        } else {
            warn!(message = %message_id, relay_msg = %relay_msg_id, "Relay deletion failed");
        }
    }

    /// Route a message delivered by the relay.
    ///
    /// Messages for rooms that no longer exist are deleted from the relay
    /// and dropped. Otherwise the message is tracked against the current
    /// participants and published with the external sender token.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn handle_inbound(&self, inbound: InboundRelayed) -> Result<InboundOutcome, HubError> {
        if !self.presence.room_exists(&inbound.room_id).await? {
            info!(room = %inbound.room_id, relay_msg = %inbound.relay_msg_id, "Relay message for dead room, discarding");
            if !self
                .relay
                .delete_relayed(&inbound.location, &inbound.relay_msg_id)
                .await
            {
                warn!(room = %inbound.room_id, relay_msg = %inbound.relay_msg_id, "Relay deletion failed");
            }
            return Ok(InboundOutcome::Discarded);
        }

        let message_id = generate_message_id();
        let pending = self
            .presence
            .track_message(
                &inbound.room_id,
                &message_id,
                &inbound.relay_msg_id,
                &inbound.location,
                None,
            )
            .await?;

        if pending == 0 {
            self.delete_relay_copy(&message_id, &inbound.location, &inbound.relay_msg_id)
                .await;
        }

        let envelope = Envelope::message(&inbound.room_id, &message_id, inbound.payload, EXTERNAL_SENDER)
            .with_timestamp(inbound.timestamp);
        self.router.publish(&envelope).await?;

        debug!(room = %inbound.room_id, message = %message_id, pending, "Routed relay message");
        Ok(InboundOutcome::Routed(message_id))
    }

    /// Check the shared store once and record the result.
    pub async fn check_store(&self) -> bool {
        let ready = match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Store health check failed");
                false
            }
        };
        self.set_store_ready(ready);
        ready
    }

    /// Check the store, then do the periodic housekeeping that needs it.
    ///
    /// While the store answers this refreshes the instance liveness marker,
    /// retries deferred leaves and releases participants of dead instances
    /// from every room with local members.
    pub async fn maintain(&self) -> bool {
        if !self.check_store().await {
            return false;
        }

        if let Err(e) = self
            .store
            .set_ex(
                &keys::server_alive(&self.instance_id),
                &now_millis().to_string(),
                self.config.instance_ttl,
            )
            .await
        {
            warn!(error = %e, "Failed to refresh instance liveness");
        }

        self.retry_deferred_leaves().await;

        for room in self.router.rooms() {
            match self
                .presence
                .sweep_stale(&room, &self.instance_id, self.config.instance_ttl)
                .await
            {
                Ok(released) => {
                    for identity in released {
                        if let Err(e) = self.router.publish(&Envelope::user_left(&room, &identity)).await {
                            warn!(room = %room, error = %e, "Failed to announce released participant");
                        }
                    }
                }
                Err(e) => warn!(room = %room, error = %e, "Stale participant sweep failed"),
            }
        }
        true
    }

    async fn retry_deferred_leaves(&self) {
        let deferred = std::mem::take(
            &mut *self
                .deferred_leaves
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for (room, identity) in deferred {
            match self.presence.leave(&room, &identity).await {
                Ok(_) => {
                    info!(room = %room, identity = %identity, "Deferred leave completed");
                    if let Err(e) = self.router.publish(&Envelope::user_left(&room, &identity)).await {
                        warn!(room = %room, error = %e, "Failed to announce leave");
                    }
                }
                Err(e) => {
                    debug!(room = %room, error = %e, "Deferred leave failed again");
                    self.defer_leave(&room, &identity);
                }
            }
        }
    }

    /// Spawn a task running [`Hub::maintain`] every `interval`.
    pub fn spawn_store_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !hub.is_accepting() {
                    break;
                }
                hub.maintain().await;
            }
        })
    }

    /// Stop accepting connections and release shared channel subscriptions.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.router.release_all().await;
        info!(instance = %self.instance_id, "Hub shut down");
    }
}
