//! Cross-instance fan-out router for Veil.
//!
//! The router multiplexes local connections onto the shared pub/sub channel
//! of each room. An instance subscribes to `room:{id}` only when its first
//! local connection joins the room and releases it when the last one leaves.

use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tracing::{debug, info, trace, warn};

use veil_protocol::{codec, Envelope, ProtocolError};

use crate::channel::{validate_room_id, FrameSender, RoomChannel, RoomId};
use crate::store::{keys, SharedStore, StoreError, Subscription};

/// First delay before retrying a lost shared channel subscription.
const RESUBSCRIBE_BASE: Duration = Duration::from_millis(100);

/// Longest delay between resubscription attempts.
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(5);

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Invalid room ID.
    #[error("Invalid room: {0}")]
    InvalidRoom(&'static str),

    /// The shared store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An envelope could not be encoded.
    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

/// The fan-out router.
pub struct Router {
    /// Rooms with at least one local member.
    rooms: DashMap<RoomId, Arc<RoomChannel>>,
    /// Per-room locks. A shared channel is never subscribed twice or
    /// released while a member of the same room is being added.
    locks: DashMap<RoomId, Arc<Mutex<()>>>,
    store: Arc<dyn SharedStore>,
    /// Wakes feeds waiting to resubscribe once the store is back.
    recovered: Arc<Notify>,
}

impl Router {
    /// Create a router over a shared store.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            rooms: DashMap::new(),
            locks: DashMap::new(),
            store,
            recovered: Arc::new(Notify::new()),
        }
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            room_count: self.rooms.len(),
            total_subscriptions: self.rooms.iter().map(|r| r.subscriber_count()).sum(),
        }
    }

    /// Number of rooms with local members.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Rooms with local members.
    #[must_use]
    pub fn rooms(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|r| r.key().clone()).collect()
    }

    /// Number of local members of a room.
    #[must_use]
    pub fn subscriber_count(&self, room: &str) -> usize {
        self.rooms
            .get(room)
            .map(|r| r.subscriber_count())
            .unwrap_or(0)
    }

    /// Check if a room has local members.
    #[must_use]
    pub fn has_room(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    /// Lock one room against concurrent subscribe/unsubscribe.
    ///
    /// A lock removed from the map while we waited on it is stale; retry
    /// with the current one.
    async fn lock_room(&self, room: &str) -> OwnedMutexGuard<()> {
        loop {
            let lock = Arc::clone(self.locks.entry(room.to_string()).or_default().value());
            let guard = Arc::clone(&lock).lock_owned().await;
            let current = self
                .locks
                .get(room)
                .is_some_and(|l| Arc::ptr_eq(l.value(), &lock));
            if current {
                return guard;
            }
        }
    }

    /// Subscribe a local connection to a room.
    ///
    /// # Errors
    ///
    /// Returns an error if the room ID is invalid or the shared channel
    /// cannot be subscribed.
    pub async fn subscribe(
        &self,
        room: &str,
        connection_id: &str,
        identity: &str,
        tx: FrameSender,
    ) -> Result<(), RouterError> {
        validate_room_id(room).map_err(RouterError::InvalidRoom)?;

        let _guard = self.lock_room(room).await;

        if let Some(channel) = self.rooms.get(room).map(|r| Arc::clone(r.value())) {
            channel.add(connection_id, identity, tx);
            return Ok(());
        }

        let subscription = match self.store.subscribe(&keys::room_channel(room)).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.locks.remove(room);
                return Err(e.into());
            }
        };
        let channel = Arc::new(RoomChannel::new(room));
        channel.set_pump(tokio::spawn(feed(
            Arc::clone(&self.store),
            subscription,
            Arc::downgrade(&channel),
            Arc::clone(&self.recovered),
        )));
        channel.add(connection_id, identity, tx);
        self.rooms.insert(room.to_string(), channel);

        info!(room = %room, "Subscribed to shared channel");
        Ok(())
    }

    /// Unsubscribe a local connection from a room.
    ///
    /// Returns `true` if it was the last local member, in which case the
    /// shared channel has been released.
    pub async fn unsubscribe(&self, room: &str, connection_id: &str) -> bool {
        if !self.rooms.contains_key(room) {
            return false;
        }
        let _guard = self.lock_room(room).await;

        let Some(channel) = self.rooms.get(room).map(|r| Arc::clone(r.value())) else {
            self.locks.remove(room);
            return false;
        };
        channel.remove(connection_id);

        if channel.is_empty() {
            self.rooms.remove(room);
            self.locks.remove(room);
            channel.stop();
            info!(room = %room, "Released shared channel");
            true
        } else {
            false
        }
    }

    /// Publish an envelope to the room's shared channel.
    ///
    /// Returns the number of instances that received it.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or publishing fails.
    pub async fn publish(&self, envelope: &Envelope) -> Result<usize, RouterError> {
        let text = codec::encode(envelope)?;
        let receivers = self
            .store
            .publish(&keys::room_channel(&envelope.room), &text)
            .await?;
        trace!(room = %envelope.room, kind = ?envelope.kind, receivers, "Published envelope");
        Ok(receivers)
    }

    /// Wake every feed waiting to resubscribe after a store outage.
    pub fn store_recovered(&self) {
        self.recovered.notify_waiters();
    }

    /// Release every shared channel subscription.
    pub async fn release_all(&self) {
        for room in self.rooms() {
            let _guard = self.lock_room(&room).await;
            if let Some((_, channel)) = self.rooms.remove(&room) {
                channel.stop();
            }
            self.locks.remove(&room);
        }
        info!("Released all shared channels");
    }
}

/// Forward raw envelopes from the shared channel to local members.
///
/// When the store ends the subscription while the room still has local
/// members, subscribe again with capped exponential backoff.
async fn feed(
    store: Arc<dyn SharedStore>,
    mut subscription: Subscription,
    channel: Weak<RoomChannel>,
    recovered: Arc<Notify>,
) {
    loop {
        while let Some(text) = subscription.recv().await {
            let Some(channel) = channel.upgrade() else {
                return;
            };
            match codec::decode_envelope(&text) {
                Ok(envelope) if envelope.room == channel.room() => {
                    channel.deliver(&envelope);
                }
                Ok(envelope) => {
                    warn!(room = %channel.room(), other = %envelope.room, "Envelope for another room");
                }
                Err(e) => {
                    warn!(room = %channel.room(), error = %e, "Malformed envelope");
                }
            }
        }

        let Some(room) = channel.upgrade().map(|c| c.room().to_string()) else {
            break;
        };
        warn!(room = %room, "Shared channel subscription lost, resubscribing");
        drop(subscription);
        subscription = match resubscribe(store.as_ref(), &room, &channel, &recovered).await {
            Some(subscription) => subscription,
            None => break,
        };
        info!(room = %room, "Resubscribed to shared channel");
    }
    debug!("Shared channel feed finished");
}

async fn resubscribe(
    store: &dyn SharedStore,
    room: &str,
    channel: &Weak<RoomChannel>,
    recovered: &Notify,
) -> Option<Subscription> {
    let mut delay = RESUBSCRIBE_BASE;
    loop {
        if channel.strong_count() == 0 {
            return None;
        }
        match store.subscribe(&keys::room_channel(room)).await {
            Ok(subscription) => return Some(subscription),
            Err(e) => {
                debug!(room = %room, error = %e, retry_in = ?delay, "Resubscribe failed");
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = recovered.notified() => {}
                }
                delay = (delay * 2).min(RESUBSCRIBE_MAX);
            }
        }
    }
}

/// Router statistics.
#[derive(Debug, Clone)]
pub struct RouterStats {
    /// Number of rooms with local members.
    pub room_count: usize,
    /// Total local room memberships.
    pub total_subscriptions: usize,
}
