//! Shared state store contract.
//!
//! Every piece of cross-instance state (room presence, pending
//! acknowledgements) lives behind [`SharedStore`]. Instances never hold
//! authoritative state in memory beyond their own sockets.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with something unexpected.
    #[error("Unexpected store response: {0}")]
    Protocol(String),
}

/// Outcome of removing an identity from a pending-acknowledgement set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRemoval {
    /// The identity was not pending (already removed, never tracked, or expired).
    NotPending,
    /// Removed; other identities are still pending.
    StillPending,
    /// Removed and the set is now empty. Tracking records were read and
    /// deleted in the same atomic step.
    Drained {
        /// Relay message ID, if recorded.
        relay_msg_id: Option<String>,
        /// Relay location, if recorded.
        relay_location: Option<String>,
    },
}

/// A live pub/sub subscription.
///
/// Dropping the subscription releases the underlying channel subscription.
/// `recv` returning `None` means the store side of the subscription is
/// gone (for example the pub/sub connection dropped) and the caller has to
/// subscribe again.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<String>,
    pump: Option<JoinHandle<()>>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Create a subscription fed directly by a sender.
    #[must_use]
    pub fn new(receiver: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            receiver,
            pump: None,
            release: None,
        }
    }

    /// Create a subscription fed by a background task, aborted on drop.
    #[must_use]
    pub fn with_pump(receiver: mpsc::UnboundedReceiver<String>, pump: JoinHandle<()>) -> Self {
        Self {
            receiver,
            pump: Some(pump),
            release: None,
        }
    }

    /// Create a subscription that runs `release` once when dropped.
    #[must_use]
    pub fn with_release(
        receiver: mpsc::UnboundedReceiver<String>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            receiver,
            pump: None,
            release: Some(Box::new(release)),
        }
    }

    /// Receive the next raw payload. Returns `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pump", &self.pump.is_some())
            .field("release", &self.release.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Key/hash/set storage with TTL plus pub/sub channels.
///
/// Operations that must not interleave across instances (claiming and
/// releasing a room member, shrinking a pending set) are single compound
/// calls that the implementation executes atomically.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Check whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// List hash fields.
    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Read every field and value of a hash.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Atomically claim `member` in the presence hash at `users_key`.
    ///
    /// Creates the hash with the [`keys::CREATED_FIELD`] sentinel if absent.
    /// If the member field is free it is set to `record`, the hash loses any
    /// TTL and `expires_key` is deleted. Returns `false` if the member field
    /// was already taken, in which case nothing but the sentinel is written.
    async fn claim_member(
        &self,
        users_key: &str,
        expires_key: &str,
        member: &str,
        record: &str,
        created: &str,
    ) -> Result<bool, StoreError>;

    /// Atomically remove `member` from the presence hash at `users_key`.
    ///
    /// When no members remain (the sentinel does not count), `expires_key`
    /// is set and both keys receive `grace` as TTL. Returns the number of
    /// remaining members.
    async fn release_member(
        &self,
        users_key: &str,
        expires_key: &str,
        member: &str,
        grace: Duration,
    ) -> Result<usize, StoreError>;

    /// Set a string value with a TTL.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Add members to a set and set its TTL in one step.
    async fn sadd_with_ttl(
        &self,
        key: &str,
        members: &[String],
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Atomically remove `member` from the set at `pending_key`; if that
    /// removal emptied the set, read and delete `relay_id_key` and
    /// `relay_location_key` in the same step.
    async fn remove_pending(
        &self,
        pending_key: &str,
        member: &str,
        relay_id_key: &str,
        relay_location_key: &str,
    ) -> Result<PendingRemoval, StoreError>;

    /// Publish a payload to a channel. Returns the number of receivers.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError>;

    /// Subscribe to a channel. The subscription is active when this returns.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;

    /// Check connectivity.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Key and channel layout.
pub mod keys {
    /// Hash field marking room creation.
    pub const CREATED_FIELD: &str = "__created__";

    /// Room presence hash: identity -> participant record.
    #[must_use]
    pub fn room_users(room: &str) -> String {
        format!("room:{room}:users")
    }

    /// Empty-room expiry sentinel.
    #[must_use]
    pub fn room_expires(room: &str) -> String {
        format!("room:{room}:expires")
    }

    /// Pub/sub channel for a room.
    #[must_use]
    pub fn room_channel(room: &str) -> String {
        format!("room:{room}")
    }

    /// Liveness marker of a server instance, refreshed while it runs.
    #[must_use]
    pub fn server_alive(instance_id: &str) -> String {
        format!("server:{instance_id}:alive")
    }

    /// Set of identities yet to acknowledge a message.
    #[must_use]
    pub fn msg_pending(message_id: &str) -> String {
        format!("msg:{message_id}:pending")
    }

    /// Relay message ID of a tracked message.
    #[must_use]
    pub fn msg_relay_id(message_id: &str) -> String {
        format!("msg:{message_id}:relayId")
    }

    /// Relay location of a tracked message.
    #[must_use]
    pub fn msg_relay_location(message_id: &str) -> String {
        format!("msg:{message_id}:relayLocation")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(keys::room_users("METEOR-7291"), "room:METEOR-7291:users");
        assert_eq!(keys::room_expires("A"), "room:A:expires");
        assert_eq!(keys::room_channel("A"), "room:A");
        assert_eq!(keys::msg_pending("msg_1"), "msg:msg_1:pending");
        assert_eq!(keys::msg_relay_id("msg_1"), "msg:msg_1:relayId");
        assert_eq!(keys::msg_relay_location("msg_1"), "msg:msg_1:relayLocation");
        assert_eq!(keys::server_alive("i-1"), "server:i-1:alive");
    }

    #[tokio::test]
    async fn test_subscription_drop_aborts_pump() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (held_tx, mut held_rx) = mpsc::unbounded_channel::<()>();
        let pump = tokio::spawn(async move {
            let _tx = tx;
            let _held = held_tx;
            std::future::pending::<()>().await;
        });
        let sub = Subscription::with_pump(rx, pump);
        drop(sub);

        // The aborted pump drops its sender.
        assert!(held_rx.recv().await.is_none());
    }

    #[test]
    fn test_subscription_release_runs_once_on_drop() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let released = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = mpsc::unbounded_channel();
        let counter = Arc::clone(&released);
        let sub = Subscription::with_release(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(sub);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
