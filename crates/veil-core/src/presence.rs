//! Room and presence bookkeeping for Veil.
//!
//! A room exists exactly as long as its presence hash exists in the shared
//! store. Rooms are created implicitly on first join and are never deleted
//! explicitly: when the last participant leaves, the hash and an expiry
//! marker receive a grace TTL, and a rejoin inside that window clears both.
//!
//! This module also tracks which participants still owe an acknowledgement
//! for each relayed message, so the relayed copy can be deleted once
//! everyone has it.

use rand::thread_rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use veil_protocol::ErrorCode;

use crate::identity;
use crate::message::now_millis;
use crate::store::{keys, PendingRemoval, SharedStore, StoreError};

/// Room errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// The shared store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The room has reached its participant limit.
    #[error("Room is full ({0} participants)")]
    RoomFull(usize),

    /// No free identity could be drawn.
    #[error("No free identity after {0} draws")]
    IdentitySpaceExhausted(usize),

    /// A participant record could not be encoded.
    #[error("Invalid participant record: {0}")]
    Record(#[from] serde_json::Error),
}

impl RoomError {
    /// The error code reported to the client.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            RoomError::Store(_) => ErrorCode::StoreUnavailable,
            RoomError::RoomFull(_) => ErrorCode::RoomFull,
            RoomError::IdentitySpaceExhausted(_) => ErrorCode::IdentityExhausted,
            RoomError::Record(_) => ErrorCode::JoinError,
        }
    }
}

/// Presence configuration.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// How long an empty room survives before it ceases to exist.
    pub empty_room_ttl: Duration,
    /// How long acknowledgement tracking survives.
    pub pending_ttl: Duration,
    /// Maximum participants per room.
    pub max_participants: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            empty_room_ttl: Duration::from_secs(300),
            pending_ttl: Duration::from_secs(60),
            max_participants: 50,
        }
    }
}

/// Participant record stored in the presence hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    /// Connection holding the identity.
    pub connection_id: String,
    /// Instance owning the connection.
    pub server_id: String,
    /// When the participant joined (ms since epoch).
    pub joined_at: u64,
}

/// Result of a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Identity assigned to the joiner.
    pub identity: String,
    /// Participants present before this join.
    pub prior_participants: Vec<String>,
}

/// Result of an acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// Whether this acknowledgement was the last one owed.
    pub all_acked: bool,
    /// Relay message ID to delete, when fully acknowledged.
    pub relay_msg_id: Option<String>,
    /// Relay location to delete from, when fully acknowledged.
    pub relay_location: Option<String>,
}

/// Room and presence manager backed by the shared store.
#[derive(Clone)]
pub struct Presence {
    store: Arc<dyn SharedStore>,
    config: PresenceConfig,
}

impl Presence {
    /// Create a presence manager.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, config: PresenceConfig) -> Self {
        Self { store, config }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Check if a room exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn room_exists(&self, room: &str) -> Result<bool, RoomError> {
        Ok(self.store.exists(&keys::room_users(room)).await?)
    }

    /// Get the identities currently in a room.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn participants(&self, room: &str) -> Result<Vec<String>, RoomError> {
        let mut fields = self.store.hkeys(&keys::room_users(room)).await?;
        fields.retain(|f| f != keys::CREATED_FIELD);
        Ok(fields)
    }

    /// Join a room, creating it if needed.
    ///
    /// The preferred identity is used when acceptable and free; otherwise a
    /// fresh one is drawn. Claims go through the store's set-if-absent so
    /// concurrent joins on different instances never share an identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the room is full, no identity can be drawn, or
    /// the store fails.
    pub async fn join(
        &self,
        room: &str,
        instance_id: &str,
        connection_id: &str,
        preferred: Option<&str>,
    ) -> Result<JoinOutcome, RoomError> {
        let users_key = keys::room_users(room);
        let expires_key = keys::room_expires(room);

        let prior = self.participants(room).await?;
        if prior.len() >= self.config.max_participants {
            return Err(RoomError::RoomFull(prior.len()));
        }
        if prior.is_empty() {
            debug!(room = %room, "Room has no participants, join creates or revives it");
        }

        let now = now_millis();
        let record = serde_json::to_string(&Participant {
            connection_id: connection_id.to_string(),
            server_id: instance_id.to_string(),
            joined_at: now,
        })?;
        let created = now.to_string();

        let mut taken: HashSet<String> = prior.iter().cloned().collect();

        if let Some(wanted) = preferred.filter(|p| identity::is_acceptable(p)) {
            if !taken.contains(wanted)
                && self
                    .store
                    .claim_member(&users_key, &expires_key, wanted, &record, &created)
                    .await?
            {
                info!(room = %room, identity = %wanted, "Participant joined");
                return Ok(JoinOutcome {
                    identity: wanted.to_string(),
                    prior_participants: prior,
                });
            }
            taken.insert(wanted.to_string());
        }

        let mut budget = identity::MAX_DRAWS;
        loop {
            let candidate = {
                let mut rng = thread_rng();
                identity::draw_identity(&taken, &mut rng, &mut budget)
            };
            let Some(candidate) = candidate else {
                break;
            };
            if self
                .store
                .claim_member(&users_key, &expires_key, &candidate, &record, &created)
                .await?
            {
                info!(room = %room, identity = %candidate, "Participant joined");
                return Ok(JoinOutcome {
                    identity: candidate,
                    prior_participants: prior,
                });
            }
            // Lost a race with a join on another instance.
            taken.insert(candidate);
        }

        warn!(room = %room, taken = taken.len(), "Identity space exhausted");
        Err(RoomError::IdentitySpaceExhausted(identity::MAX_DRAWS))
    }

    /// Leave a room. Returns the number of remaining participants.
    ///
    /// When the room becomes empty it is scheduled to expire after the grace
    /// window instead of being deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn leave(&self, room: &str, identity: &str) -> Result<usize, RoomError> {
        let remaining = self
            .store
            .release_member(
                &keys::room_users(room),
                &keys::room_expires(room),
                identity,
                self.config.empty_room_ttl,
            )
            .await?;

        info!(room = %room, identity = %identity, remaining, "Participant left");
        if remaining == 0 {
            debug!(room = %room, grace = ?self.config.empty_room_ttl, "Room empty, expiry scheduled");
        }
        Ok(remaining)
    }

    /// Release participants whose owning instance stopped refreshing its
    /// liveness marker. Participants of `own_instance`, and those who joined
    /// less than `min_age` ago, are never touched, so a freshly started
    /// instance has time to publish its marker.
    ///
    /// Returns the released identities.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn sweep_stale(
        &self,
        room: &str,
        own_instance: &str,
        min_age: Duration,
    ) -> Result<Vec<String>, RoomError> {
        let records = self.store.hgetall(&keys::room_users(room)).await?;
        let cutoff = now_millis().saturating_sub(u64::try_from(min_age.as_millis()).unwrap_or(u64::MAX));
        let mut alive: HashMap<String, bool> = HashMap::new();
        let mut released = Vec::new();

        for (identity, record) in records {
            if identity == keys::CREATED_FIELD {
                continue;
            }
            let Ok(participant) = serde_json::from_str::<Participant>(&record) else {
                debug!(room = %room, identity = %identity, "Unreadable participant record");
                continue;
            };
            if participant.server_id == own_instance || participant.joined_at > cutoff {
                continue;
            }
            let live = match alive.get(&participant.server_id) {
                Some(live) => *live,
                None => {
                    let live = self
                        .store
                        .exists(&keys::server_alive(&participant.server_id))
                        .await?;
                    alive.insert(participant.server_id.clone(), live);
                    live
                }
            };
            if !live {
                self.leave(room, &identity).await?;
                warn!(room = %room, identity = %identity, server = %participant.server_id, "Released participant of a dead instance");
                released.push(identity);
            }
        }
        Ok(released)
    }

    /// Track a relayed message for acknowledgement.
    ///
    /// The pending set is a snapshot of the current participants, minus the
    /// author, who never receives their own message. When nobody is left to
    /// acknowledge, nothing is written and `0` is returned; the caller owns
    /// deleting the relayed copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn track_message(
        &self,
        room: &str,
        message_id: &str,
        relay_msg_id: &str,
        relay_location: &str,
        author: Option<&str>,
    ) -> Result<usize, RoomError> {
        let mut pending = self.participants(room).await?;
        if let Some(author) = author {
            pending.retain(|p| p != author);
        }
        if pending.is_empty() {
            debug!(room = %room, message = %message_id, "No recipients to acknowledge");
            return Ok(0);
        }

        let ttl = self.config.pending_ttl;
        self.store
            .set_ex(&keys::msg_relay_id(message_id), relay_msg_id, ttl)
            .await?;
        self.store
            .set_ex(&keys::msg_relay_location(message_id), relay_location, ttl)
            .await?;
        self.store
            .sadd_with_ttl(&keys::msg_pending(message_id), &pending, ttl)
            .await?;

        debug!(room = %room, message = %message_id, pending = pending.len(), "Tracking message");
        Ok(pending.len())
    }

    /// Acknowledge a message on behalf of an identity.
    ///
    /// Idempotent: acknowledging twice, or for an identity that was never
    /// pending, changes nothing. Only the acknowledgement that empties the
    /// pending set reports `all_acked`, with the relay coordinates.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn acknowledge(&self, message_id: &str, identity: &str) -> Result<AckOutcome, RoomError> {
        let removal = self
            .store
            .remove_pending(
                &keys::msg_pending(message_id),
                identity,
                &keys::msg_relay_id(message_id),
                &keys::msg_relay_location(message_id),
            )
            .await?;

        Ok(match removal {
            PendingRemoval::NotPending | PendingRemoval::StillPending => AckOutcome::default(),
            PendingRemoval::Drained {
                relay_msg_id,
                relay_location,
            } => {
                debug!(message = %message_id, "All participants acknowledged");
                AckOutcome {
                    all_acked: true,
                    relay_msg_id,
                    relay_location,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::testing::FaultyStore;
    use crate::memory::MemoryStore;

    fn presence() -> (Arc<MemoryStore>, Presence) {
        let store = Arc::new(MemoryStore::new());
        let presence = Presence::new(store.clone(), PresenceConfig::default());
        (store, presence)
    }

    #[tokio::test]
    async fn test_join_assigns_identities() {
        let (_, presence) = presence();

        assert!(!presence.room_exists("METEOR-7291").await.unwrap());

        let a = presence.join("METEOR-7291", "i1", "c1", None).await.unwrap();
        assert!(a.prior_participants.is_empty());
        assert!(presence.room_exists("METEOR-7291").await.unwrap());

        let b = presence.join("METEOR-7291", "i2", "c2", None).await.unwrap();
        assert_ne!(a.identity, b.identity);
        assert_eq!(b.prior_participants, vec![a.identity.clone()]);
    }

    #[tokio::test]
    async fn test_preferred_identity() {
        let (_, presence) = presence();

        let a = presence.join("R", "i", "c1", Some("Alice")).await.unwrap();
        assert_eq!(a.identity, "Alice");

        // Taken: a fresh identity is drawn instead.
        let b = presence.join("R", "i", "c2", Some("Alice")).await.unwrap();
        assert_ne!(b.identity, "Alice");

        // Reserved tokens are never honoured.
        let c = presence.join("R", "i", "c3", Some("external")).await.unwrap();
        assert_ne!(c.identity, "external");
    }

    #[tokio::test]
    async fn test_participant_record() {
        let (store, presence) = presence();
        let joined = presence.join("R", "inst-1", "conn-1", None).await.unwrap();

        let fields = store.hkeys(&keys::room_users("R")).await.unwrap();
        assert!(fields.contains(&joined.identity));
        assert!(fields.iter().any(|f| f == keys::CREATED_FIELD));
        assert_eq!(presence.participants("R").await.unwrap(), vec![joined.identity]);
    }

    #[tokio::test]
    async fn test_no_duplicate_identities() {
        let (_, presence) = presence();
        let mut joined = Vec::new();

        for round in 0..5 {
            for i in 0..8 {
                let out = presence
                    .join("R", "i", &format!("c{round}-{i}"), Some("Same"))
                    .await
                    .unwrap();
                joined.push(out.identity);
            }
            // Leave every other participant.
            let leaving: Vec<String> = joined.iter().step_by(2).cloned().collect();
            for identity in &leaving {
                presence.leave("R", identity).await.unwrap();
            }
            joined.retain(|j| !leaving.contains(j));

            let live = presence.participants("R").await.unwrap();
            let unique: HashSet<&String> = live.iter().collect();
            assert_eq!(unique.len(), live.len());
            assert_eq!(live.len(), joined.len());
        }
    }

    #[tokio::test]
    async fn test_concurrent_joins_are_unique() {
        let (_, presence) = presence();
        let mut handles = Vec::new();
        for i in 0..30 {
            let presence = presence.clone();
            handles.push(tokio::spawn(async move {
                presence
                    .join("R", "i", &format!("c{i}"), None)
                    .await
                    .unwrap()
                    .identity
            }));
        }
        let mut identities = HashSet::new();
        for handle in handles {
            assert!(identities.insert(handle.await.unwrap()));
        }
        assert_eq!(presence.participants("R").await.unwrap().len(), 30);
    }

    #[tokio::test]
    async fn test_room_full() {
        let store = Arc::new(MemoryStore::new());
        let presence = Presence::new(
            store,
            PresenceConfig {
                max_participants: 2,
                ..PresenceConfig::default()
            },
        );
        presence.join("R", "i", "c1", None).await.unwrap();
        presence.join("R", "i", "c2", None).await.unwrap();

        let err = presence.join("R", "i", "c3", None).await.unwrap_err();
        assert!(matches!(err, RoomError::RoomFull(2)));
        assert_eq!(err.code(), ErrorCode::RoomFull);
    }

    #[tokio::test]
    async fn test_identity_space_exhausted() {
        let store = Arc::new(MemoryStore::new());
        let presence = Presence::new(
            store,
            PresenceConfig {
                max_participants: 1000,
                ..PresenceConfig::default()
            },
        );
        for (emoji, color) in identity::COLORS {
            for animal in identity::ANIMALS {
                let name = format!("{emoji} {color} {animal}");
                presence.join("R", "i", "c", Some(&name)).await.unwrap();
            }
        }

        let err = presence.join("R", "i", "c", None).await.unwrap_err();
        assert!(matches!(err, RoomError::IdentitySpaceExhausted(_)));
        assert_eq!(err.code(), ErrorCode::IdentityExhausted);
    }

    #[tokio::test]
    async fn test_lost_claims_stop_after_draw_budget() {
        let store = Arc::new(FaultyStore::new());
        store.lose_claims();
        let presence = Presence::new(store.clone(), PresenceConfig::default());

        let err = presence.join("R", "i", "c1", Some("Alice")).await.unwrap_err();
        assert!(matches!(err, RoomError::IdentitySpaceExhausted(_)));
        // One claim for the preferred identity, then at most one per draw.
        assert!(store.claim_count() <= identity::MAX_DRAWS + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_room_expires_after_grace() {
        let (store, presence) = presence();
        let a = presence.join("R", "i", "c1", None).await.unwrap();

        assert_eq!(presence.leave("R", &a.identity).await.unwrap(), 0);
        assert!(presence.room_exists("R").await.unwrap());
        assert!(store.exists(&keys::room_expires("R")).await.unwrap());

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(presence.room_exists("R").await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!presence.room_exists("R").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_within_grace_keeps_room() {
        let (store, presence) = presence();
        let a = presence.join("R", "i", "c1", None).await.unwrap();
        presence.leave("R", &a.identity).await.unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        let again = presence.join("R", "i", "c2", Some(&a.identity)).await.unwrap();
        assert_eq!(again.identity, a.identity);
        assert!(!store.exists(&keys::room_expires("R")).await.unwrap());

        tokio::time::advance(Duration::from_secs(600)).await;
        assert!(presence.room_exists("R").await.unwrap());
    }

    #[tokio::test]
    async fn test_acknowledge_drains_pending() {
        let (store, presence) = presence();
        let a = presence.join("R", "i", "c1", None).await.unwrap();
        let b = presence.join("R", "i", "c2", None).await.unwrap();
        let c = presence.join("R", "i", "c3", None).await.unwrap();

        let pending = presence
            .track_message("R", "msg_1", "77", "-100123", Some(&a.identity))
            .await
            .unwrap();
        assert_eq!(pending, 2);
        assert!(!store
            .set_members(&keys::msg_pending("msg_1"))
            .contains(&a.identity));

        // The author is not pending: no-op.
        assert_eq!(
            presence.acknowledge("msg_1", &a.identity).await.unwrap(),
            AckOutcome::default()
        );

        let first = presence.acknowledge("msg_1", &b.identity).await.unwrap();
        assert!(!first.all_acked);

        // Repeated acknowledgement: no-op.
        assert!(!presence.acknowledge("msg_1", &b.identity).await.unwrap().all_acked);

        let last = presence.acknowledge("msg_1", &c.identity).await.unwrap();
        assert_eq!(
            last,
            AckOutcome {
                all_acked: true,
                relay_msg_id: Some("77".into()),
                relay_location: Some("-100123".into()),
            }
        );

        // Tracking records are gone; later acks stay no-ops.
        assert_eq!(store.get(&keys::msg_relay_id("msg_1")), None);
        assert!(!presence.acknowledge("msg_1", &c.identity).await.unwrap().all_acked);
    }

    #[tokio::test]
    async fn test_lone_author_leaves_nothing_pending() {
        let (store, presence) = presence();
        let a = presence.join("R", "i", "c1", None).await.unwrap();

        let pending = presence
            .track_message("R", "msg_1", "77", "-1", Some(&a.identity))
            .await
            .unwrap();
        assert_eq!(pending, 0);
        assert_eq!(store.get(&keys::msg_relay_id("msg_1")), None);
        assert_eq!(store.get(&keys::msg_relay_location("msg_1")), None);
        assert_eq!(store.key_count(), 1);
    }

    /// Claim `identity` with a record that joined long ago.
    async fn seed_old_member(store: &MemoryStore, identity: &str, server_id: &str) {
        let record = serde_json::to_string(&Participant {
            connection_id: format!("conn-{identity}"),
            server_id: server_id.to_string(),
            joined_at: 0,
        })
        .unwrap();
        assert!(store
            .claim_member(&keys::room_users("R"), &keys::room_expires("R"), identity, &record, "0")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_sweep_releases_members_of_dead_instances() {
        let (store, presence) = presence();
        let min_age = Duration::from_secs(15);
        store
            .set_ex(&keys::server_alive("live"), "1", min_age)
            .await
            .unwrap();

        seed_old_member(&store, "Mine", "me").await;
        seed_old_member(&store, "Other", "live").await;
        seed_old_member(&store, "Ghost", "crashed").await;
        // Joined moments ago on an instance without a marker yet.
        let fresh = presence.join("R", "booting", "c4", None).await.unwrap();

        let released = presence.sweep_stale("R", "me", min_age).await.unwrap();
        assert_eq!(released, vec!["Ghost".to_string()]);

        let mut live = presence.participants("R").await.unwrap();
        live.sort();
        let mut expected = vec!["Mine".to_string(), "Other".to_string(), fresh.identity];
        expected.sort();
        assert_eq!(live, expected);

        // Nothing left to release.
        assert!(presence.sweep_stale("R", "me", min_age).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_final_acks_drain_once() {
        let (_, presence) = presence();
        let a = presence.join("R", "i", "c1", None).await.unwrap();
        presence
            .track_message("R", "msg_1", "77", "-1", None)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let presence = presence.clone();
            let identity = a.identity.clone();
            handles.push(tokio::spawn(async move {
                presence.acknowledge("msg_1", &identity).await.unwrap()
            }));
        }

        let mut drained = 0;
        for handle in handles {
            if handle.await.unwrap().all_acked {
                drained += 1;
            }
        }
        assert_eq!(drained, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_message_expires() {
        let (store, presence) = presence();
        let a = presence.join("R", "i", "c1", None).await.unwrap();
        presence
            .track_message("R", "msg_1", "77", "-1", None)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(store.get(&keys::msg_relay_id("msg_1")), None);
        assert!(store.set_members(&keys::msg_pending("msg_1")).is_empty());
        let late = presence.acknowledge("msg_1", &a.identity).await.unwrap();
        assert!(!late.all_acked);
        assert_eq!(late.relay_msg_id, None);
    }
}
