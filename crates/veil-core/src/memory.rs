//! In-process [`SharedStore`] implementation.
//!
//! Mirrors the semantics of the production store closely enough for tests
//! and single-node development: TTLs run on the tokio clock (so paused-time
//! tests can advance them) and every operation executes inside one critical
//! section, which makes [`SharedStore::remove_pending`] atomic. Several hubs
//! sharing one `MemoryStore` behave like several instances sharing Redis.
//!
//! Expired keys are evicted when read, and writes sweep the whole map at
//! most once per [`SWEEP_INTERVAL`] so untouched keys do not pile up.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

use crate::store::keys::CREATED_FIELD;
use crate::store::{PendingRemoval, SharedStore, StoreError, Subscription};

/// Minimum time between two full sweeps of expired keys.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    data: HashMap<String, Entry>,
    channels: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
    last_sweep: Option<Instant>,
}

impl Inner {
    /// Drop every expired key, unless a sweep ran recently.
    fn sweep_expired(&mut self) {
        let now = Instant::now();
        if self
            .last_sweep
            .is_some_and(|at| now.saturating_duration_since(at) < SWEEP_INTERVAL)
        {
            return;
        }
        self.last_sweep = Some(now);
        let before = self.data.len();
        self.data.retain(|_, e| !e.is_expired(now));
        let evicted = before - self.data.len();
        if evicted > 0 {
            trace!(evicted, "Swept expired keys");
        }
    }

    /// Get a live entry, evicting it first if its TTL has elapsed.
    fn entry(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.data.get(key).is_some_and(|e| e.is_expired(now)) {
            trace!(key = %key, "Evicting expired key");
            self.data.remove(key);
        }
        self.data.get_mut(key)
    }

    fn hash_mut(
        &mut self,
        key: &str,
        create: bool,
    ) -> Result<Option<&mut HashMap<String, String>>, StoreError> {
        if self.entry(key).is_none() {
            if !create {
                return Ok(None);
            }
            self.data
                .insert(key.to_string(), Entry::new(Value::Hash(HashMap::new())));
        }
        match self.data.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Hash(hash)) => Ok(Some(hash)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    fn set_mut(
        &mut self,
        key: &str,
        create: bool,
    ) -> Result<Option<&mut HashSet<String>>, StoreError> {
        if self.entry(key).is_none() {
            if !create {
                return Ok(None);
            }
            self.data
                .insert(key.to_string(), Entry::new(Value::Set(HashSet::new())));
        }
        match self.data.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Set(set)) => Ok(Some(set)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    fn string(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entry(key).map(|e| &e.value) {
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Protocol(format!("WRONGTYPE operation against key {key}"))
}

/// A shared store living in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of live keys.
    #[must_use]
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .data
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    /// Remaining TTL of a key, if it has one.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut inner = self.lock();
        let now = Instant::now();
        inner
            .entry(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Get a string value, for inspection.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().string(key).ok().flatten()
    }

    /// Members of a set, for inspection.
    #[must_use]
    pub fn set_members(&self, key: &str) -> Vec<String> {
        let mut inner = self.lock();
        match inner.set_mut(key, false) {
            Ok(Some(set)) => set.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock().entry(key).is_some())
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut inner = self.lock();
        Ok(inner
            .hash_mut(key, false)?
            .map(|hash| hash.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut inner = self.lock();
        Ok(inner.hash_mut(key, false)?.cloned().unwrap_or_default())
    }

    async fn claim_member(
        &self,
        users_key: &str,
        expires_key: &str,
        member: &str,
        record: &str,
        created: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        inner.sweep_expired();
        let Some(hash) = inner.hash_mut(users_key, true)? else {
            return Ok(false);
        };
        hash.entry(CREATED_FIELD.to_string())
            .or_insert_with(|| created.to_string());
        if hash.contains_key(member) {
            return Ok(false);
        }
        hash.insert(member.to_string(), record.to_string());

        if let Some(entry) = inner.data.get_mut(users_key) {
            entry.expires_at = None;
        }
        inner.data.remove(expires_key);
        Ok(true)
    }

    async fn release_member(
        &self,
        users_key: &str,
        expires_key: &str,
        member: &str,
        grace: Duration,
    ) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        inner.sweep_expired();
        let Some(hash) = inner.hash_mut(users_key, false)? else {
            return Ok(0);
        };
        hash.remove(member);
        let remaining = hash.keys().filter(|k| *k != CREATED_FIELD).count();
        if remaining > 0 {
            return Ok(remaining);
        }

        let expires_at = Instant::now() + grace;
        if let Some(entry) = inner.data.get_mut(users_key) {
            entry.expires_at = Some(expires_at);
        }
        inner.data.insert(
            expires_key.to_string(),
            Entry {
                value: Value::Str(crate::message::now_millis().to_string()),
                expires_at: Some(expires_at),
            },
        );
        Ok(0)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.sweep_expired();
        inner.data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn sadd_with_ttl(
        &self,
        key: &str,
        members: &[String],
        ttl: Duration,
    ) -> Result<(), StoreError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut inner = self.lock();
        inner.sweep_expired();
        if let Some(set) = inner.set_mut(key, true)? {
            set.extend(members.iter().cloned());
        }
        if let Some(entry) = inner.data.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn remove_pending(
        &self,
        pending_key: &str,
        member: &str,
        relay_id_key: &str,
        relay_location_key: &str,
    ) -> Result<PendingRemoval, StoreError> {
        let mut inner = self.lock();

        let remaining = match inner.set_mut(pending_key, false)? {
            Some(set) => {
                if !set.remove(member) {
                    return Ok(PendingRemoval::NotPending);
                }
                set.len()
            }
            None => return Ok(PendingRemoval::NotPending),
        };
        if remaining > 0 {
            return Ok(PendingRemoval::StillPending);
        }

        let relay_msg_id = inner.string(relay_id_key)?;
        let relay_location = inner.string(relay_location_key)?;
        for key in [pending_key, relay_id_key, relay_location_key] {
            inner.data.remove(key);
        }

        Ok(PendingRemoval::Drained {
            relay_msg_id,
            relay_location,
        })
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        let Some(subscribers) = inner.channels.get_mut(channel) else {
            return Ok(0);
        };
        subscribers.retain(|tx| tx.send(payload.to_string()).is_ok());
        let count = subscribers.len();
        if count == 0 {
            inner.channels.remove(channel);
        }
        trace!(channel = %channel, receivers = count, "Published");
        Ok(count)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}


#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Semaphore;
    use tokio::task::AbortHandle;

    /// Memory store that can be taken down and whose subscriptions can be cut.
    #[derive(Debug, Default)]
    pub struct FaultyStore {
        pub inner: MemoryStore,
        down: AtomicBool,
        subscribes: AtomicUsize,
        claims: AtomicUsize,
        lose_claims: AtomicBool,
        feeds: Mutex<Vec<AbortHandle>>,
        stalled: Mutex<Option<(String, Arc<Semaphore>)>>,
    }

    impl FaultyStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every operation fail (or succeed again).
        pub fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        /// End every live subscription from the store side.
        pub fn cut_subscriptions(&self) {
            let feeds: Vec<AbortHandle> = self
                .feeds
                .lock()
                .unwrap()
                .drain(..)
                .collect();
            for feed in feeds {
                feed.abort();
            }
        }

        /// Hold subscribe calls for `channel` until [`Self::unstall`].
        pub fn stall(&self, channel: &str) {
            *self.stalled.lock().unwrap() = Some((channel.to_string(), Arc::new(Semaphore::new(0))));
        }

        /// Let held subscribe calls proceed.
        pub fn unstall(&self) {
            if let Some((_, gate)) = self.stalled.lock().unwrap().take() {
                gate.add_permits(Semaphore::MAX_PERMITS);
            }
        }

        /// Make every claim lose, as if another instance always won.
        pub fn lose_claims(&self) {
            self.lose_claims.store(true, Ordering::SeqCst);
        }

        /// Claim calls so far.
        pub fn claim_count(&self) -> usize {
            self.claims.load(Ordering::SeqCst)
        }

        /// Successful subscribe calls so far.
        pub fn subscribe_count(&self) -> usize {
            self.subscribes.load(Ordering::SeqCst)
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SharedStore for FaultyStore {
        async fn exists(&self, key: &str) -> Result<bool, StoreError> {
            self.check()?;
            self.inner.exists(key).await
        }
        async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
            self.check()?;
            self.inner.hkeys(key).await
        }
        async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
            self.check()?;
            self.inner.hgetall(key).await
        }
        async fn claim_member(
            &self,
            users_key: &str,
            expires_key: &str,
            member: &str,
            record: &str,
            created: &str,
        ) -> Result<bool, StoreError> {
            self.check()?;
            self.claims.fetch_add(1, Ordering::SeqCst);
            if self.lose_claims.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.inner
                .claim_member(users_key, expires_key, member, record, created)
                .await
        }
        async fn release_member(
            &self,
            users_key: &str,
            expires_key: &str,
            member: &str,
            grace: Duration,
        ) -> Result<usize, StoreError> {
            self.check()?;
            self.inner
                .release_member(users_key, expires_key, member, grace)
                .await
        }
        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
            self.check()?;
            self.inner.set_ex(key, value, ttl).await
        }
        async fn sadd_with_ttl(
            &self,
            key: &str,
            members: &[String],
            ttl: Duration,
        ) -> Result<(), StoreError> {
            self.check()?;
            self.inner.sadd_with_ttl(key, members, ttl).await
        }
        async fn remove_pending(
            &self,
            pending_key: &str,
            member: &str,
            relay_id_key: &str,
            relay_location_key: &str,
        ) -> Result<PendingRemoval, StoreError> {
            self.check()?;
            self.inner
                .remove_pending(pending_key, member, relay_id_key, relay_location_key)
                .await
        }
        async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
            self.check()?;
            self.inner.publish(channel, payload).await
        }
        async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
            let gate = self
                .stalled
                .lock()
                .unwrap()
                .as_ref()
                .filter(|(stalled, _)| stalled == channel)
                .map(|(_, gate)| Arc::clone(gate));
            if let Some(gate) = gate {
                let _ = gate.acquire().await;
            }
            self.check()?;
            let mut upstream = self.inner.subscribe(channel).await?;
            let (tx, rx) = mpsc::unbounded_channel();
            let feed = tokio::spawn(async move {
                while let Some(text) = upstream.recv().await {
                    if tx.send(text).is_err() {
                        break;
                    }
                }
            });
            self.feeds.lock().unwrap().push(feed.abort_handle());
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            Ok(Subscription::with_pump(rx, feed))
        }
        async fn ping(&self) -> Result<(), StoreError> {
            self.check()
        }
    }
}
