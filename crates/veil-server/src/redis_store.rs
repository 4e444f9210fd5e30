//! Redis-backed shared store.
//!
//! Commands go through a [`ConnectionManager`], which reconnects on its own.
//! Room subscriptions share one pub/sub connection: channels are added and
//! removed with SUBSCRIBE/UNSUBSCRIBE on it, and a reader task routes each
//! message to its subscription. When that connection drops every
//! subscription ends, and the next subscribe opens a fresh connection.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use redis::{AsyncCommands, RedisError, Script};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use veil_core::message::now_millis;
use veil_core::store::keys::CREATED_FIELD;
use veil_core::{PendingRemoval, SharedStore, StoreError, Subscription};

/// KEYS: users, expires. ARGV: member, record, created, sentinel field.
const CLAIM_MEMBER: &str = r"
redis.call('HSETNX', KEYS[1], ARGV[4], ARGV[3])
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
  return 0
end
redis.call('PERSIST', KEYS[1])
redis.call('DEL', KEYS[2])
return 1
";

/// KEYS: users, expires. ARGV: member, grace seconds, now, sentinel field.
const RELEASE_MEMBER: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HDEL', KEYS[1], ARGV[1])
local remaining = redis.call('HLEN', KEYS[1])
if redis.call('HEXISTS', KEYS[1], ARGV[4]) == 1 then
  remaining = remaining - 1
end
if remaining > 0 then
  return remaining
end
redis.call('SET', KEYS[2], ARGV[3], 'EX', ARGV[2])
redis.call('EXPIRE', KEYS[1], ARGV[2])
return 0
";

/// KEYS: pending, relay id, relay location. ARGV: member.
const REMOVE_PENDING: &str = r"
if redis.call('SREM', KEYS[1], ARGV[1]) == 0 then
  return {0, false, false}
end
if redis.call('SCARD', KEYS[1]) > 0 then
  return {1, false, false}
end
local id = redis.call('GET', KEYS[2])
local location = redis.call('GET', KEYS[3])
redis.call('DEL', KEYS[1], KEYS[2], KEYS[3])
return {2, id, location}
";

/// A subscription's slot in the shared pub/sub connection.
struct Route {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

type Routes = Arc<DashMap<String, Route>>;

/// The pub/sub connection shared by every subscription of this store.
struct PubSubConnection {
    sink: PubSubSink,
    routes: Routes,
    reader: JoinHandle<()>,
}

impl PubSubConnection {
    async fn open(client: &redis::Client) -> Result<Self, StoreError> {
        let (sink, stream) = client
            .get_async_pubsub()
            .await
            .map_err(store_error)?
            .split();
        let routes: Routes = Arc::new(DashMap::new());
        let reader = tokio::spawn(read_messages(stream, Arc::clone(&routes)));
        info!("Opened shared pub/sub connection");
        Ok(Self {
            sink,
            routes,
            reader,
        })
    }
}

/// Route pub/sub messages to their subscriptions until the connection ends.
async fn read_messages(mut stream: PubSubStream, routes: Routes) {
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name();
        let payload = match msg.get_payload::<String>() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Undecodable pub/sub payload");
                continue;
            }
        };
        let closed = match routes.get(channel) {
            Some(route) => route.tx.send(payload).is_err(),
            None => false,
        };
        if closed {
            routes.remove(channel);
        }
    }
    warn!(subscriptions = routes.len(), "Pub/sub connection closed");
    // Dropping the senders ends every subscription.
    routes.clear();
}

/// UNSUBSCRIBE a channel nobody routes to any more.
async fn unsubscribe_idle(pubsub: Arc<Mutex<Option<PubSubConnection>>>, channel: String) {
    let mut guard = pubsub.lock().await;
    let Some(conn) = guard.as_mut() else {
        return;
    };
    if conn.routes.contains_key(&channel) {
        return;
    }
    match conn.sink.unsubscribe(&channel).await {
        Ok(()) => debug!(channel = %channel, "Unsubscribed"),
        Err(e) => debug!(channel = %channel, error = %e, "Unsubscribe failed"),
    }
}

/// Shared store on Redis.
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    pubsub: Arc<Mutex<Option<PubSubConnection>>>,
    next_route: AtomicU64,
    prefix: String,
    claim: Script,
    release: Script,
    remove_pending: Script,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the first connection fails.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(store_error)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(store_error)?;
        let prefix = prefix.into();
        info!(prefix = %prefix, "Connected to Redis");

        Ok(Self {
            client,
            conn,
            pubsub: Arc::new(Mutex::new(None)),
            next_route: AtomicU64::new(0),
            prefix,
            claim: Script::new(CLAIM_MEMBER),
            release: Script::new(RELEASE_MEMBER),
            remove_pending: Script::new(REMOVE_PENDING),
        })
    }

    fn key(&self, key: &str) -> String {
        prefixed(&self.prefix, key)
    }
}

fn prefixed(prefix: &str, key: &str) -> String {
    format!("{prefix}{key}")
}

/// TTL in whole seconds. Redis rejects a zero expiry.
fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn store_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Protocol(e.to_string())
    }
}

fn removal_from_reply(
    (status, relay_msg_id, relay_location): (i64, Option<String>, Option<String>),
) -> Result<PendingRemoval, StoreError> {
    match status {
        0 => Ok(PendingRemoval::NotPending),
        1 => Ok(PendingRemoval::StillPending),
        2 => Ok(PendingRemoval::Drained {
            relay_msg_id,
            relay_location,
        }),
        other => Err(StoreError::Protocol(format!(
            "unexpected pending removal status {other}"
        ))),
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        conn.exists(self.key(key)).await.map_err(store_error)
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hkeys(self.key(key)).await.map_err(store_error)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hgetall(self.key(key)).await.map_err(store_error)
    }

    async fn claim_member(
        &self,
        users_key: &str,
        expires_key: &str,
        member: &str,
        record: &str,
        created: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let claimed: i64 = self
            .claim
            .key(self.key(users_key))
            .key(self.key(expires_key))
            .arg(member)
            .arg(record)
            .arg(created)
            .arg(CREATED_FIELD)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(claimed == 1)
    }

    async fn release_member(
        &self,
        users_key: &str,
        expires_key: &str,
        member: &str,
        grace: Duration,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let remaining: i64 = self
            .release
            .key(self.key(users_key))
            .key(self.key(expires_key))
            .arg(member)
            .arg(ttl_secs(grace))
            .arg(now_millis())
            .arg(CREATED_FIELD)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(usize::try_from(remaining).unwrap_or(0))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set_ex(self.key(key), value, ttl_secs(ttl))
            .await
            .map_err(store_error)
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
        let key = self.key(key);
        let secs = i64::try_from(ttl_secs(ttl)).unwrap_or(i64::MAX);
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .sadd(&key, members)
            .ignore()
            .expire(&key, secs)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn remove_pending(
        &self,
        pending_key: &str,
        member: &str,
        relay_id_key: &str,
        relay_location_key: &str,
    ) -> Result<PendingRemoval, StoreError> {
        let mut conn = self.conn.clone();
        let reply: (i64, Option<String>, Option<String>) = self
            .remove_pending
            .key(self.key(pending_key))
            .key(self.key(relay_id_key))
            .key(self.key(relay_location_key))
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(store_error)?;
        removal_from_reply(reply)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        conn.publish(self.key(channel), payload)
            .await
            .map_err(store_error)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let channel = self.key(channel);
        let id = self.next_route.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let (mut sink, routes) = {
            let mut guard = self.pubsub.lock().await;
            let conn = match guard.take() {
                Some(conn) if !conn.reader.is_finished() => conn,
                _ => PubSubConnection::open(&self.client).await?,
            };
            let conn = guard.insert(conn);
            conn.routes.insert(channel.clone(), Route { id, tx });
            (conn.sink.clone(), Arc::clone(&conn.routes))
        };

        if let Err(e) = sink.subscribe(&channel).await {
            routes.remove_if(&channel, |_, route| route.id == id);
            return Err(store_error(e));
        }
        debug!(channel = %channel, "Subscribed");

        let pubsub = Arc::clone(&self.pubsub);
        Ok(Subscription::with_release(rx, move || {
            if routes.remove_if(&channel, |_, route| route.id == id).is_none() {
                return;
            }
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(unsubscribe_idle(pubsub, channel));
            }
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Protocol(format!("unexpected PING reply {pong}")))
        }
    }
}
