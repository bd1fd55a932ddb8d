//! The narrow Redis surface `RedisScriptRunner`, `Mutex`, `Leader` and
//! `Mesh` actually need, behind a trait so tests can swap in an in-memory
//! fake instead of a live Redis server.
//!
//! The real implementation wraps a `redis::aio::ConnectionManager` (shared,
//! multiplexed — safe to clone and use from many tasks at once) and encodes
//! ACQUIRE/RENEW/RELEASE/HEARTBEAT/CLEANUP as the Lua scripts the distilled
//! spec's "Redis Script Runner" component describes, so each is atomic on
//! its key(s) regardless of how many basalt processes race to run it.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::error::{CoordinationError, Result};

const ACQUIRE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return 1
";

const RENEW_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return 1
";

const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
  return 0
end
redis.call('DEL', KEYS[1])
return 1
";

const HEARTBEAT_SCRIPT: &str = r"
local now = redis.call('TIME')[1] * 1000
redis.call('ZADD', KEYS[1], now, ARGV[1])
return now
";

const CLEANUP_SCRIPT: &str = r"
local now = redis.call('TIME')[1] * 1000
local cutoff = now - tonumber(ARGV[1])
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', cutoff)
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('HDEL', KEYS[2], id)
end
return expired
";

/// The atomic single- and dual-key Redis operations this crate depends on.
///
/// Implemented by [`RealRedisBackend`] for production use and by
/// `InMemoryRedisBackend` (see [`crate::testing`]) for tests that should not
/// require a live Redis server.
#[async_trait]
pub trait RedisBackend: Send + Sync {
    /// `ACQUIRE(k, token, ttl_ms)`.
    async fn acquire(&self, key: &str, token: &str, ttl_ms: i64) -> Result<bool>;

    /// `RENEW(k, token, ttl_ms)`.
    async fn renew(&self, key: &str, token: &str, ttl_ms: i64) -> Result<bool>;

    /// `RELEASE(k, token)`.
    async fn release(&self, key: &str, token: &str) -> Result<bool>;

    /// `INCR key`, returning the post-increment value.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// `HEARTBEAT(heartbeats_key, id)`, returning server time in ms.
    async fn heartbeat(&self, heartbeats_key: &str, id: &str) -> Result<i64>;

    /// `CLEANUP(heartbeats_key, nodes_key, ttl_ms)`, returning removed ids.
    async fn cleanup(
        &self,
        heartbeats_key: &str,
        nodes_key: &str,
        ttl_ms: i64,
    ) -> Result<Vec<String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;
    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>>;
    async fn zrange(&self, key: &str) -> Result<Vec<String>>;
    async fn zrem(&self, key: &str, member: &str) -> Result<()>;
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;
}

/// A dedicated pub/sub connection (Redis isolates pub/sub traffic onto its
/// own connection; one is opened per [`crate::mesh::Mesh`] instance).
#[async_trait]
pub trait RedisSubscriber: Send + Sync {
    /// Subscribes to `channel` and returns the next published message each
    /// time it is polled. Returns `None` once the subscription is closed.
    async fn next_message(&mut self) -> Option<String>;

    async fn unsubscribe(&mut self) -> Result<()>;
}

/// Opens the "second Redis client for SUBSCRIBE" a [`crate::mesh::Mesh`]
/// needs, kept separate from [`RedisBackend`] because pub/sub connections
/// cannot also run ordinary commands.
#[async_trait]
pub trait RedisSubscriberFactory: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn RedisSubscriber>>;
}

/// Production [`RedisSubscriberFactory`]; opens one dedicated connection per
/// call, matching the distilled spec's "second Redis client for SUBSCRIBE".
pub struct RealRedisSubscriberFactory {
    url: String,
}

impl RealRedisSubscriberFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl RedisSubscriberFactory for RealRedisSubscriberFactory {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn RedisSubscriber>> {
        Ok(Box::new(RealRedisSubscriber::subscribe(&self.url, channel).await?))
    }
}

/// Production [`RedisBackend`] backed by a shared, multiplexed
/// `redis::aio::ConnectionManager`.
#[derive(Clone)]
pub struct RealRedisBackend {
    conn: ConnectionManager,
}

impl RealRedisBackend {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    pub fn from_connection_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl RedisBackend for RealRedisBackend {
    async fn acquire(&self, key: &str, token: &str, ttl_ms: i64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: i64 = Script::new(ACQUIRE_SCRIPT)
            .key(key)
            .arg(token)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }

    async fn renew(&self, key: &str, token: &str, ttl_ms: i64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: i64 = Script::new(RENEW_SCRIPT)
            .key(key)
            .arg(token)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: i64 = Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1).await?)
    }

    async fn heartbeat(&self, heartbeats_key: &str, id: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let now_ms: i64 = Script::new(HEARTBEAT_SCRIPT)
            .key(heartbeats_key)
            .arg(id)
            .invoke_async(&mut conn)
            .await?;
        Ok(now_ms)
    }

    async fn cleanup(
        &self,
        heartbeats_key: &str,
        nodes_key: &str,
        ttl_ms: i64,
    ) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let expired: Vec<String> = Script::new(CLEANUP_SCRIPT)
            .key(heartbeats_key)
            .key(nodes_key)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(expired)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(key, field).await?;
        Ok(())
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, fields).await?)
    }

    async fn zrange(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.zrange(key, 0, -1).await?)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zrem(key, member).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, message).await?;
        Ok(())
    }
}

/// Opens a dedicated pub/sub connection and subscribes to `channel`.
///
/// Pub/sub isolation means this connection carries nothing but messages for
/// `channel`; it is never shared with the multiplexed command connection
/// `RealRedisBackend` uses.
pub struct RealRedisSubscriber {
    stream: std::pin::Pin<Box<dyn futures_util::Stream<Item = redis::Msg> + Send>>,
    closed: bool,
}

impl RealRedisSubscriber {
    pub async fn subscribe(url: &str, channel: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| CoordinationError::SubscribeFailed {
                channel: channel.to_string(),
                reason: e.to_string(),
            })?;
        let stream = Box::pin(pubsub.into_on_message());
        Ok(Self {
            stream,
            closed: false,
        })
    }
}

#[async_trait]
impl RedisSubscriber for RealRedisSubscriber {
    async fn next_message(&mut self) -> Option<String> {
        use futures_util::StreamExt;
        if self.closed {
            return None;
        }
        loop {
            let msg = self.stream.next().await?;
            if let Ok(payload) = msg.get_payload::<String>() {
                return Some(payload);
            }
            tracing::warn!("dropping non-UTF8 mesh pub/sub payload");
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        // `into_on_message` consumed the `PubSub` handle to build a
        // 'static stream; there is no UNSUBSCRIBE frame to send on it
        // anymore. Marking the subscriber closed and dropping the stream
        // (and with it the underlying TCP connection) achieves the same
        // server-side effect.
        self.closed = true;
        Ok(())
    }
}
