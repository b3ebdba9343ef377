//! Redis Distributed Store Adapter
//!
//! Implements the `DistributedStore` port on a Redis server.
//!
//! Hash fields hold JSON-encoded values. Multi-step mutations (swap,
//! expiration scheduling, lock release) run as Lua scripts so they are
//! atomic on the server.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::domain::ports::{DistributedStore, ExpiredKeys};
use crate::error::Result;
use crate::expire::ScheduleMode;
use crate::model::{decode_fields, encode_fields, FieldMap};

/// Channel pattern carrying expired key names.
pub const EXPIRED_CHANNEL: &str = "__keyevent@*__:expired";

// =============================================================================
// Scripts
// =============================================================================

/// KEYS[1] hash, ARGV field/value pairs. Returns the old field/value pairs.
static SWAP_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local old = redis.call('HGETALL', KEYS[1])
redis.call('DEL', KEYS[1])
if #ARGV > 0 then
  redis.call('HSET', KEYS[1], unpack(ARGV))
end
return old
",
    )
});

/// KEYS[1] marker, KEYS[2] pointer, ARGV[1] mode, ARGV[2] ttl seconds.
static SCHEDULE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local live = redis.call('GET', KEYS[2])
if ARGV[1] == 'cancel' then
  if not live then
    return 0
  end
  redis.call('DEL', live, KEYS[2])
  return 1
end
if ARGV[1] == 'if-absent' and live and redis.call('EXISTS', live) == 1 then
  return 0
end
if live then
  redis.call('DEL', live)
end
redis.call('SET', KEYS[1], '1', 'EX', ARGV[2])
redis.call('SET', KEYS[2], KEYS[1], 'EX', ARGV[2])
return 1
",
    )
});

/// KEYS[1] lock, ARGV[1] token.
static RELEASE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
",
    )
});

// =============================================================================
// Adapter
// =============================================================================

/// Distributed store backed by Redis.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    manager: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("addr", &self.client.get_connection_info().addr)
            .finish()
    }
}

impl RedisStore {
    /// Connect to a Redis server.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        info!(addr = %client.get_connection_info().addr, "Connected to Redis");
        Ok(Self { client, manager })
    }

    /// Turn on expired-key notifications. Managed servers may refuse
    /// `CONFIG`; that is logged and ignored.
    pub async fn enable_expire_notifications(&self) {
        let mut con = self.manager.clone();
        let result: redis::RedisResult<()> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut con)
            .await;
        if let Err(e) = result {
            warn!("Could not enable keyspace notifications: {}", e);
        }
    }
}

#[async_trait]
impl DistributedStore for RedisStore {
    async fn hash_get_all(&self, key: &str) -> Result<FieldMap> {
        let mut con = self.manager.clone();
        // A Vec keeps the server's field order; FieldMap preserves it.
        let raw: Vec<(String, String)> = con.hgetall(key).await?;
        Ok(decode_fields(raw))
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Value>> {
        let mut con = self.manager.clone();
        let raw: Option<String> = con.hget(key, field).await?;
        Ok(raw.map(|raw| serde_json::from_str(&raw).unwrap_or(Value::String(raw))))
    }

    async fn hash_set(&self, key: &str, fields: &FieldMap) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut con = self.manager.clone();
        let _: () = con.hset_multiple(key, &encode_fields(fields)).await?;
        Ok(())
    }

    async fn hash_replace(&self, key: &str, fields: &FieldMap) -> Result<()> {
        let mut con = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().del(key).ignore();
        if !fields.is_empty() {
            pipe.hset_multiple(key, &encode_fields(fields)).ignore();
        }
        let _: () = pipe.query_async(&mut con).await?;
        Ok(())
    }

    #[instrument(skip(self, fields))]
    async fn hash_swap(&self, key: &str, fields: &FieldMap) -> Result<FieldMap> {
        let mut con = self.manager.clone();
        let mut invocation = SWAP_SCRIPT.key(key);
        for (name, value) in encode_fields(fields) {
            invocation.arg(name).arg(value);
        }
        let flat: Vec<String> = invocation.invoke_async(&mut con).await?;

        let pairs = flat
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();
        Ok(decode_fields(pairs))
    }

    async fn hash_delete_field(&self, key: &str, field: &str) -> Result<bool> {
        let mut con = self.manager.clone();
        let removed: i64 = con.hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut con = self.manager.clone();
        let removed: u64 = con.del(keys).await?;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut con = self.manager.clone();
        let found: bool = con.exists(key).await?;
        Ok(found)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut con = self.manager.clone();
        let mut keys: Vec<String> = con.keys(pattern).await?;
        keys.sort();
        Ok(keys)
    }

    #[instrument(skip(self))]
    async fn schedule_expire(
        &self,
        marker: &str,
        pointer: &str,
        mode: ScheduleMode,
        ttl: Duration,
    ) -> Result<bool> {
        let mut con = self.manager.clone();
        let changed: i64 = SCHEDULE_SCRIPT
            .key(marker)
            .key(pointer)
            .arg(mode.as_str())
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut con)
            .await?;
        debug!(changed, "Expire schedule applied");
        Ok(changed == 1)
    }

    async fn acquire_lock(&self, key: &str, token: &str, timeout: Duration) -> Result<bool> {
        let mut con = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(timeout.as_millis().max(1) as u64)
            .query_async(&mut con)
            .await?;
        Ok(reply.is_some())
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool> {
        let mut con = self.manager.clone();
        let removed: i64 = RELEASE_SCRIPT
            .key(key)
            .arg(token)
            .invoke_async(&mut con)
            .await?;
        Ok(removed == 1)
    }

    async fn subscribe_expired(&self) -> Result<ExpiredKeys> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(EXPIRED_CHANNEL).await?;
        info!(pattern = EXPIRED_CHANNEL, "Subscribed to expired key events");

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(stream.boxed())
    }

    async fn health_check(&self) -> Result<bool> {
        let mut con = self.manager.clone();
        let pong: String = redis::cmd("PING").query_async(&mut con).await?;
        Ok(pong == "PONG")
    }
}
