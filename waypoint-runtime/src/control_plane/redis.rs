//! Redis-backed control plane
//!
//! All keys live under one prefix (`<prefix>:queue:*`, `<prefix>:lock:*`,
//! `<prefix>:epoch`) and the control plane is expected to get a database
//! index of its own. A hard stop deletes exactly the keys it created and
//! never flushes the database, so caches sharing the server are untouched.
//!
//! The hard stop script touches keys it discovers at run time, so it needs a
//! single Redis node (not cluster mode).

use super::{ControlPlane, DispatchUnit, HardStopReport, LockLease};
use crate::Result;
use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, instrument};

const ACQUIRE_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
  redis.call('SADD', KEYS[2], KEYS[1])
  return 1
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const HARD_STOP_SCRIPT: &str = r#"
local discarded = 0
for _, queue in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  discarded = discarded + redis.call('LLEN', queue)
  redis.call('DEL', queue)
end
local cleared = 0
for _, lock in ipairs(redis.call('SMEMBERS', KEYS[2])) do
  cleared = cleared + redis.call('DEL', lock)
end
redis.call('DEL', KEYS[2])
local epoch = redis.call('INCR', KEYS[3])
return {discarded, cleared, epoch}
"#;

/// Longest single sleep while polling an empty queue
const POLL_SLICE: Duration = Duration::from_millis(200);

/// Control plane shared by worker processes through Redis
#[derive(Clone)]
pub struct RedisControlPlane {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisControlPlane {
    /// Connect to Redis. `prefix` namespaces every key this control plane owns.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = ::redis::Client::open(url).map_err(|e| backend("open client", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| backend("connect", e))?;
        Ok(Self::with_connection(conn, prefix))
    }

    pub fn with_connection(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
        }
    }

    fn queue_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.prefix, queue)
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}:lock:{}", self.prefix, name)
    }

    fn queue_registry_key(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    fn lock_registry_key(&self) -> String {
        format!("{}:locks", self.prefix)
    }

    fn epoch_key(&self) -> String {
        format!("{}:epoch", self.prefix)
    }

    /// Round-trip check, run once at startup
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| backend("ping", e))?;
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for RedisControlPlane {
    #[instrument(level = "debug", skip(self, unit), fields(queue = %unit.queue()))]
    async fn enqueue(&self, unit: DispatchUnit) -> Result<()> {
        let key = self.queue_key(&unit.queue());
        let payload = unit.encode()?;
        let mut conn = self.conn.clone();

        let _: () = ::redis::pipe()
            .atomic()
            .sadd(self.queue_registry_key(), &key)
            .ignore()
            .rpush(&key, payload)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| backend("enqueue", e))?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn dequeue(&self, queue: &str, wait: Duration) -> Result<Option<DispatchUnit>> {
        let key = self.queue_key(queue);
        let deadline = tokio::time::Instant::now() + wait;
        let mut conn = self.conn.clone();

        loop {
            let raw: Option<String> = conn
                .lpop(&key, None)
                .await
                .map_err(|e| backend("dequeue", e))?;
            if let Some(raw) = raw {
                return DispatchUnit::decode(&raw).map(Some);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(POLL_SLICE)).await;
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn queue_depth(&self, queue: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let depth: u64 = conn
            .llen(self.queue_key(queue))
            .await
            .map_err(|e| backend("queue depth", e))?;
        Ok(depth)
    }

    #[instrument(level = "debug", skip(self))]
    async fn acquire_lock(&self, name: &str, ttl: Duration) -> Result<Option<LockLease>> {
        let lease = LockLease::new(name);
        let mut conn = self.conn.clone();

        let acquired: i64 = ::redis::Script::new(ACQUIRE_SCRIPT)
            .key(self.lock_key(name))
            .key(self.lock_registry_key())
            .arg(&lease.token)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| backend("acquire lock", e))?;

        Ok((acquired == 1).then_some(lease))
    }

    #[instrument(level = "debug", skip(self, lease), fields(lock = %lease.name))]
    async fn renew_lock(&self, lease: &LockLease, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let renewed: i64 = ::redis::Script::new(RENEW_SCRIPT)
            .key(self.lock_key(&lease.name))
            .arg(&lease.token)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| backend("renew lock", e))?;
        Ok(renewed == 1)
    }

    #[instrument(level = "debug", skip(self, lease), fields(lock = %lease.name))]
    async fn release_lock(&self, lease: &LockLease) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = ::redis::Script::new(RELEASE_SCRIPT)
            .key(self.lock_key(&lease.name))
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| backend("release lock", e))?;
        Ok(deleted == 1)
    }

    async fn epoch(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let epoch: Option<u64> = conn
            .get(self.epoch_key())
            .await
            .map_err(|e| backend("read epoch", e))?;
        Ok(epoch.unwrap_or(0))
    }

    #[instrument(skip(self), fields(prefix = %self.prefix))]
    async fn hard_stop(&self) -> Result<HardStopReport> {
        let mut conn = self.conn.clone();
        let (units_discarded, locks_cleared, epoch): (u64, u64, u64) =
            ::redis::Script::new(HARD_STOP_SCRIPT)
                .key(self.queue_registry_key())
                .key(self.lock_registry_key())
                .key(self.epoch_key())
                .invoke_async(&mut conn)
                .await
                .map_err(|e| backend("hard stop", e))?;

        info!(units_discarded, locks_cleared, epoch, "Control plane reset");
        Ok(HardStopReport {
            units_discarded,
            locks_cleared,
            epoch,
        })
    }
}

fn backend(operation: &str, err: ::redis::RedisError) -> crate::Error {
    crate::Error::ControlPlane(format!("redis {}: {}", operation, err))
}
