//! Redis store backend.
//!
//! Counters map onto plain GET/INCR/PEXPIRE, with a small script that opens a
//! window's counter and its expiry in one step. Locks use the single-instance
//! Redis locking recipe: `SET name token NX PX lease` to acquire and a
//! compare-and-delete script to release, so only the owner can free a lock.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

use super::{CounterStore, LockAttempt, LockToken, StoreError};
use crate::config::RedisConfig;

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const OPEN_COUNTER_SCRIPT: &str = r#"
local count = redis.call("INCR", KEYS[1])
if redis.call("PTTL", KEYS[1]) < 0 then
    redis.call("PEXPIRE", KEYS[1], ARGV[1])
end
return count
"#;

/// A [`CounterStore`] backed by a Redis server.
///
/// Holds one multiplexed, auto-reconnecting connection that is cloned per
/// call, so a single `RedisStore` can be shared by any number of tasks.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    release_script: Script,
    open_counter_script: Script,
    url: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.url)
            .finish()
    }
}

impl RedisStore {
    /// Connect to the server described by `config` and verify it answers.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let url = config.connection_url();
        info!(url = %url, "Connecting to Redis");

        let client = Client::open(url.as_str())?;
        let timeout = config.connect_timeout();
        let conn = tokio::time::timeout(timeout, client.get_connection_manager())
            .await
            .map_err(|_| {
                StoreError::Connection(format!("timed out after {:?} connecting to {}", timeout, url))
            })??;

        let store = Self {
            conn,
            release_script: Script::new(RELEASE_SCRIPT),
            open_counter_script: Script::new(OPEN_COUNTER_SCRIPT),
            url,
        };
        store.ping().await?;

        info!("Redis connection established");
        Ok(store)
    }

    /// Round-trip a PING to the server.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(StoreError::Connection(format!("unexpected PING reply: {}", pong)));
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.incr(key, 1).await?;
        Ok(value)
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let applied: bool = conn.pexpire(key, millis(ttl)).await?;
        if !applied {
            return Err(StoreError::MissingKey(key.to_string()));
        }
        Ok(())
    }

    async fn open_counter(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let count: i64 = self
            .open_counter_script
            .key(key)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn acquire_lock(
        &self,
        name: &str,
        token: &LockToken,
        lease: Duration,
    ) -> Result<LockAttempt, StoreError> {
        let mut conn = self.conn.clone();

        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(millis(lease))
            .query_async(&mut conn)
            .await?;

        match reply {
            Some(_) => Ok(LockAttempt::Acquired),
            None => {
                debug!(lock = %name, "Lock held elsewhere");
                Ok(LockAttempt::Busy)
            }
        }
    }

    async fn release_lock(&self, name: &str, token: &LockToken) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(name)
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;
        if deleted == 0 {
            debug!(lock = %name, "Lock was no longer ours at release");
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

/// Whole milliseconds for PEXPIRE/PX; never zero, which Redis rejects.
fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX).max(1)
}
