//! Shared counter store.
//!
//! The flood control checker keeps no state of its own: counters and the
//! per-user locks both live in an external key-value store so that every
//! process sharing the store sees the same view. This module defines the
//! small contract the checker needs from such a store, plus two backends.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by a [`CounterStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is unreachable or answered with a protocol-level failure.
    #[error("store connection failed: {0}")]
    Connection(String),

    /// The key an operation expected to exist was absent.
    #[error("key not found: {0}")]
    MissingKey(String),

    /// A counter held something other than an integer.
    #[error("counter {key} holds a non-integer value: {value:?}")]
    InvalidCounter { key: String, value: String },
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        StoreError::Connection(err.to_string())
    }
}

/// Proof of lock ownership.
///
/// The caller creates the token before asking for the lock, so it can still
/// release a lock whose acquisition reply never arrived. Releasing with a
/// token that no longer matches the stored one is a no-op, so a caller whose
/// lease expired can never free someone else's lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Create a fresh random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The token as stored.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a single lock acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    /// The lock is ours until released or until the lease runs out.
    Acquired,
    /// Someone else currently holds the lock.
    Busy,
}

/// Key-value store operations consumed by the flood control checker.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read the raw value at `key`, `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Atomically add one to `key`, creating it at 1 if absent.
    async fn increment(&self, key: &str) -> Result<i64, StoreError>;

    /// Set or refresh the time-to-live of an existing key.
    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Create or bump the counter of a new window, giving it `ttl` if it has
    /// no expiry yet.
    ///
    /// Backends should apply both halves atomically; this default does not
    /// and exists for stores without a way to do so.
    async fn open_counter(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let count = self.increment(key).await?;
        self.set_expiry(key, ttl).await?;
        Ok(count)
    }

    /// Try once to take the named lock for `token`, for at most `lease`.
    async fn acquire_lock(
        &self,
        name: &str,
        token: &LockToken,
        lease: Duration,
    ) -> Result<LockAttempt, StoreError>;

    /// Release the named lock if `token` still owns it.
    async fn release_lock(&self, name: &str, token: &LockToken) -> Result<(), StoreError>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}
