//! In-process store backend.
//!
//! Only shares state between callers holding the same `MemoryStore`, so it is
//! meant for tests and single-process deployments. Expiry uses tokio's clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::trace;

use super::{CounterStore, LockAttempt, LockToken, StoreError};

/// Map size above which writes sweep out expired entries.
const PURGE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone)]
struct CounterEntry {
    value: i64,
    expires_at: Option<Instant>,
}

impl CounterEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    token: LockToken,
    expires_at: Instant,
}

impl LockEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// A [`CounterStore`] held in process memory.
///
/// Expired entries are dropped when their key is touched, and swept from the
/// whole map once it grows past a threshold that doubles with the live size.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    counters: Arc<DashMap<String, CounterEntry>>,
    locks: Arc<DashMap<String, LockEntry>>,
    /// Map size that triggers the next sweep
    purge_at: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Time left before `key` expires, `None` if absent or without expiry.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entry = self.counters.get(key)?;
        if entry.is_expired(now) {
            return None;
        }
        entry.expires_at.map(|at| at - now)
    }

    /// Whether the named lock is currently held by anyone.
    pub fn is_locked(&self, name: &str) -> bool {
        let now = Instant::now();
        self.locks
            .get(name)
            .is_some_and(|lock| !lock.is_expired(now))
    }

    /// Store a raw value, bypassing the counter semantics.
    pub fn put_raw(&self, key: &str, value: i64) {
        self.counters.insert(
            key.to_string(),
            CounterEntry {
                value,
                expires_at: None,
            },
        );
    }

    /// Number of live counters.
    pub fn counter_count(&self) -> usize {
        let now = Instant::now();
        self.counters.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Drop every expired counter and lapsed lock.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.counters.retain(|_, entry| !entry.is_expired(now));
        self.locks.retain(|_, lock| !lock.is_expired(now));

        let live = self.counters.len().max(self.locks.len());
        self.purge_at
            .store(PURGE_THRESHOLD.max(live * 2), Ordering::Relaxed);
        trace!(counters = self.counters.len(), locks = self.locks.len(), "Purged expired entries");
    }

    /// Sweep if either map has outgrown the current threshold. Must not be
    /// called while holding a map reference.
    fn maybe_purge(&self) {
        let limit = self.purge_at.load(Ordering::Relaxed).max(PURGE_THRESHOLD);
        if self.counters.len() >= limit || self.locks.len() >= limit {
            self.purge_expired();
        }
    }

    fn bump(&self, key: &str, ttl: Option<Duration>) -> i64 {
        self.maybe_purge();
        let now = Instant::now();
        let fresh = || CounterEntry {
            value: 1,
            expires_at: ttl.map(|ttl| now + ttl),
        };

        let value = match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = fresh();
                } else {
                    entry.value += 1;
                    if entry.expires_at.is_none() {
                        entry.expires_at = ttl.map(|ttl| now + ttl);
                    }
                }
                entry.value
            }
            Entry::Vacant(vacant) => vacant.insert(fresh()).value,
        };
        trace!(key = %key, value, "Incremented counter");
        value
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        self.counters.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(self.counters.get(key).map(|entry| entry.value.to_string()))
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self.bump(key, None))
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        match self.counters.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(())
            }
            _ => Err(StoreError::MissingKey(key.to_string())),
        }
    }

    async fn open_counter(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        Ok(self.bump(key, Some(ttl)))
    }

    async fn acquire_lock(
        &self,
        name: &str,
        token: &LockToken,
        lease: Duration,
    ) -> Result<LockAttempt, StoreError> {
        self.maybe_purge();
        let now = Instant::now();
        let fresh = LockEntry {
            token: token.clone(),
            expires_at: now + lease,
        };

        match self.locks.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(now) {
                    return Ok(LockAttempt::Busy);
                }
                occupied.insert(fresh);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
            }
        }
        Ok(LockAttempt::Acquired)
    }

    async fn release_lock(&self, name: &str, token: &LockToken) -> Result<(), StoreError> {
        self.locks.remove_if(name, |_, lock| &lock.token == token);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
