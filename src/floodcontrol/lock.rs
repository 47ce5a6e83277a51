//! Distributed per-user lock client.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace, warn};

use super::context::CheckContext;
use super::policy::RateLimitPolicy;
use crate::error::{FloodgateError, Result};
use crate::store::{CounterStore, LockAttempt, LockToken};

/// Long-lived client that takes named locks in the shared store.
///
/// One client is owned by each checker and reused for every check; only the
/// [`LockGuard`] is per call.
#[derive(Clone)]
pub struct LockClient {
    store: Arc<dyn CounterStore>,
    attempts: u32,
    retry_interval: Duration,
    retry_jitter: Duration,
    lease: Duration,
}

impl std::fmt::Debug for LockClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockClient")
            .field("backend", &self.store.backend_name())
            .field("attempts", &self.attempts)
            .field("retry_interval", &self.retry_interval)
            .field("lease", &self.lease)
            .finish()
    }
}

impl LockClient {
    /// Create a client using the retry settings of `policy`.
    pub fn new(store: Arc<dyn CounterStore>, policy: &RateLimitPolicy) -> Self {
        Self {
            store,
            attempts: policy.lock_attempts(),
            retry_interval: policy.lock_retry_interval(),
            retry_jitter: policy.retry_jitter(),
            lease: policy.lock_lease(),
        }
    }

    /// Take the named lock, retrying while it is busy.
    ///
    /// Makes at most `lock_retry_limit` attempts with a pause between
    /// consecutive ones. Store failures end the loop immediately.
    ///
    /// If the context ends while an attempt is in flight, the store may still
    /// have granted the lock. The token is known up front, so the lock is
    /// released in the background before `Cancelled` is returned.
    pub async fn acquire(&self, ctx: &CheckContext, name: &str) -> Result<LockGuard> {
        let token = LockToken::generate();

        for attempt in 1..=self.attempts {
            let outcome = match ctx
                .run(self.store.acquire_lock(name, &token, self.lease))
                .await
            {
                Ok(outcome) => outcome?,
                Err(reason) => {
                    debug!(lock = %name, attempt, "Cancelled during lock attempt, releasing");
                    drop(self.guard(name, token));
                    return Err(FloodgateError::Cancelled { reason });
                }
            };

            match outcome {
                LockAttempt::Acquired => {
                    trace!(lock = %name, attempt, "Lock acquired");
                    return Ok(self.guard(name, token));
                }
                LockAttempt::Busy => {
                    debug!(lock = %name, attempt, max_attempts = self.attempts, "Lock busy");
                    if attempt < self.attempts {
                        ctx.run(tokio::time::sleep(self.backoff()))
                            .await
                            .map_err(|reason| FloodgateError::Cancelled { reason })?;
                    }
                }
            }
        }

        Err(FloodgateError::LockTimeout {
            lock: name.to_string(),
            attempts: self.attempts,
        })
    }

    fn guard(&self, name: &str, token: LockToken) -> LockGuard {
        LockGuard {
            store: Arc::clone(&self.store),
            name: name.to_string(),
            token: Some(token),
        }
    }

    fn backoff(&self) -> Duration {
        if self.retry_jitter.is_zero() {
            return self.retry_interval;
        }
        let jitter_ms = u64::try_from(self.retry_jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        self.retry_interval + Duration::from_millis(extra)
    }
}

/// A held lock. Release it with [`LockGuard::release`]; if the guard is
/// dropped instead, the release is spawned onto the current runtime.
pub struct LockGuard {
    store: Arc<dyn CounterStore>,
    name: String,
    token: Option<LockToken>,
}

impl LockGuard {
    /// Name of the held lock.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock. Failures are logged; the lease frees the lock
    /// eventually either way.
    pub async fn release(mut self) {
        if let Some(token) = self.token.take() {
            release(self.store.as_ref(), &self.name, &token).await;
        }
    }
}

async fn release(store: &dyn CounterStore, name: &str, token: &LockToken) {
    match store.release_lock(name, token).await {
        Ok(()) => trace!(lock = %name, "Lock released"),
        Err(e) => warn!(lock = %name, error = %e, "Failed to release lock, waiting for lease expiry"),
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let name = std::mem::take(&mut self.name);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    release(store.as_ref(), &name, &token).await;
                });
            }
            Err(_) => {
                warn!(lock = %name, "Lock guard dropped outside a runtime, waiting for lease expiry");
            }
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("held", &self.token.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::floodcontrol::CancelReason;
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use tokio::time::Instant;

    /// Grants locks like the memory store, then takes `stall` to reply.
    struct SlowGrant {
        inner: MemoryStore,
        stall: Duration,
    }

    #[async_trait]
    impl CounterStore for SlowGrant {
        async fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }

        async fn increment(&self, key: &str) -> std::result::Result<i64, StoreError> {
            self.inner.increment(key).await
        }

        async fn set_expiry(&self, key: &str, ttl: Duration) -> std::result::Result<(), StoreError> {
            self.inner.set_expiry(key, ttl).await
        }

        async fn acquire_lock(
            &self,
            name: &str,
            token: &LockToken,
            lease: Duration,
        ) -> std::result::Result<LockAttempt, StoreError> {
            let attempt = self.inner.acquire_lock(name, token, lease).await?;
            tokio::time::sleep(self.stall).await;
            Ok(attempt)
        }

        async fn release_lock(
            &self,
            name: &str,
            token: &LockToken,
        ) -> std::result::Result<(), StoreError> {
            self.inner.release_lock(name, token).await
        }

        fn backend_name(&self) -> &'static str {
            "slow-grant"
        }
    }

    async fn hold(store: &MemoryStore, lease: Duration) {
        let attempt = store
            .acquire_lock("mutex:user:1", &LockToken::generate(), lease)
            .await
            .unwrap();
        assert_eq!(attempt, LockAttempt::Acquired);
    }

    async fn wait_unlocked(store: &MemoryStore, name: &str) {
        for _ in 0..10 {
            if !store.is_locked(name) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("lock {} still held", name);
    }

    fn policy(limit: u32, interval: Duration) -> RateLimitPolicy {
        RateLimitPolicy::builder()
            .lock_retry_limit(limit)
            .lock_retry_interval(interval)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let store = MemoryStore::new();
        let client = LockClient::new(Arc::new(store.clone()), &policy(3, Duration::from_millis(10)));
        let ctx = CheckContext::background();

        let guard = client.acquire(&ctx, "mutex:user:1").await.unwrap();
        assert_eq!(guard.name(), "mutex:user:1");
        assert!(store.is_locked("mutex:user:1"));

        guard.release().await;
        assert!(!store.is_locked("mutex:user:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_retry_limit() {
        let store = MemoryStore::new();
        hold(&store, Duration::from_secs(60)).await;
        let client = LockClient::new(Arc::new(store), &policy(3, Duration::from_millis(100)));
        let start = Instant::now();

        let err = client
            .acquire(&CheckContext::background(), "mutex:user:1")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FloodgateError::LockTimeout { ref lock, attempts: 3 } if lock == "mutex:user:1"
        ));
        // Two pauses between three attempts
        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquires_once_holder_leaves() {
        let store = MemoryStore::new();
        hold(&store, Duration::from_millis(250)).await;
        let client = LockClient::new(Arc::new(store), &policy(5, Duration::from_millis(100)));

        let guard = client
            .acquire(&CheckContext::background(), "mutex:user:1")
            .await
            .unwrap();
        guard.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_while_waiting() {
        let store = MemoryStore::new();
        hold(&store, Duration::from_secs(60)).await;
        let client = LockClient::new(Arc::new(store), &policy(100, Duration::from_millis(10)));
        let ctx = CheckContext::background().with_timeout(Duration::from_millis(35));

        let err = client.acquire(&ctx, "mutex:user:1").await.unwrap_err();
        assert!(matches!(
            err,
            FloodgateError::Cancelled {
                reason: CancelReason::DeadlineExceeded
            }
        ));
    }

    #[tokio::test]
    async fn test_dropped_guard_releases() {
        let store = MemoryStore::new();
        let client = LockClient::new(Arc::new(store.clone()), &policy(1, Duration::from_millis(10)));

        let guard = client
            .acquire(&CheckContext::background(), "mutex:user:1")
            .await
            .unwrap();
        drop(guard);

        wait_unlocked(&store, "mutex:user:1").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_granted_after_cancel_is_released() {
        let memory = MemoryStore::new();
        let store = SlowGrant {
            inner: memory.clone(),
            stall: Duration::from_secs(30),
        };
        let client = LockClient::new(Arc::new(store), &policy(1, Duration::from_millis(10)));
        let ctx = CheckContext::background().with_timeout(Duration::from_millis(100));

        let err = client.acquire(&ctx, "mutex:user:1").await.unwrap_err();
        assert!(matches!(
            err,
            FloodgateError::Cancelled {
                reason: CancelReason::DeadlineExceeded
            }
        ));

        // The grant landed before the deadline but must not outlive the call
        wait_unlocked(&memory, "mutex:user:1").await;
        let token = LockToken::generate();
        assert_eq!(
            memory
                .acquire_lock("mutex:user:1", &token, Duration::from_secs(8))
                .await
                .unwrap(),
            LockAttempt::Acquired
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_bounds_backoff() {
        let store = MemoryStore::new();
        let policy = RateLimitPolicy::builder()
            .lock_retry_interval(Duration::from_millis(100))
            .retry_jitter(Duration::from_millis(50))
            .build()
            .unwrap();
        let client = LockClient::new(Arc::new(store), &policy);

        for _ in 0..20 {
            let delay = client.backoff();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
