//! Flood control checker backed by the shared counter store.
//!
//! Each check takes the user's distributed lock, reads the user's counter
//! for the current window and either admits the request (incrementing the
//! counter) or denies it (leaving the counter untouched). Counters expire
//! `window` after the first request, so the limit applies per fixed window.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, trace};

use super::backend::FloodControl;
use super::context::CheckContext;
use super::keys::{KeySpace, UserId};
use super::lock::LockClient;
use super::policy::RateLimitPolicy;
use crate::error::{FloodgateError, Result};
use crate::store::{CounterStore, StoreError};

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub user_id: UserId,
    pub admitted: bool,
    /// Counter value after this check
    pub count: i64,
    pub limit: u64,
}

/// Distributed flood control checker.
///
/// Safe to share between tasks; all state lives in the store.
pub struct FloodControlChecker {
    store: Arc<dyn CounterStore>,
    locks: LockClient,
    policy: RateLimitPolicy,
    keys: KeySpace,
}

impl FloodControlChecker {
    /// Create a checker with the default key layout.
    pub fn new(store: Arc<dyn CounterStore>, policy: RateLimitPolicy) -> Self {
        Self::with_key_space(store, policy, KeySpace::default())
    }

    /// Create a checker whose keys live under `keys`.
    pub fn with_key_space(store: Arc<dyn CounterStore>, policy: RateLimitPolicy, keys: KeySpace) -> Self {
        let locks = LockClient::new(Arc::clone(&store), &policy);
        Self {
            store,
            locks,
            policy,
            keys,
        }
    }

    /// Get the policy.
    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Admit or deny one request from `user`.
    ///
    /// Returns `Ok(true)` when admitted and
    /// `Err(FloodgateError::QuotaExceeded)` when the window's quota is used up.
    pub async fn check_user(&self, ctx: &CheckContext, user: &UserId) -> Result<bool> {
        let decision = self.evaluate(ctx, user).await?;
        if decision.admitted {
            Ok(true)
        } else {
            Err(FloodgateError::QuotaExceeded {
                user_id: decision.user_id.to_string(),
                limit: decision.limit,
            })
        }
    }

    /// Like [`check_user`](Self::check_user), but reports a denial as a
    /// [`Decision`] rather than an error.
    pub async fn evaluate(&self, ctx: &CheckContext, user: &UserId) -> Result<Decision> {
        let lock_name = self.keys.lock_name(user);
        let counter_key = self.keys.counter_key(user);

        trace!(
            user = %user,
            backend = self.store.backend_name(),
            "Checking flood control"
        );

        let guard = self.locks.acquire(ctx, &lock_name).await?;
        let outcome = self.update_counter(ctx, user, &counter_key).await;
        guard.release().await;

        outcome
    }

    /// Read and update the counter. Must run with the user's lock held.
    async fn update_counter(&self, ctx: &CheckContext, user: &UserId, key: &str) -> Result<Decision> {
        let limit = self.policy.max_requests_per_window();

        let current = ctx
            .run(self.store.get(key))
            .await
            .map_err(|reason| FloodgateError::Cancelled { reason })??;

        let Some(raw) = current else {
            let count = self.open_window(ctx, key).await?;
            debug!(user = %user, count, window = ?self.policy.window(), "Opened flood control window");
            return Ok(Decision {
                user_id: user.clone(),
                admitted: true,
                count,
                limit,
            });
        };

        let count: i64 = raw.trim().parse().map_err(|_| StoreError::InvalidCounter {
            key: key.to_string(),
            value: raw.clone(),
        })?;

        let max = i64::try_from(limit).unwrap_or(i64::MAX);
        if count.saturating_add(1) > max {
            debug!(user = %user, count, limit, "Flood control limit exceeded");
            return Ok(Decision {
                user_id: user.clone(),
                admitted: false,
                count,
                limit,
            });
        }

        // The expiry is left alone so the window keeps its original end
        let count = ctx
            .run(self.store.increment(key))
            .await
            .map_err(|reason| FloodgateError::Cancelled { reason })??;

        trace!(user = %user, count, limit, "Request admitted");
        Ok(Decision {
            user_id: user.clone(),
            admitted: true,
            count,
            limit,
        })
    }

    /// Create the counter for a new window.
    ///
    /// The store applies the increment and the expiry together, so a
    /// cancellation can never leave a counter that does not reset.
    async fn open_window(&self, ctx: &CheckContext, key: &str) -> Result<i64> {
        let count = ctx
            .run(self.store.open_counter(key, self.policy.window()))
            .await
            .map_err(|reason| FloodgateError::Cancelled { reason })??;
        Ok(count)
    }
}

impl std::fmt::Debug for FloodControlChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FloodControlChecker")
            .field("backend", &self.store.backend_name())
            .field("policy", &self.policy)
            .field("keys", &self.keys)
            .finish()
    }
}

#[async_trait]
impl FloodControl for FloodControlChecker {
    async fn check(&self, ctx: &CheckContext, user_id: i64) -> Result<bool> {
        self.check_user(ctx, &UserId::from(user_id)).await
    }
}
