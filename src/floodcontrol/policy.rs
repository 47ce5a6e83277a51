//! Flood control policy.

use std::time::Duration;

use crate::error::{FloodgateError, Result};

/// Default lock lease, long enough for a handful of store round-trips.
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(8);

/// Limits applied by the checker to every user.
///
/// Built once per process through [`RateLimitPolicy::builder`], which
/// enforces that the limit and the window are non-zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    max_requests_per_window: u64,
    window: Duration,
    lock_retry_limit: u32,
    lock_retry_interval: Duration,
    lock_lease: Duration,
    retry_jitter: Duration,
}

impl RateLimitPolicy {
    /// Start building a policy.
    pub fn builder() -> RateLimitPolicyBuilder {
        RateLimitPolicyBuilder::default()
    }

    /// Requests a user may make within one window.
    pub fn max_requests_per_window(&self) -> u64 {
        self.max_requests_per_window
    }

    /// Lifetime of a user's counter.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Maximum number of lock acquisition attempts.
    pub fn lock_retry_limit(&self) -> u32 {
        self.lock_retry_limit
    }

    /// Pause between lock acquisition attempts.
    pub fn lock_retry_interval(&self) -> Duration {
        self.lock_retry_interval
    }

    /// Store-side expiry of a held lock.
    pub fn lock_lease(&self) -> Duration {
        self.lock_lease
    }

    /// Upper bound on random delay added to each pause.
    pub fn retry_jitter(&self) -> Duration {
        self.retry_jitter
    }

    /// Attempts actually made; a zero limit still tries once.
    pub fn lock_attempts(&self) -> u32 {
        self.lock_retry_limit.max(1)
    }
}

/// Builder for [`RateLimitPolicy`].
#[derive(Debug, Clone)]
pub struct RateLimitPolicyBuilder {
    max_requests_per_window: u64,
    window: Duration,
    lock_retry_limit: u32,
    lock_retry_interval: Duration,
    lock_lease: Duration,
    retry_jitter: Duration,
}

impl Default for RateLimitPolicyBuilder {
    fn default() -> Self {
        Self {
            max_requests_per_window: 10,
            window: Duration::from_secs(60),
            lock_retry_limit: 5,
            lock_retry_interval: Duration::from_millis(100),
            lock_lease: DEFAULT_LOCK_LEASE,
            retry_jitter: Duration::ZERO,
        }
    }
}

impl RateLimitPolicyBuilder {
    pub fn max_requests_per_window(mut self, max: u64) -> Self {
        self.max_requests_per_window = max;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn lock_retry_limit(mut self, limit: u32) -> Self {
        self.lock_retry_limit = limit;
        self
    }

    pub fn lock_retry_interval(mut self, interval: Duration) -> Self {
        self.lock_retry_interval = interval;
        self
    }

    pub fn lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    pub fn retry_jitter(mut self, jitter: Duration) -> Self {
        self.retry_jitter = jitter;
        self
    }

    /// Validate and build the policy.
    pub fn build(self) -> Result<RateLimitPolicy> {
        if self.max_requests_per_window == 0 {
            return Err(FloodgateError::Config(
                "max_number_of_requests must be greater than zero".to_string(),
            ));
        }
        if self.window.is_zero() {
            return Err(FloodgateError::Config(
                "flood_control_ttl must be greater than zero".to_string(),
            ));
        }
        if self.lock_lease.is_zero() {
            return Err(FloodgateError::Config(
                "lock_lease must be greater than zero".to_string(),
            ));
        }

        Ok(RateLimitPolicy {
            max_requests_per_window: self.max_requests_per_window,
            window: self.window,
            lock_retry_limit: self.lock_retry_limit,
            lock_retry_interval: self.lock_retry_interval,
            lock_lease: self.lock_lease,
            retry_jitter: self.retry_jitter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let policy = RateLimitPolicy::builder().build().unwrap();
        assert_eq!(policy.max_requests_per_window(), 10);
        assert_eq!(policy.window(), Duration::from_secs(60));
        assert_eq!(policy.lock_lease(), DEFAULT_LOCK_LEASE);
        assert_eq!(policy.retry_jitter(), Duration::ZERO);
    }

    #[test]
    fn test_zero_limit_rejected() {
        let err = RateLimitPolicy::builder()
            .max_requests_per_window(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, FloodgateError::Config(_)));
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(RateLimitPolicy::builder()
            .window(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_zero_lease_rejected() {
        assert!(RateLimitPolicy::builder()
            .lock_lease(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_lock_attempts_floor() {
        let policy = RateLimitPolicy::builder().lock_retry_limit(0).build().unwrap();
        assert_eq!(policy.lock_retry_limit(), 0);
        assert_eq!(policy.lock_attempts(), 1);

        let policy = RateLimitPolicy::builder().lock_retry_limit(4).build().unwrap();
        assert_eq!(policy.lock_attempts(), 4);
    }
}
