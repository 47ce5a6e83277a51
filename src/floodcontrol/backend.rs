//! Flood control trait for abstracting checker implementations.

use async_trait::async_trait;

use super::context::CheckContext;
use crate::error::Result;

/// Trait for flood control implementations.
///
/// `Ok(true)` admits the request. A request over the limit is reported as
/// `Err(FloodgateError::QuotaExceeded { .. })` so callers can tell it apart
/// from transient failures by [`ErrorKind`](crate::error::ErrorKind).
#[async_trait]
pub trait FloodControl: Send + Sync {
    /// Check whether `user_id` may make another request now.
    async fn check(&self, ctx: &CheckContext, user_id: i64) -> Result<bool>;
}
