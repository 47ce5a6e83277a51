//! Flood control logic.

mod backend;
mod checker;
mod context;
mod keys;
mod lock;
mod policy;

pub use backend::FloodControl;
pub use checker::{Decision, FloodControlChecker};
pub use context::{CancelHandle, CancelReason, CheckContext};
pub use keys::{KeySpace, UserId};
pub use lock::{LockClient, LockGuard};
pub use policy::{RateLimitPolicy, RateLimitPolicyBuilder, DEFAULT_LOCK_LEASE};
