//! User identity and store key derivation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A stable caller identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the counter key and lock name for a user.
///
/// Format: `{prefix}user:{id}` for the counter and `{prefix}mutex:user:{id}`
/// for the lock. The two namespaces never overlap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Create a key space under `prefix` (may be empty).
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    /// Key of the user's request counter.
    pub fn counter_key(&self, user: &UserId) -> String {
        format!("{}user:{}", self.prefix, user)
    }

    /// Name of the user's distributed lock.
    pub fn lock_name(&self, user: &UserId) -> String {
        format!("{}mutex:user:{}", self.prefix, user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let keys = KeySpace::default();
        let user = UserId::from(111_i64);

        assert_eq!(keys.counter_key(&user), "user:111");
        assert_eq!(keys.lock_name(&user), "mutex:user:111");
    }

    #[test]
    fn test_prefixed_layout() {
        let keys = KeySpace::new("svc:");
        let user = UserId::from("alice");

        assert_eq!(keys.counter_key(&user), "svc:user:alice");
        assert_eq!(keys.lock_name(&user), "svc:mutex:user:alice");
    }

    #[test]
    fn test_lock_and_counter_never_collide() {
        let keys = KeySpace::default();
        // A user id that tries to look like a lock name still yields a counter key
        let sneaky = UserId::from("x");
        let other = UserId::from(String::from("mutex:user:x"));

        assert_ne!(keys.lock_name(&sneaky), keys.counter_key(&other));
        assert!(keys.counter_key(&other).starts_with("user:"));
        assert!(keys.lock_name(&sneaky).starts_with("mutex:"));
    }

    #[test]
    fn test_user_id_equality() {
        assert_eq!(UserId::from(42_i64), UserId::from("42"));
        assert_eq!(UserId::from(-7_i64).to_string(), "-7");
    }
}
