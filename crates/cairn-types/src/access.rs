//! Per-bucket access control bitmask.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

bitflags! {
    /// Access permissions persisted per bucket.
    ///
    /// The raw value travels as an integer; unknown bits are preserved so
    /// masks written by newer software survive a round trip through older
    /// nodes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct AccessAttrs: u64 {
        const GET           = 1 << 0;
        const HEAD_OBJECT   = 1 << 1;
        const PUT           = 1 << 2;
        const APPEND        = 1 << 3;
        const DOWNLOAD      = 1 << 4;
        const DELETE_OBJECT = 1 << 5;
        const RENAME_OBJECT = 1 << 6;
        const PROMOTE       = 1 << 7;
        const HEAD_BUCKET   = 1 << 8;
        const LIST_OBJECTS  = 1 << 9;
        const RENAME_BUCKET = 1 << 10;
        const PATCH         = 1 << 11;
        const MAKE_NCOPIES  = 1 << 12;
        const EC            = 1 << 13;
        const SYNC_BUCKET   = 1 << 14;
        const DELETE_BUCKET = 1 << 15;
        const CREATE_BUCKET = 1 << 16;
        const LIST_BUCKETS  = 1 << 17;
        const ADMIN         = 1 << 18;

        const _ = !0;
    }
}

impl Default for AccessAttrs {
    fn default() -> Self {
        Self::empty()
    }
}

impl AccessAttrs {
    /// Read-only object operations.
    pub fn ro() -> Self {
        Self::GET | Self::HEAD_OBJECT | Self::HEAD_BUCKET | Self::LIST_OBJECTS | Self::LIST_BUCKETS
    }

    /// Everything except cluster administration.
    pub fn rw() -> Self {
        Self::all() & !Self::ADMIN
    }
}

/// Rejected access-mask mutation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessError {
    /// The action verb was neither `allow` nor `deny`.
    #[error("invalid access action {0:?} (expected \"allow\" or \"deny\")")]
    InvalidAction(String),
}

/// Produces a new mask with `bits` allowed or denied.
///
/// Any action other than `"allow"` or `"deny"` is rejected.
pub fn modify_access(
    cur: AccessAttrs,
    action: &str,
    bits: AccessAttrs,
) -> Result<AccessAttrs, AccessError> {
    match action {
        "allow" => Ok(cur | bits),
        "deny" => Ok(cur & !bits),
        other => Err(AccessError::InvalidAction(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_allow_then_deny_equals_deny() {
        let m = AccessAttrs::ro();
        let b = AccessAttrs::PUT | AccessAttrs::GET;

        let allowed = modify_access(m, "allow", b).unwrap();
        let lhs = modify_access(allowed, "deny", b).unwrap();
        let rhs = modify_access(m, "deny", b).unwrap();
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn test_invalid_action_rejected() {
        let err = modify_access(AccessAttrs::ro(), "grant", AccessAttrs::GET).unwrap_err();
        assert_eq!(err, AccessError::InvalidAction("grant".to_string()));
    }

    #[test]
    fn test_unknown_bits_survive() {
        let future_bit = AccessAttrs::from_bits_retain(1 << 40);
        let m = AccessAttrs::ro() | future_bit;

        let out = modify_access(m, "deny", AccessAttrs::GET).unwrap();
        assert!(out.contains(future_bit));
    }

    proptest! {
        #[test]
        fn prop_allow_deny_equals_deny(m in any::<u64>(), b in any::<u64>()) {
            let m = AccessAttrs::from_bits_retain(m);
            let b = AccessAttrs::from_bits_retain(b);

            let lhs = modify_access(modify_access(m, "allow", b).unwrap(), "deny", b).unwrap();
            let rhs = modify_access(m, "deny", b).unwrap();
            prop_assert_eq!(lhs, rhs);
        }

        #[test]
        fn prop_allow_is_idempotent(m in any::<u64>(), b in any::<u64>()) {
            let m = AccessAttrs::from_bits_retain(m);
            let b = AccessAttrs::from_bits_retain(b);

            let once = modify_access(m, "allow", b).unwrap();
            let twice = modify_access(once, "allow", b).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
