//! Idempotency key types

use serde::{Deserialize, Serialize};

/// Persisted idempotency key row.
///
/// A key is *held* while `locked_until` lies in the future and the key has
/// not been consumed. A consumed key is terminal: the lock columns are
/// cleared and no further mutation is permitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyKey {
    /// The key itself
    pub key: String,
    /// Unix millis the key was first claimed
    pub created_time: u64,
    /// Sealed by its owner; terminal
    pub is_consumed: bool,
    /// Current lease holder
    pub locked_by: Option<String>,
    /// Lease deadline in unix millis
    pub locked_until: Option<u64>,
}

impl IdempotencyKey {
    /// Whether the key is held by a live lease at `now`.
    pub fn is_held(&self, now: u64) -> bool {
        !self.is_consumed && self.locked_until.map(|until| until > now).unwrap_or(false)
    }
}

/// Result of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now holds the lease
    Acquired,
    /// The key was sealed by a previous holder; the guarded work is done
    AlreadyConsumed,
    /// A live lease belongs to someone else
    LockedByOther,
}
