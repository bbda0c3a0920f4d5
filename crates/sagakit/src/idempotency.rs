//! Idempotency store: lease-or-takeover on named keys.

use std::time::Duration;

use sagakit_common::database::{DynSagaDatabase, IdempotencyDatabase};
use sagakit_common::idempotency::ClaimOutcome;
use sagakit_common::util::unix_time_millis;
use sagakit_common::Error;
use tracing::instrument;

/// Lease-based exclusive ownership of named keys.
///
/// The lease model (rather than blocking locks) permits crash recovery
/// without reaching the stalled worker: once a lease lapses, any other
/// worker takes the key over. Ownership verification on
/// [`complete`](Self::complete) prevents a stale, resumed worker from
/// sealing over a newer holder's work.
#[derive(Debug, Clone)]
pub struct IdempotencyStore {
    db: DynSagaDatabase,
}

impl IdempotencyStore {
    /// New store over `db`.
    pub fn new(db: DynSagaDatabase) -> Self {
        Self { db }
    }

    /// Atomic insert-or-takeover of `key` for `owner_id`.
    ///
    /// The claim itself is a single atomic statement against the store. The
    /// reason-for-failure read below is a separate diagnostic read; that is
    /// acceptable because the caller's only reaction to either answer is to
    /// stop.
    #[instrument(skip(self))]
    pub async fn try_claim(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<ClaimOutcome, Error> {
        let now = unix_time_millis();
        let lease_until = now + ttl.as_millis() as u64;

        if self
            .db
            .claim_idempotency_key(key, owner_id, lease_until, now)
            .await?
        {
            return Ok(ClaimOutcome::Acquired);
        }

        match self.db.get_idempotency_key(key).await? {
            Some(existing) if existing.is_consumed => Ok(ClaimOutcome::AlreadyConsumed),
            _ => Ok(ClaimOutcome::LockedByOther),
        }
    }

    /// Seals `key`, verifying `owner_id` still holds the lease.
    ///
    /// Sealing an already consumed key is an idempotent success. Anything
    /// else means the lease lapsed mid-work — the TTL was too short or the
    /// process stalled — and surfaces as [`Error::LostLease`].
    #[instrument(skip(self))]
    pub async fn complete(&self, key: &str, owner_id: &str) -> Result<(), Error> {
        if self.db.seal_idempotency_key(key, owner_id).await? {
            return Ok(());
        }

        if self.is_consumed(key).await? {
            return Ok(());
        }

        Err(Error::LostLease(format!(
            "lease on {key} lapsed before completion"
        )))
    }

    /// Whether `key` has been sealed. Diagnostic read.
    pub async fn is_consumed(&self, key: &str) -> Result<bool, Error> {
        Ok(self
            .db
            .get_idempotency_key(key)
            .await?
            .map(|key| key.is_consumed)
            .unwrap_or(false))
    }
}
