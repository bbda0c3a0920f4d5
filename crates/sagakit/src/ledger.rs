//! Ledger service: idempotent debit/credit with refund and tombstone
//! semantics.

use sagakit_common::database::{self, DynSagaDatabase, LedgerDatabase};
use sagakit_common::ledger::{LedgerEntry, LedgerEntryKind, LedgerOutcome};
use sagakit_common::{Amount, Error};
use tracing::instrument;

/// Attempt budget for [`LedgerService::try_compensate_debit`].
const COMPENSATE_MAX_ATTEMPTS: usize = 5;

/// Idempotent ledger over append-only entries.
///
/// Every operation takes an idempotency key and behaves identically on the
/// first call and any repeat call with the same key; the unique constraint
/// on `reference_id` is the last-resort serialization when two writers race.
///
/// Balances are computed by summing all entries of an account. That is the
/// correctness truth, not a scalable strategy; a production deployment
/// should maintain a balance row with optimistic concurrency or periodic
/// snapshots.
#[derive(Debug, Clone)]
pub struct LedgerService {
    db: DynSagaDatabase,
    overdraft_limit: Amount,
}

impl LedgerService {
    /// New service over `db`. `overdraft_limit` is the lowest balance a
    /// debit may leave behind (usually negative).
    pub fn new(db: DynSagaDatabase, overdraft_limit: Amount) -> Self {
        Self {
            db,
            overdraft_limit,
        }
    }

    /// Debits `account_id` by `amount` under `key`.
    ///
    /// A tombstoned key means a compensation already decided this debit must
    /// never apply, no matter how late the message arrives.
    #[instrument(skip(self))]
    pub async fn try_debit(
        &self,
        account_id: &str,
        amount: Amount,
        key: &str,
    ) -> Result<LedgerOutcome, Error> {
        let amount = amount.abs();

        if let Some(existing) = self.db.get_ledger_entry_by_reference(key).await? {
            return Ok(classify_debit(&existing));
        }

        let balance = self.db.ledger_balance(account_id).await?;
        let Some(after) = balance.checked_sub(amount) else {
            return Ok(LedgerOutcome::Rejected);
        };
        if after < self.overdraft_limit {
            tracing::info!(
                "Debit of {} for {} rejected: balance {} would breach overdraft limit {}",
                amount,
                account_id,
                balance,
                self.overdraft_limit
            );
            return Ok(LedgerOutcome::Rejected);
        }

        let entry = LedgerEntry::new(account_id, amount.neg(), LedgerEntryKind::Debit, key, None);
        match self.db.insert_ledger_entry(&entry).await {
            Ok(()) => Ok(LedgerOutcome::Success),
            Err(database::Error::Duplicate) => {
                // Another writer raced us in; re-read and classify.
                match self.db.get_ledger_entry_by_reference(key).await? {
                    Some(existing) => Ok(classify_debit(&existing)),
                    None => Ok(LedgerOutcome::Conflict),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Credits `account_id` by `amount` under `key`. No balance check; a
    /// credit under a tombstoned key is a conflict.
    #[instrument(skip(self))]
    pub async fn try_credit(
        &self,
        account_id: &str,
        amount: Amount,
        key: &str,
    ) -> Result<LedgerOutcome, Error> {
        let amount = amount.abs();

        if let Some(existing) = self.db.get_ledger_entry_by_reference(key).await? {
            return Ok(classify_credit(&existing));
        }

        let entry = LedgerEntry::new(account_id, amount, LedgerEntryKind::Credit, key, None);
        match self.db.insert_ledger_entry(&entry).await {
            Ok(()) => Ok(LedgerOutcome::Success),
            Err(database::Error::Duplicate) => {
                match self.db.get_ledger_entry_by_reference(key).await? {
                    Some(existing) => Ok(classify_credit(&existing)),
                    None => Ok(LedgerOutcome::Conflict),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Compensates a debit issued under `original_key`.
    ///
    /// Safe against every order of (debit arrives, compensation arrives,
    /// both retry):
    /// - the debit exists — refund it under `"Refund_" + original_key`;
    /// - no entry exists — occupy the key with a zero-amount tombstone so a
    ///   delayed debit can never apply after this compensation decided
    ///   there was nothing to refund;
    /// - every constraint violation re-loops, because a debit may have
    ///   raced in between the read and the write.
    #[instrument(skip(self))]
    pub async fn try_compensate_debit(
        &self,
        account_id: &str,
        amount: Amount,
        original_key: &str,
    ) -> Result<LedgerOutcome, Error> {
        let refund_key = format!("Refund_{original_key}");

        for _ in 0..COMPENSATE_MAX_ATTEMPTS {
            match self.db.get_ledger_entry_by_reference(original_key).await? {
                Some(existing) if existing.kind == LedgerEntryKind::AbortMarker => {
                    return Ok(LedgerOutcome::IdempotentSuccess);
                }
                Some(existing) if existing.kind == LedgerEntryKind::Debit => {
                    if let Some(refund) =
                        self.db.get_ledger_entry_by_reference(&refund_key).await?
                    {
                        if refund.kind == LedgerEntryKind::Credit {
                            return Ok(LedgerOutcome::IdempotentSuccess);
                        }
                        return Ok(LedgerOutcome::Conflict);
                    }

                    let refund = LedgerEntry::new(
                        account_id,
                        amount.abs(),
                        LedgerEntryKind::Credit,
                        refund_key.as_str(),
                        Some(format!("Refund of {original_key}")),
                    );
                    match self.db.insert_ledger_entry(&refund).await {
                        Ok(()) => return Ok(LedgerOutcome::Success),
                        Err(database::Error::Duplicate) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
                Some(_) => return Ok(LedgerOutcome::Conflict),
                None => {
                    let tombstone = LedgerEntry::new(
                        account_id,
                        Amount::ZERO,
                        LedgerEntryKind::AbortMarker,
                        original_key,
                        Some("Compensated before the debit arrived".to_string()),
                    );
                    match self.db.insert_ledger_entry(&tombstone).await {
                        Ok(()) => return Ok(LedgerOutcome::Success),
                        // A debit raced in; the next iteration refunds it.
                        Err(database::Error::Duplicate) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }

        Ok(LedgerOutcome::Conflict)
    }

    /// Current balance of `account_id` (sum of all its entries).
    pub async fn balance(&self, account_id: &str) -> Result<Amount, Error> {
        Ok(self.db.ledger_balance(account_id).await?)
    }
}

fn classify_debit(existing: &LedgerEntry) -> LedgerOutcome {
    match existing.kind {
        LedgerEntryKind::Debit => LedgerOutcome::IdempotentSuccess,
        LedgerEntryKind::AbortMarker => LedgerOutcome::Rejected,
        LedgerEntryKind::Credit => LedgerOutcome::Conflict,
    }
}

fn classify_credit(existing: &LedgerEntry) -> LedgerOutcome {
    match existing.kind {
        LedgerEntryKind::Credit => LedgerOutcome::IdempotentSuccess,
        LedgerEntryKind::Debit | LedgerEntryKind::AbortMarker => LedgerOutcome::Conflict,
    }
}
