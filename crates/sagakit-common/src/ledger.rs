//! Ledger types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::amount::Amount;
use crate::util::unix_time_millis;

/// Kind of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerEntryKind {
    /// Negative amount
    Debit,
    /// Positive amount
    Credit,
    /// Zero-amount tombstone occupying a reference id so that no other entry
    /// can ever be written under the same key
    AbortMarker,
}

impl LedgerEntryKind {
    /// Integer representation persisted in the `kind` column.
    pub fn to_i64(self) -> i64 {
        match self {
            LedgerEntryKind::Debit => 0,
            LedgerEntryKind::Credit => 1,
            LedgerEntryKind::AbortMarker => 2,
        }
    }
}

impl TryFrom<i64> for LedgerEntryKind {
    type Error = crate::database::Error;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LedgerEntryKind::Debit),
            1 => Ok(LedgerEntryKind::Credit),
            2 => Ok(LedgerEntryKind::AbortMarker),
            other => Err(crate::database::Error::Internal(format!(
                "unknown ledger entry kind {other}"
            ))),
        }
    }
}

/// Append-only ledger row.
///
/// `reference_id` is globally unique; the unique constraint is the
/// last-resort serialization of financial effect when two writers race.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entry id
    pub id: Uuid,
    /// Account the amount applies to
    pub account_id: String,
    /// Signed amount; negative for debits, zero for abort markers
    pub amount: Amount,
    /// Entry kind
    pub kind: LedgerEntryKind,
    /// Caller-supplied idempotency key; unique across the ledger
    pub reference_id: String,
    /// Unix millis the entry was appended
    pub created_time: u64,
    /// Free-form annotation
    pub reason: Option<String>,
}

impl LedgerEntry {
    /// New entry with a fresh id and the current time.
    pub fn new(
        account_id: impl Into<String>,
        amount: Amount,
        kind: LedgerEntryKind,
        reference_id: impl Into<String>,
        reason: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.into(),
            amount,
            kind,
            reference_id: reference_id.into(),
            created_time: unix_time_millis(),
            reason,
        }
    }
}

/// Outcome of an idempotent ledger operation.
///
/// Every operation behaves identically on the first call and on any repeat
/// call with the same idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    /// The entry was appended by this call
    Success,
    /// An identical entry was already present; the effect happened earlier
    IdempotentSuccess,
    /// The key is occupied by an incompatible entry; retry may resolve it
    Conflict,
    /// The operation must never apply (overdraft, or tombstoned key)
    Rejected,
}
