//! Sagakit shared types and functions.
//!
//! This crate is the base foundation of the sagakit workspace. It contains the
//! shared types, traits and common functions that are used across the internal
//! crates: the saga snapshot and its state machine states, the transactional
//! outbox message, the idempotency-key lease row, ledger entries, the error
//! taxonomy that crosses component boundaries, and the storage traits.

pub mod amount;
pub mod database;
pub mod error;
pub mod idempotency;
pub mod ledger;
pub mod outbox;
pub mod saga;
pub mod util;

pub use self::amount::Amount;
pub use self::error::Error;
pub use self::idempotency::{ClaimOutcome, IdempotencyKey};
pub use self::ledger::{LedgerEntry, LedgerEntryKind, LedgerOutcome};
pub use self::outbox::OutboxMessage;
pub use self::saga::{SagaSnapshot, SagaState};
