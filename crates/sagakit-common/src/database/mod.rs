//! Sagakit database traits
//!
//! Storage is split per concern; a backend implements every trait and the
//! composed [`Database`] supertrait. Callers hold a [`DynSagaDatabase`] and
//! stay agnostic of the backend.
//!
//! The atomic primitives here are deliberately coarse: conditional claims
//! report only whether a row was written, and unique-constraint violations
//! surface as [`Error::Duplicate`]. The lease-or-takeover and idempotency
//! classification logic lives above this seam so every backend inherits the
//! same semantics.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::amount::Amount;
use crate::idempotency::IdempotencyKey;
use crate::ledger::LedgerEntry;
use crate::outbox::OutboxMessage;
use crate::saga::SagaSnapshot;

/// Sagakit database error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database Error
    #[error(transparent)]
    Database(Box<dyn std::error::Error + Send + Sync>),
    /// Duplicate entry (unique or primary key violation)
    #[error("Duplicate entry")]
    Duplicate,
    /// Serde Error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// Conversion error reading a row
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    /// A statement placeholder was never bound
    #[error("Missing placeholder {0}")]
    MissingPlaceholder(String),
    /// The backend replied with an unexpected response kind
    #[error("Invalid database response")]
    InvalidDbResponse,
    /// A persisted saga state string is not recognized
    #[error("Invalid saga state {0}")]
    InvalidSagaState(String),
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error converting a database column into a Rust value.
#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    /// Row is shorter than expected
    #[error("Expected {0} columns, got {1}")]
    MissingColumn(usize, usize),
    /// Column holds a different type
    #[error("Expected type {0} in column {1}")]
    InvalidType(String, String),
    /// Value does not convert to the requested type
    #[error("Failed conversion of column {0} into {1}")]
    InvalidConversion(String, String),
    /// Uuid parse failure
    #[error(transparent)]
    Uuid(#[from] uuid::Error),
}

/// Commit or roll back a writer.
#[async_trait]
pub trait DbTransactionFinalizer: Send + Sync {
    /// Consumes the writer committing the changes
    async fn commit(self: Box<Self>) -> Result<(), Error>;
    /// Consumes the writer rolling back all changes
    async fn rollback(self: Box<Self>) -> Result<(), Error>;
}

/// Transaction writer used for the atomic saga + outbox insert.
///
/// Accepting a saga requires both rows to commit together: either the saga
/// exists and will be driven, or neither row exists.
#[async_trait]
pub trait SagaTransaction: DbTransactionFinalizer {
    /// Insert a saga snapshot
    async fn add_saga(&mut self, snapshot: &SagaSnapshot) -> Result<(), Error>;
    /// Insert an outbox message
    async fn add_outbox_message(&mut self, message: &OutboxMessage) -> Result<(), Error>;
}

/// Saga snapshot storage.
#[async_trait]
pub trait SagasDatabase {
    /// Insert or replace a snapshot by id
    async fn upsert_saga(&self, snapshot: &SagaSnapshot) -> Result<(), Error>;
    /// Read a snapshot
    async fn get_saga(&self, id: &Uuid) -> Result<Option<SagaSnapshot>, Error>;
}

/// Outbox message storage.
#[async_trait]
pub trait OutboxDatabase {
    /// Oldest message with no `processed_time` and no live lease at `now`.
    /// Read-only; claiming is a separate conditional update.
    async fn next_outbox_candidate(&self, now: u64) -> Result<Option<OutboxMessage>, Error>;
    /// Conditional claim under lease. Returns `true` iff this caller won:
    /// the update applies only while the message is unprocessed and no other
    /// lease is live at `now`.
    async fn claim_outbox_message(
        &self,
        id: &Uuid,
        worker_id: &str,
        lease_until: u64,
        now: u64,
    ) -> Result<bool, Error>;
    /// Read one message
    async fn get_outbox_message(&self, id: &Uuid) -> Result<Option<OutboxMessage>, Error>;
    /// Finalize a message; terminal
    async fn mark_outbox_processed(&self, id: &Uuid, now: u64) -> Result<(), Error>;
    /// Release a claimed message so it becomes eligible again at `retry_at`.
    /// `last_error` is truncated to the persisted column limit.
    async fn release_outbox_message(
        &self,
        id: &Uuid,
        retry_at: u64,
        increment_attempts: bool,
        last_error: Option<&str>,
    ) -> Result<(), Error>;
}

/// Idempotency key storage.
#[async_trait]
pub trait IdempotencyDatabase {
    /// Atomic insert-or-takeover in a single statement: insert the row, or
    /// overwrite the lock columns of an existing row that is neither
    /// consumed nor held by a live lease at `now`. Returns `true` iff the
    /// lease was written.
    async fn claim_idempotency_key(
        &self,
        key: &str,
        owner_id: &str,
        lease_until: u64,
        now: u64,
    ) -> Result<bool, Error>;
    /// Owner-verified seal: set `is_consumed` and clear the lock columns
    /// only while `locked_by` matches. Returns `true` iff a row changed.
    async fn seal_idempotency_key(&self, key: &str, owner_id: &str) -> Result<bool, Error>;
    /// Diagnostic read
    async fn get_idempotency_key(&self, key: &str) -> Result<Option<IdempotencyKey>, Error>;
}

/// Append-only ledger storage.
#[async_trait]
pub trait LedgerDatabase {
    /// Append an entry. A `reference_id` collision surfaces as
    /// [`Error::Duplicate`].
    async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> Result<(), Error>;
    /// Read the entry occupying a reference id
    async fn get_ledger_entry_by_reference(
        &self,
        reference_id: &str,
    ) -> Result<Option<LedgerEntry>, Error>;
    /// Balance of an account as the sum of all its entry amounts
    async fn ledger_balance(&self, account_id: &str) -> Result<Amount, Error>;
}

/// Sagakit database trait
#[async_trait]
pub trait Database:
    SagasDatabase + OutboxDatabase + IdempotencyDatabase + LedgerDatabase + Debug
{
    /// Begins a transaction
    async fn begin_transaction<'a>(
        &'a self,
    ) -> Result<Box<dyn SagaTransaction + Send + Sync + 'a>, Error>;
}

/// Type-erased backend handle shared across services and workers.
pub type DynSagaDatabase = Arc<dyn Database + Send + Sync>;
