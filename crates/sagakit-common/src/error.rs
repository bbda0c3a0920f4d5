//! Errors that cross component boundaries.

use uuid::Uuid;

/// Sagakit error
///
/// Two variants are recoverable control-flow signals rather than failures:
/// [`Error::RetryLater`] (a transient conflict, e.g. a step lock held by
/// another worker) and [`Error::LostLease`] (a lease expired mid-work). The
/// outbox worker dispatches on these variants directly so the three
/// dispositions — transient, lost lease, fatal — never depend on string
/// matching. Anything else raised by a step is a permanent failure and
/// triggers compensation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transient conflict; the caller saves its state and the outbox
    /// re-queues with a short delay without counting an attempt.
    #[error("retry later: {0}")]
    RetryLater(String),
    /// A lease expired while the holder was still working. Safe to re-run
    /// because every effect is guarded by a domain idempotency key.
    #[error("lost lease: {0}")]
    LostLease(String),
    /// Business-rule rejection; permanent, triggers compensation.
    #[error("rejected: {0}")]
    Rejected(String),
    /// Cooperative cancellation observed mid-flight.
    #[error("operation cancelled")]
    Cancelled,
    /// Referenced saga does not exist
    #[error("saga {0} not found")]
    SagaNotFound(Uuid),
    /// No driver registered for the persisted saga data type
    #[error("unknown saga data type {0}")]
    UnknownSagaType(String),
    /// The persisted snapshot cannot be deserialized
    #[error("corrupt saga snapshot: {0}")]
    CorruptSnapshot(String),
    /// Database Error
    #[error(transparent)]
    Database(#[from] crate::database::Error),
    /// Serde Error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// Internal Error
    #[error("internal error: {0}")]
    Internal(String),
}
