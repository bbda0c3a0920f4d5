//! Step contract.

use async_trait::async_trait;
use sagakit_common::Error;
use tokio_util::sync::CancellationToken;

/// A single forward action of a saga together with its semantic undo.
///
/// Both `execute` and `compensate` must be idempotent: the outbox delivers
/// at-least-once, so either may run again after a crash or an expired lease.
/// The usual recipe is a technical step lock (claimed through the
/// idempotency store, lease at least twice the expected execution time)
/// combined with a separate domain idempotency key passed to the effectful
/// collaborator, so the effect stays safe even across lease expiry.
///
/// Error contract: [`Error::RetryLater`] and [`Error::LostLease`] are
/// recoverable and make the outbox re-queue the saga; any other error is a
/// permanent step failure and triggers compensation.
#[async_trait]
pub trait SagaStep<D>: Send + Sync {
    /// Step name; also used to derive the technical step-lock key.
    fn name(&self) -> &str;

    /// Performs the step's effect on `data`.
    async fn execute(&self, data: &mut D, cancel: &CancellationToken) -> Result<(), Error>;

    /// Semantically undoes a previously executed step. Need not restore
    /// byte-exact state.
    async fn compensate(&self, data: &mut D, cancel: &CancellationToken) -> Result<(), Error>;
}
