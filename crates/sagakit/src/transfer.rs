//! Transfer saga: debit the sender, credit the receiver.
//!
//! The canonical two-step use case. Each step follows the same recipe: claim
//! a technical step lock through the idempotency store, perform the ledger
//! effect under a separate domain idempotency key, translate the outcome,
//! and seal the lock. The lock is never released manually on failure — the
//! lease expires on its own, and the domain key keeps the effect safe in the
//! meantime.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sagakit_common::database::DynSagaDatabase;
use sagakit_common::idempotency::ClaimOutcome;
use sagakit_common::ledger::LedgerOutcome;
use sagakit_common::{Amount, Error};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::idempotency::IdempotencyStore;
use crate::ledger::LedgerService;
use crate::registry::TypedSagaDriver;
use crate::repository::SagaRepository;
use crate::step::SagaStep;

/// `data_type` tag for transfer sagas.
pub const TRANSFER_DATA_TYPE: &str = "Transfer";

/// Largest single transfer the receiver-side business rule accepts.
pub const AML_SINGLE_TRANSFER_LIMIT: Amount = Amount::new(100_000);

/// Data carried by a transfer saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TransferData {
    /// Owning saga; step keys are derived from it
    pub saga_id: Uuid,
    /// Account to debit
    pub from_user_id: String,
    /// Account to credit
    pub to_user_id: String,
    /// Transfer amount
    pub amount: Amount,
}

/// Debits the sender account.
pub struct DebitSenderStep {
    ledger: LedgerService,
    locks: IdempotencyStore,
    step_lease: Duration,
}

impl DebitSenderStep {
    /// New step. `step_lease` should be at least twice the expected
    /// execution time.
    pub fn new(ledger: LedgerService, locks: IdempotencyStore, step_lease: Duration) -> Self {
        Self {
            ledger,
            locks,
            step_lease,
        }
    }
}

#[async_trait]
impl SagaStep<TransferData> for DebitSenderStep {
    fn name(&self) -> &str {
        "Debit"
    }

    async fn execute(
        &self,
        data: &mut TransferData,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let step_key = format!("{}_Step_Lock_{}", self.name(), data.saga_id);
        let owner_id = format!("debit-{}", Uuid::new_v4());

        match self
            .locks
            .try_claim(&step_key, &owner_id, self.step_lease)
            .await?
        {
            ClaimOutcome::AlreadyConsumed => return Ok(()),
            ClaimOutcome::LockedByOther => {
                return Err(Error::RetryLater(format!(
                    "step lock {step_key} is held by another worker"
                )))
            }
            ClaimOutcome::Acquired => {}
        }

        let domain_key = format!("Debit_{}", data.saga_id);
        match self
            .ledger
            .try_debit(&data.from_user_id, data.amount, &domain_key)
            .await?
        {
            LedgerOutcome::Success | LedgerOutcome::IdempotentSuccess => {}
            LedgerOutcome::Conflict => {
                return Err(Error::RetryLater(format!(
                    "ledger conflict on {domain_key}"
                )))
            }
            LedgerOutcome::Rejected => {
                return Err(Error::Rejected(format!(
                    "debit of {} for {} refused",
                    data.amount, data.from_user_id
                )))
            }
        }

        self.locks.complete(&step_key, &owner_id).await?;
        Ok(())
    }

    async fn compensate(
        &self,
        data: &mut TransferData,
        _cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let domain_key = format!("Debit_{}", data.saga_id);
        match self
            .ledger
            .try_compensate_debit(&data.from_user_id, data.amount, &domain_key)
            .await?
        {
            LedgerOutcome::Success | LedgerOutcome::IdempotentSuccess => Ok(()),
            LedgerOutcome::Conflict => Err(Error::RetryLater(format!(
                "compensation of {domain_key} is contended"
            ))),
            LedgerOutcome::Rejected => Err(Error::Rejected(format!(
                "compensation of {domain_key} refused"
            ))),
        }
    }
}

/// Credits the receiver account.
///
/// Carries the anti-money-laundering rule: transfers above
/// [`AML_SINGLE_TRANSFER_LIMIT`] are refused before any ledger effect,
/// which fails the saga permanently and triggers compensation of the debit.
pub struct CreditReceiverStep {
    ledger: LedgerService,
    locks: IdempotencyStore,
    step_lease: Duration,
}

impl CreditReceiverStep {
    /// New step.
    pub fn new(ledger: LedgerService, locks: IdempotencyStore, step_lease: Duration) -> Self {
        Self {
            ledger,
            locks,
            step_lease,
        }
    }
}

#[async_trait]
impl SagaStep<TransferData> for CreditReceiverStep {
    fn name(&self) -> &str {
        "Credit"
    }

    async fn execute(
        &self,
        data: &mut TransferData,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if data.amount.abs() > AML_SINGLE_TRANSFER_LIMIT {
            return Err(Error::Rejected(format!(
                "transfer of {} exceeds the single-transfer limit {}",
                data.amount, AML_SINGLE_TRANSFER_LIMIT
            )));
        }

        let step_key = format!("{}_Step_Lock_{}", self.name(), data.saga_id);
        let owner_id = format!("credit-{}", Uuid::new_v4());

        match self
            .locks
            .try_claim(&step_key, &owner_id, self.step_lease)
            .await?
        {
            ClaimOutcome::AlreadyConsumed => return Ok(()),
            ClaimOutcome::LockedByOther => {
                return Err(Error::RetryLater(format!(
                    "step lock {step_key} is held by another worker"
                )))
            }
            ClaimOutcome::Acquired => {}
        }

        let domain_key = format!("Credit_{}", data.saga_id);
        match self
            .ledger
            .try_credit(&data.to_user_id, data.amount, &domain_key)
            .await?
        {
            LedgerOutcome::Success | LedgerOutcome::IdempotentSuccess => {}
            LedgerOutcome::Conflict => {
                return Err(Error::RetryLater(format!(
                    "ledger conflict on {domain_key}"
                )))
            }
            LedgerOutcome::Rejected => {
                return Err(Error::Rejected(format!(
                    "credit of {} for {} refused",
                    data.amount, data.to_user_id
                )))
            }
        }

        self.locks.complete(&step_key, &owner_id).await?;
        Ok(())
    }

    async fn compensate(
        &self,
        data: &mut TransferData,
        _cancel: &CancellationToken,
    ) -> Result<(), Error> {
        // Undo an applied credit by debiting it back under a derived key.
        let refund_key = format!("Refund_Credit_{}", data.saga_id);
        match self
            .ledger
            .try_debit(&data.to_user_id, data.amount, &refund_key)
            .await?
        {
            LedgerOutcome::Success | LedgerOutcome::IdempotentSuccess => Ok(()),
            LedgerOutcome::Conflict => Err(Error::RetryLater(format!(
                "reversal conflict on {refund_key}"
            ))),
            LedgerOutcome::Rejected => Err(Error::Rejected(format!(
                "reversal of {refund_key} refused"
            ))),
        }
    }
}

/// Step list for transfer sagas, in execution order.
pub fn transfer_steps(
    ledger: LedgerService,
    locks: IdempotencyStore,
    step_lease: Duration,
) -> Vec<Arc<dyn SagaStep<TransferData>>> {
    vec![
        Arc::new(DebitSenderStep::new(
            ledger.clone(),
            locks.clone(),
            step_lease,
        )),
        Arc::new(CreditReceiverStep::new(ledger, locks, step_lease)),
    ]
}

/// Assembles the transfer driver with its collaborators wired in.
pub fn transfer_driver(
    db: DynSagaDatabase,
    overdraft_limit: Amount,
    step_lease: Duration,
) -> TypedSagaDriver<TransferData> {
    let ledger = LedgerService::new(db.clone(), overdraft_limit);
    let locks = IdempotencyStore::new(db.clone());
    TypedSagaDriver::new(
        TRANSFER_DATA_TYPE,
        SagaRepository::new(db),
        transfer_steps(ledger, locks, step_lease),
    )
}
