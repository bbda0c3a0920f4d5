//! Tests for the saga engine
//!
//! This test module covers:
//! - Happy-path forward execution
//! - Business-rule rejection and compensation
//! - Crash recovery and idempotent re-execution
//! - Ledger refund and tombstone semantics
//! - Idempotency store lease semantics
//! - Outbox worker dispatch
//! - Snapshot persistence round-trips

#![cfg(test)]
#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sagakit_common::database::{
    Database, DbTransactionFinalizer, DynSagaDatabase, LedgerDatabase, OutboxDatabase,
    SagaTransaction, SagasDatabase,
};
use sagakit_common::idempotency::ClaimOutcome;
use sagakit_common::ledger::{LedgerEntryKind, LedgerOutcome};
use sagakit_common::outbox::OutboxMessage;
use sagakit_common::saga::SagaState;
use sagakit_common::util::unix_time_millis;
use sagakit_common::{Amount, Error};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::coordinator::Coordinator;
use crate::idempotency::IdempotencyStore;
use crate::instance::SagaInstance;
use crate::ledger::LedgerService;
use crate::outbox::{OutboxWorker, WorkerConfig};
use crate::registry::{SagaDriver, SagaRegistry};
use crate::repository::SagaRepository;
use crate::step::SagaStep;
use crate::transfer::{transfer_driver, TransferData, TRANSFER_DATA_TYPE};

const STEP_LEASE: Duration = Duration::from_secs(120);
const OVERDRAFT_LIMIT: Amount = Amount::new(-50_000);

async fn test_db() -> DynSagaDatabase {
    Arc::new(sagakit_sqlite::memory::empty().await.unwrap())
}

fn transfer_data(saga_id: Uuid, amount: i64) -> TransferData {
    TransferData {
        saga_id,
        from_user_id: "U1".to_string(),
        to_user_id: "U2".to_string(),
        amount: Amount::from(amount),
    }
}

async fn seed_account(ledger: &LedgerService, account: &str, amount: i64) {
    let outcome = ledger
        .try_credit(account, Amount::from(amount), &format!("Seed_{account}"))
        .await
        .unwrap();
    assert_eq!(outcome, LedgerOutcome::Success);
}

/// Creates a transfer saga and drives it through its driver, returning the
/// final persisted snapshot.
async fn create_and_drive(
    db: &DynSagaDatabase,
    data: &TransferData,
) -> sagakit_common::saga::SagaSnapshot {
    let repository = SagaRepository::new(db.clone());
    repository
        .create_saga(data.saga_id, data, TRANSFER_DATA_TYPE)
        .await
        .unwrap();

    let driver = transfer_driver(db.clone(), OVERDRAFT_LIMIT, STEP_LEASE);
    driver
        .drive(data.saga_id, &CancellationToken::new())
        .await
        .unwrap();

    db.get_saga(&data.saga_id).await.unwrap().unwrap()
}

// ============================================================================
// Scenario: happy path
// ============================================================================

#[tokio::test]
async fn test_happy_path_transfer() {
    let db = test_db().await;
    let ledger = LedgerService::new(db.clone(), OVERDRAFT_LIMIT);
    seed_account(&ledger, "U1", 1_000).await;

    let saga_id = Uuid::new_v4();
    let data = transfer_data(saga_id, 777);

    let snapshot = create_and_drive(&db, &data).await;

    assert_eq!(snapshot.state, SagaState::Completed);
    assert_eq!(snapshot.cursor, 2);
    assert!(snapshot.error_log.is_empty());

    assert_eq!(ledger.balance("U1").await.unwrap(), Amount::from(223));
    assert_eq!(ledger.balance("U2").await.unwrap(), Amount::from(777));

    let debit = db
        .get_ledger_entry_by_reference(&format!("Debit_{saga_id}"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(debit.kind, LedgerEntryKind::Debit);
    assert_eq!(debit.amount, Amount::from(-777));

    let credit = db
        .get_ledger_entry_by_reference(&format!("Credit_{saga_id}"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(credit.kind, LedgerEntryKind::Credit);
    assert_eq!(credit.amount, Amount::from(777));
}

// ============================================================================
// Scenario: business-rule rejection triggers compensation
// ============================================================================

#[tokio::test]
async fn test_aml_rejection_compensates_debit() {
    let db = test_db().await;
    let ledger = LedgerService::new(db.clone(), OVERDRAFT_LIMIT);
    seed_account(&ledger, "U1", 250_000).await;

    let saga_id = Uuid::new_v4();
    // Above the 100 000 single-transfer limit: the debit succeeds, the
    // credit step refuses before touching the ledger.
    let data = transfer_data(saga_id, 200_000);

    let snapshot = create_and_drive(&db, &data).await;

    assert_eq!(snapshot.state, SagaState::Compensated);
    assert_eq!(snapshot.error_log.len(), 1);
    assert!(snapshot.error_log[0].starts_with("Credit:"));

    // The refund nets the sender back to the seeded balance.
    assert_eq!(ledger.balance("U1").await.unwrap(), Amount::from(250_000));
    assert_eq!(ledger.balance("U2").await.unwrap(), Amount::ZERO);

    let refund = db
        .get_ledger_entry_by_reference(&format!("Refund_Debit_{saga_id}"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refund.kind, LedgerEntryKind::Credit);
    assert_eq!(refund.amount, Amount::from(200_000));
}

// ============================================================================
// Scenario: crash mid-debit, another worker resumes
// ============================================================================

#[tokio::test]
async fn test_crash_mid_debit_resumes_without_double_charge() {
    let db = test_db().await;
    let ledger = LedgerService::new(db.clone(), OVERDRAFT_LIMIT);
    let locks = IdempotencyStore::new(db.clone());
    seed_account(&ledger, "U1", 1_000).await;

    let saga_id = Uuid::new_v4();
    let data = transfer_data(saga_id, 777);

    let repository = SagaRepository::new(db.clone());
    repository
        .create_saga(saga_id, &data, TRANSFER_DATA_TYPE)
        .await
        .unwrap();

    // Simulate a worker that claimed the debit step lock, wrote the ledger
    // entry, and died before sealing the lock or saving the cursor.
    let claim = locks
        .try_claim(
            &format!("Debit_Step_Lock_{saga_id}"),
            "dead-worker",
            Duration::ZERO,
        )
        .await
        .unwrap();
    assert_eq!(claim, ClaimOutcome::Acquired);
    assert_eq!(
        ledger
            .try_debit("U1", Amount::from(777), &format!("Debit_{saga_id}"))
            .await
            .unwrap(),
        LedgerOutcome::Success
    );
    // Let the abandoned lease lapse.
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Another worker rehydrates at cursor 0 and replays the debit step.
    let driver = transfer_driver(db.clone(), OVERDRAFT_LIMIT, STEP_LEASE);
    driver
        .drive(saga_id, &CancellationToken::new())
        .await
        .unwrap();

    let snapshot = db.get_saga(&saga_id).await.unwrap().unwrap();
    assert_eq!(snapshot.state, SagaState::Completed);

    // Exactly one charge despite the replay.
    assert_eq!(ledger.balance("U1").await.unwrap(), Amount::from(223));
    assert_eq!(ledger.balance("U2").await.unwrap(), Amount::from(777));
}

// ============================================================================
// Scenario: out-of-order compensation leaves a tombstone
// ============================================================================

#[tokio::test]
async fn test_compensation_before_debit_tombstones_the_key() {
    let db = test_db().await;
    let ledger = LedgerService::new(db.clone(), OVERDRAFT_LIMIT);

    // Compensation arrives before any debit was written.
    assert_eq!(
        ledger
            .try_compensate_debit("U1", Amount::from(777), "Debit_G1")
            .await
            .unwrap(),
        LedgerOutcome::Success
    );

    let tombstone = db
        .get_ledger_entry_by_reference("Debit_G1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tombstone.kind, LedgerEntryKind::AbortMarker);
    assert_eq!(tombstone.amount, Amount::ZERO);

    // The delayed duplicate debit must never apply.
    assert_eq!(
        ledger
            .try_debit("U1", Amount::from(777), "Debit_G1")
            .await
            .unwrap(),
        LedgerOutcome::Rejected
    );
    assert_eq!(ledger.balance("U1").await.unwrap(), Amount::ZERO);

    // Re-running the compensation is an idempotent success.
    assert_eq!(
        ledger
            .try_compensate_debit("U1", Amount::from(777), "Debit_G1")
            .await
            .unwrap(),
        LedgerOutcome::IdempotentSuccess
    );
}

// ============================================================================
// Ledger semantics
// ============================================================================

#[tokio::test]
async fn test_debit_is_idempotent_per_key() {
    let db = test_db().await;
    let ledger = LedgerService::new(db.clone(), OVERDRAFT_LIMIT);

    assert_eq!(
        ledger
            .try_debit("U1", Amount::from(100), "Debit_G1")
            .await
            .unwrap(),
        LedgerOutcome::Success
    );
    assert_eq!(
        ledger
            .try_debit("U1", Amount::from(100), "Debit_G1")
            .await
            .unwrap(),
        LedgerOutcome::IdempotentSuccess
    );

    assert_eq!(ledger.balance("U1").await.unwrap(), Amount::from(-100));
}

#[tokio::test]
async fn test_overdraft_limit_rejects_debit() {
    let db = test_db().await;
    let ledger = LedgerService::new(db.clone(), OVERDRAFT_LIMIT);

    // Exactly at the limit is allowed
    assert_eq!(
        ledger
            .try_debit("U1", Amount::from(50_000), "Debit_A")
            .await
            .unwrap(),
        LedgerOutcome::Success
    );
    // One unit below the limit is refused
    assert_eq!(
        ledger
            .try_debit("U1", Amount::from(1), "Debit_B")
            .await
            .unwrap(),
        LedgerOutcome::Rejected
    );
    // No entry was written for the refused debit
    assert!(db
        .get_ledger_entry_by_reference("Debit_B")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_compensate_applied_debit_refunds_once() {
    let db = test_db().await;
    let ledger = LedgerService::new(db.clone(), OVERDRAFT_LIMIT);

    ledger
        .try_debit("U1", Amount::from(500), "Debit_G1")
        .await
        .unwrap();

    assert_eq!(
        ledger
            .try_compensate_debit("U1", Amount::from(500), "Debit_G1")
            .await
            .unwrap(),
        LedgerOutcome::Success
    );
    assert_eq!(
        ledger
            .try_compensate_debit("U1", Amount::from(500), "Debit_G1")
            .await
            .unwrap(),
        LedgerOutcome::IdempotentSuccess
    );

    assert_eq!(ledger.balance("U1").await.unwrap(), Amount::ZERO);
}

#[tokio::test]
async fn test_credit_under_foreign_key_conflicts() {
    let db = test_db().await;
    let ledger = LedgerService::new(db.clone(), OVERDRAFT_LIMIT);

    // Tombstone the key, then try to credit under it
    ledger
        .try_compensate_debit("U1", Amount::from(10), "K1")
        .await
        .unwrap();
    assert_eq!(
        ledger
            .try_credit("U1", Amount::from(10), "K1")
            .await
            .unwrap(),
        LedgerOutcome::Conflict
    );

    // A debit key cannot be reused by a credit either
    ledger
        .try_debit("U2", Amount::from(10), "K2")
        .await
        .unwrap();
    assert_eq!(
        ledger
            .try_credit("U2", Amount::from(10), "K2")
            .await
            .unwrap(),
        LedgerOutcome::Conflict
    );
}

// ============================================================================
// Idempotency store semantics
// ============================================================================

#[tokio::test]
async fn test_step_lock_lifecycle() {
    let db = test_db().await;
    let locks = IdempotencyStore::new(db.clone());

    assert_eq!(
        locks
            .try_claim("Debit_Step_Lock_G1", "w1", STEP_LEASE)
            .await
            .unwrap(),
        ClaimOutcome::Acquired
    );
    assert_eq!(
        locks
            .try_claim("Debit_Step_Lock_G1", "w2", STEP_LEASE)
            .await
            .unwrap(),
        ClaimOutcome::LockedByOther
    );

    // Only the holder can seal
    assert!(matches!(
        locks.complete("Debit_Step_Lock_G1", "w2").await,
        Err(Error::LostLease(_))
    ));
    locks.complete("Debit_Step_Lock_G1", "w1").await.unwrap();

    // Sealed is terminal and idempotent
    assert_eq!(
        locks
            .try_claim("Debit_Step_Lock_G1", "w2", STEP_LEASE)
            .await
            .unwrap(),
        ClaimOutcome::AlreadyConsumed
    );
    locks.complete("Debit_Step_Lock_G1", "w1").await.unwrap();
    assert!(locks.is_consumed("Debit_Step_Lock_G1").await.unwrap());
}

#[tokio::test]
async fn test_expired_lease_is_taken_over() {
    let db = test_db().await;
    let locks = IdempotencyStore::new(db.clone());

    assert_eq!(
        locks
            .try_claim("K", "w1", Duration::ZERO)
            .await
            .unwrap(),
        ClaimOutcome::Acquired
    );
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(
        locks.try_claim("K", "w2", STEP_LEASE).await.unwrap(),
        ClaimOutcome::Acquired
    );

    // The stale holder can no longer seal over the new one
    assert!(matches!(
        locks.complete("K", "w1").await,
        Err(Error::LostLease(_))
    ));
}

// ============================================================================
// Coordinator behavior with synthetic steps
// ============================================================================

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct NoData {}

struct ScriptedStep {
    name: &'static str,
    fail_execute: bool,
    fail_compensate: bool,
    retry_once: Arc<AtomicBool>,
    compensated: Arc<AtomicUsize>,
}

impl ScriptedStep {
    fn ok(name: &'static str) -> Self {
        Self {
            name,
            fail_execute: false,
            fail_compensate: false,
            retry_once: Arc::new(AtomicBool::new(false)),
            compensated: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn failing(name: &'static str) -> Self {
        Self {
            fail_execute: true,
            ..Self::ok(name)
        }
    }
}

#[async_trait]
impl SagaStep<NoData> for ScriptedStep {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, _data: &mut NoData, _cancel: &CancellationToken) -> Result<(), Error> {
        if self.retry_once.swap(false, Ordering::SeqCst) {
            return Err(Error::RetryLater("scripted transient conflict".into()));
        }
        if self.fail_execute {
            return Err(Error::Rejected("scripted permanent failure".into()));
        }
        Ok(())
    }

    async fn compensate(
        &self,
        _data: &mut NoData,
        _cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.compensated.fetch_add(1, Ordering::SeqCst);
        if self.fail_compensate {
            return Err(Error::Internal("scripted compensation failure".into()));
        }
        Ok(())
    }
}

fn scripted_instance(steps: Vec<Arc<dyn SagaStep<NoData>>>) -> SagaInstance<NoData> {
    SagaInstance::new(Uuid::new_v4(), NoData {}, "Scripted", steps)
}

#[tokio::test]
async fn test_permanent_compensation_error_marks_fatal() {
    let db = test_db().await;
    let repository = SagaRepository::new(db.clone());
    let coordinator = Coordinator::new(repository.clone());

    let first = ScriptedStep {
        fail_compensate: true,
        ..ScriptedStep::ok("First")
    };
    let compensated = first.compensated.clone();
    let mut instance = scripted_instance(vec![
        Arc::new(first),
        Arc::new(ScriptedStep::failing("Second")),
    ]);

    coordinator
        .process(&mut instance, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(instance.state(), SagaState::FatalError);
    assert_eq!(compensated.load(Ordering::SeqCst), 1);

    let log = instance.error_log();
    assert_eq!(log.len(), 3);
    assert!(log[0].starts_with("Second:"));
    assert!(log[1].starts_with("COMPENSATION FAILED: step 0 (First)"));
    assert_eq!(log[2], "Manual review required");

    // The snapshot reflects all captured errors
    let snapshot = db.get_saga(&instance.id()).await.unwrap().unwrap();
    assert_eq!(snapshot.state, SagaState::FatalError);
    assert_eq!(snapshot.error_log.len(), 3);
}

#[tokio::test]
async fn test_retry_later_saves_without_advancing() {
    let db = test_db().await;
    let repository = SagaRepository::new(db.clone());
    let coordinator = Coordinator::new(repository.clone());

    let step = ScriptedStep::ok("Only");
    step.retry_once.store(true, Ordering::SeqCst);
    let mut instance = scripted_instance(vec![Arc::new(step)]);

    let err = coordinator
        .process(&mut instance, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RetryLater(_)));

    let snapshot = db.get_saga(&instance.id()).await.unwrap().unwrap();
    assert_eq!(snapshot.state, SagaState::Running);
    assert_eq!(snapshot.cursor, 0);

    // The transient condition cleared; the retry completes the saga.
    coordinator
        .process(&mut instance, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(instance.state(), SagaState::Completed);
}

#[tokio::test]
async fn test_resumed_compensation_after_restart() {
    let db = test_db().await;
    let repository = SagaRepository::new(db.clone());
    let coordinator = Coordinator::new(repository.clone());

    let first = ScriptedStep::ok("First");
    let compensated = first.compensated.clone();
    let steps: Vec<Arc<dyn SagaStep<NoData>>> = vec![
        Arc::new(first),
        Arc::new(ScriptedStep::failing("Second")),
    ];

    // A previous incarnation executed step 0, failed step 1, persisted the
    // Failed snapshot and died before compensating.
    let mut instance = scripted_instance(steps.clone());
    let saga_id = instance.id();
    instance.mark_running();
    instance.advance();
    instance.fail("Second: scripted permanent failure");
    repository.save(&instance).await.unwrap();

    // A new worker rehydrates and resumes straight into compensation.
    let mut resumed = repository.load(&saga_id, steps).await.unwrap().unwrap();
    assert_eq!(resumed.state(), SagaState::Failed);
    coordinator
        .process(&mut resumed, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(resumed.state(), SagaState::Compensated);
    assert_eq!(compensated.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancellation_aborts_without_mutating_cursor() {
    let db = test_db().await;
    let repository = SagaRepository::new(db.clone());
    let coordinator = Coordinator::new(repository.clone());

    let mut instance = scripted_instance(vec![Arc::new(ScriptedStep::ok("Only"))]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = coordinator.process(&mut instance, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(instance.cursor(), 0);
    assert_eq!(instance.state(), SagaState::Running);
}

#[tokio::test]
async fn test_terminal_saga_is_a_no_op() {
    let db = test_db().await;
    let repository = SagaRepository::new(db.clone());
    let coordinator = Coordinator::new(repository.clone());

    let mut instance = scripted_instance(vec![Arc::new(ScriptedStep::ok("Only"))]);
    coordinator
        .process(&mut instance, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(instance.state(), SagaState::Completed);

    // Replaying the message after completion changes nothing.
    coordinator
        .process(&mut instance, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(instance.state(), SagaState::Completed);
    assert_eq!(instance.cursor(), 1);
}

// ============================================================================
// Repository persistence
// ============================================================================

#[tokio::test]
async fn test_create_saga_writes_saga_and_outbox_atomically() {
    let db = test_db().await;
    let repository = SagaRepository::new(db.clone());

    let saga_id = Uuid::new_v4();
    let data = transfer_data(saga_id, 42);
    repository
        .create_saga(saga_id, &data, TRANSFER_DATA_TYPE)
        .await
        .unwrap();

    let snapshot = db.get_saga(&saga_id).await.unwrap().unwrap();
    assert_eq!(snapshot.state, SagaState::Created);
    assert_eq!(snapshot.cursor, 0);
    assert_eq!(snapshot.data_type, TRANSFER_DATA_TYPE);

    let candidate = db
        .next_outbox_candidate(unix_time_millis())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(candidate.message_type, "StartSaga");
    assert!(candidate.payload.contains(&saga_id.to_string()));
}

#[tokio::test]
async fn test_snapshot_round_trip() {
    let db = test_db().await;
    let repository = SagaRepository::new(db.clone());

    let steps: Vec<Arc<dyn SagaStep<NoData>>> = vec![
        Arc::new(ScriptedStep::ok("First")),
        Arc::new(ScriptedStep::ok("Second")),
    ];
    let mut instance = SagaInstance::new(Uuid::new_v4(), NoData {}, "Scripted", steps.clone());
    instance.mark_running();
    instance.advance();
    instance.record_error("some earlier hiccup");
    repository.save(&instance).await.unwrap();

    let loaded = repository
        .load(&instance.id(), steps)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.state(), instance.state());
    assert_eq!(loaded.cursor(), instance.cursor());
    assert_eq!(loaded.error_log(), instance.error_log());
    assert_eq!(loaded.data_type(), "Scripted");
}

#[tokio::test]
async fn test_load_promotes_exhausted_forward_saga() {
    let db = test_db().await;
    let repository = SagaRepository::new(db.clone());

    let steps: Vec<Arc<dyn SagaStep<NoData>>> = vec![Arc::new(ScriptedStep::ok("Only"))];
    let mut instance = SagaInstance::new(Uuid::new_v4(), NoData {}, "Scripted", steps.clone());
    let saga_id = instance.id();

    // Persist a snapshot whose cursor covers every step while the state is
    // still a forward one (crash between the last step and the final save).
    instance.mark_running();
    instance.advance();
    repository.save(&instance).await.unwrap();

    let mut snapshot = db.get_saga(&saga_id).await.unwrap().unwrap();
    snapshot.state = SagaState::Running;
    db.upsert_saga(&snapshot).await.unwrap();

    let loaded = repository.load(&saga_id, steps).await.unwrap().unwrap();
    assert_eq!(loaded.state(), SagaState::Completed);
}

#[tokio::test]
async fn test_load_missing_saga_is_none() {
    let db = test_db().await;
    let repository = SagaRepository::new(db.clone());
    let steps: Vec<Arc<dyn SagaStep<NoData>>> = vec![Arc::new(ScriptedStep::ok("Only"))];
    assert!(repository
        .load(&Uuid::new_v4(), steps)
        .await
        .unwrap()
        .is_none());
}

// ============================================================================
// Outbox worker
// ============================================================================

fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        empty_queue_delay: Duration::from_millis(20),
        lease_ttl: Duration::from_secs(30),
        transient_conflict_delay: Duration::from_millis(50),
        lost_lease_delay: Duration::from_millis(50),
        failure_backoff_step: Duration::from_millis(50),
        failure_backoff_max: Duration::from_millis(200),
        max_attempts_before_dlq: 10,
        error_delay: Duration::from_millis(50),
    }
}

async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition was not reached in time");
}

#[tokio::test]
async fn test_worker_drives_saga_to_completion() {
    let db = test_db().await;
    let ledger = LedgerService::new(db.clone(), OVERDRAFT_LIMIT);
    seed_account(&ledger, "U1", 1_000).await;

    let saga_id = Uuid::new_v4();
    let data = transfer_data(saga_id, 777);
    SagaRepository::new(db.clone())
        .create_saga(saga_id, &data, TRANSFER_DATA_TYPE)
        .await
        .unwrap();

    let mut registry = SagaRegistry::new(db.clone());
    registry.register(Arc::new(transfer_driver(
        db.clone(),
        OVERDRAFT_LIMIT,
        STEP_LEASE,
    )));

    let worker = OutboxWorker::new(db.clone(), Arc::new(registry), fast_worker_config());
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(worker.run(shutdown.clone()));

    wait_for(|| async {
        db.get_saga(&saga_id)
            .await
            .unwrap()
            .map(|s| s.state == SagaState::Completed)
            .unwrap_or(false)
    })
    .await;

    shutdown.cancel();
    handle.await.unwrap();

    assert_eq!(ledger.balance("U2").await.unwrap(), Amount::from(777));
    // The outbox message was finalized and is no longer eligible.
    assert!(db
        .next_outbox_candidate(unix_time_millis())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_worker_finalizes_unknown_message_types() {
    let db = test_db().await;

    let mut message = OutboxMessage::start_saga(Uuid::new_v4());
    message.message_type = "SomethingElse".to_string();
    let mut tx = db.begin_transaction().await.unwrap();
    tx.add_outbox_message(&message).await.unwrap();
    tx.commit().await.unwrap();

    let registry = Arc::new(SagaRegistry::new(db.clone()));
    let worker = OutboxWorker::new(db.clone(), registry, fast_worker_config());
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(worker.run(shutdown.clone()));

    wait_for(|| async {
        db.get_outbox_message(&message.id)
            .await
            .unwrap()
            .map(|m| m.processed_time.is_some())
            .unwrap_or(false)
    })
    .await;

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_worker_finalizes_messages_for_missing_sagas() {
    let db = test_db().await;

    // A StartSaga message whose saga row never committed (should not happen
    // given the atomic insert, but the worker must not loop on it).
    let message = OutboxMessage::start_saga(Uuid::new_v4());
    let mut tx = db.begin_transaction().await.unwrap();
    tx.add_outbox_message(&message).await.unwrap();
    tx.commit().await.unwrap();

    let registry = Arc::new(SagaRegistry::new(db.clone()));
    let worker = OutboxWorker::new(db.clone(), registry, fast_worker_config());
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(worker.run(shutdown.clone()));

    wait_for(|| async {
        db.get_outbox_message(&message.id)
            .await
            .unwrap()
            .map(|m| m.processed_time.is_some())
            .unwrap_or(false)
    })
    .await;

    shutdown.cancel();
    handle.await.unwrap();
}
