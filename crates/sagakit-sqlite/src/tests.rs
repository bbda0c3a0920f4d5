//! Backend behavior tests over the in-memory database.

use sagakit_common::database::{
    Database, DbTransactionFinalizer, Error, IdempotencyDatabase, LedgerDatabase, OutboxDatabase,
    SagaTransaction, SagasDatabase,
};
use sagakit_common::ledger::{LedgerEntry, LedgerEntryKind};
use sagakit_common::outbox::{OutboxMessage, LAST_ERROR_MAX_LEN};
use sagakit_common::saga::{SagaSnapshot, SagaState};
use sagakit_common::util::unix_time_millis;
use sagakit_common::Amount;
use uuid::Uuid;

use crate::{memory, migrations};

fn test_snapshot() -> SagaSnapshot {
    SagaSnapshot::new(
        Uuid::new_v4(),
        r#"{"Amount":777}"#.to_string(),
        "Transfer".to_string(),
    )
}

#[tokio::test]
async fn test_migrations_are_idempotent() {
    let db = memory::empty().await.unwrap();
    migrations::migrate(db.executor()).await.unwrap();
    migrations::migrate(db.executor()).await.unwrap();
}

#[tokio::test]
async fn test_saga_round_trip() {
    let db = memory::empty().await.unwrap();

    let mut snapshot = test_snapshot();
    snapshot.state = SagaState::Running;
    snapshot.cursor = 1;
    snapshot.error_log = vec!["first failure".to_string()];

    db.upsert_saga(&snapshot).await.unwrap();

    let loaded = db.get_saga(&snapshot.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, snapshot.id);
    assert_eq!(loaded.state, SagaState::Running);
    assert_eq!(loaded.cursor, 1);
    assert_eq!(loaded.data_json, snapshot.data_json);
    assert_eq!(loaded.data_type, "Transfer");
    assert_eq!(loaded.error_log, vec!["first failure".to_string()]);
}

#[tokio::test]
async fn test_get_missing_saga_is_none() {
    let db = memory::empty().await.unwrap();
    assert!(db.get_saga(&Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_atomic_saga_and_outbox_insert() {
    let db = memory::empty().await.unwrap();
    let snapshot = test_snapshot();
    let message = OutboxMessage::start_saga(snapshot.id);

    let mut tx = db.begin_transaction().await.unwrap();
    tx.add_saga(&snapshot).await.unwrap();
    tx.add_outbox_message(&message).await.unwrap();
    tx.commit().await.unwrap();

    assert!(db.get_saga(&snapshot.id).await.unwrap().is_some());
    assert!(db
        .get_outbox_message(&message.id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_transaction_rollback_on_drop() {
    let db = memory::empty().await.unwrap();
    let snapshot = test_snapshot();

    {
        let mut tx = db.begin_transaction().await.unwrap();
        tx.add_saga(&snapshot).await.unwrap();
        // dropped without commit
    }

    // Give the worker thread a moment to process the implicit rollback
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(db.get_saga(&snapshot.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_outbox_claim_is_exclusive() {
    let db = memory::empty().await.unwrap();
    let message = OutboxMessage::start_saga(Uuid::new_v4());

    let mut tx = db.begin_transaction().await.unwrap();
    tx.add_outbox_message(&message).await.unwrap();
    tx.commit().await.unwrap();

    let now = unix_time_millis();
    let candidate = db.next_outbox_candidate(now).await.unwrap().unwrap();
    assert_eq!(candidate.id, message.id);

    assert!(db
        .claim_outbox_message(&message.id, "w1", now + 30_000, now)
        .await
        .unwrap());
    // Second claim loses while the lease is live
    assert!(!db
        .claim_outbox_message(&message.id, "w2", now + 30_000, now)
        .await
        .unwrap());

    // A leased message is not a candidate
    assert!(db.next_outbox_candidate(now).await.unwrap().is_none());
}

#[tokio::test]
async fn test_outbox_release_and_attempts() {
    let db = memory::empty().await.unwrap();
    let message = OutboxMessage::start_saga(Uuid::new_v4());

    let mut tx = db.begin_transaction().await.unwrap();
    tx.add_outbox_message(&message).await.unwrap();
    tx.commit().await.unwrap();

    let now = unix_time_millis();
    assert!(db
        .claim_outbox_message(&message.id, "w1", now + 30_000, now)
        .await
        .unwrap());

    // Transient release: no attempt counted
    db.release_outbox_message(&message.id, now.saturating_sub(1), false, Some("busy"))
        .await
        .unwrap();
    let loaded = db.get_outbox_message(&message.id).await.unwrap().unwrap();
    assert_eq!(loaded.attempt_count, 0);
    assert_eq!(loaded.last_error.as_deref(), Some("busy"));
    assert!(loaded.locked_by.is_none());

    // Failure release: attempt counted, previous reason kept when none given
    db.release_outbox_message(&message.id, now.saturating_sub(1), true, None)
        .await
        .unwrap();
    let loaded = db.get_outbox_message(&message.id).await.unwrap().unwrap();
    assert_eq!(loaded.attempt_count, 1);
    assert_eq!(loaded.last_error.as_deref(), Some("busy"));

    // Released message becomes a candidate again
    assert!(db
        .next_outbox_candidate(unix_time_millis())
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_mark_processed_is_terminal() {
    let db = memory::empty().await.unwrap();
    let message = OutboxMessage::start_saga(Uuid::new_v4());

    let mut tx = db.begin_transaction().await.unwrap();
    tx.add_outbox_message(&message).await.unwrap();
    tx.commit().await.unwrap();

    let now = unix_time_millis();
    db.mark_outbox_processed(&message.id, now).await.unwrap();

    let loaded = db.get_outbox_message(&message.id).await.unwrap().unwrap();
    assert_eq!(loaded.processed_time, Some(now));

    // Processed messages are never candidates nor claimable
    assert!(db.next_outbox_candidate(now).await.unwrap().is_none());
    assert!(!db
        .claim_outbox_message(&message.id, "w1", now + 30_000, now)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_idempotency_claim_insert_and_takeover() {
    let db = memory::empty().await.unwrap();
    let now = unix_time_millis();

    // Fresh key
    assert!(db
        .claim_idempotency_key("Debit_Step_Lock_G1", "w1", now + 120_000, now)
        .await
        .unwrap());

    // Live lease blocks another owner
    assert!(!db
        .claim_idempotency_key("Debit_Step_Lock_G1", "w2", now + 120_000, now)
        .await
        .unwrap());

    // Expired lease is taken over
    let later = now + 200_000;
    assert!(db
        .claim_idempotency_key("Debit_Step_Lock_G1", "w2", later + 120_000, later)
        .await
        .unwrap());

    let key = db
        .get_idempotency_key("Debit_Step_Lock_G1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(key.locked_by.as_deref(), Some("w2"));
    assert!(!key.is_consumed);
}

#[tokio::test]
async fn test_idempotency_seal_requires_owner() {
    let db = memory::empty().await.unwrap();
    let now = unix_time_millis();

    assert!(db
        .claim_idempotency_key("K", "w1", now + 120_000, now)
        .await
        .unwrap());

    // Wrong owner cannot seal
    assert!(!db.seal_idempotency_key("K", "w2").await.unwrap());
    // Owner seals
    assert!(db.seal_idempotency_key("K", "w1").await.unwrap());
    // Sealing twice changes nothing
    assert!(!db.seal_idempotency_key("K", "w1").await.unwrap());

    let key = db.get_idempotency_key("K").await.unwrap().unwrap();
    assert!(key.is_consumed);
    assert!(key.locked_by.is_none());
    assert!(key.locked_until.is_none());

    // A consumed key can never be claimed again
    let later = now + 500_000;
    assert!(!db
        .claim_idempotency_key("K", "w3", later + 120_000, later)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_ledger_reference_is_unique() {
    let db = memory::empty().await.unwrap();

    let entry = LedgerEntry::new(
        "U1",
        Amount::from(-777),
        LedgerEntryKind::Debit,
        "Debit_G1",
        None,
    );
    db.insert_ledger_entry(&entry).await.unwrap();

    let duplicate = LedgerEntry::new(
        "U1",
        Amount::from(-777),
        LedgerEntryKind::Debit,
        "Debit_G1",
        None,
    );
    assert!(matches!(
        db.insert_ledger_entry(&duplicate).await,
        Err(Error::Duplicate)
    ));
}

#[tokio::test]
async fn test_ledger_balance_is_sum_of_entries() {
    let db = memory::empty().await.unwrap();

    assert_eq!(db.ledger_balance("U1").await.unwrap(), Amount::ZERO);

    for (amount, kind, reference) in [
        (-777i64, LedgerEntryKind::Debit, "Debit_G1"),
        (777, LedgerEntryKind::Credit, "Refund_Debit_G1"),
        (42, LedgerEntryKind::Credit, "Credit_G2"),
        (0, LedgerEntryKind::AbortMarker, "Debit_G3"),
    ] {
        db.insert_ledger_entry(&LedgerEntry::new(
            "U1",
            Amount::from(amount),
            kind,
            reference,
            None,
        ))
        .await
        .unwrap();
    }

    assert_eq!(db.ledger_balance("U1").await.unwrap(), Amount::from(42));

    let tombstone = db
        .get_ledger_entry_by_reference("Debit_G3")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tombstone.kind, LedgerEntryKind::AbortMarker);
    assert_eq!(tombstone.amount, Amount::ZERO);
}

#[tokio::test]
async fn test_unknown_state_rehydrates_as_failed() {
    let db = memory::empty().await.unwrap();
    let snapshot = test_snapshot();
    db.upsert_saga(&snapshot).await.unwrap();

    // Simulate a snapshot written by a newer (or corrupted) deployment.
    crate::stmt::query("UPDATE saga SET state = :state WHERE id = :id")
        .unwrap()
        .bind("state", "Paused")
        .bind("id", snapshot.id.to_string())
        .execute(db.executor())
        .await
        .unwrap();

    let loaded = db.get_saga(&snapshot.id).await.unwrap().unwrap();
    assert_eq!(loaded.state, SagaState::Failed);
}

#[tokio::test]
async fn test_release_truncates_long_error_reasons() {
    let db = memory::empty().await.unwrap();
    let message = OutboxMessage::start_saga(Uuid::new_v4());

    let mut tx = db.begin_transaction().await.unwrap();
    tx.add_outbox_message(&message).await.unwrap();
    tx.commit().await.unwrap();

    // Multi-byte reason well past the persisted limit
    let reason = "\u{e9}".repeat(600);
    db.release_outbox_message(&message.id, unix_time_millis(), true, Some(&reason))
        .await
        .unwrap();

    let stored = db
        .get_outbox_message(&message.id)
        .await
        .unwrap()
        .unwrap()
        .last_error
        .unwrap();
    assert!(stored.len() <= LAST_ERROR_MAX_LEN);
    // The cut never splits a character
    assert!(stored.chars().all(|c| c == '\u{e9}'));
}
