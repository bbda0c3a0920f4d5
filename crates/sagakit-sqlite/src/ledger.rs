//! Append-only ledger storage.

use async_trait::async_trait;
use sagakit_common::database::{Error, LedgerDatabase};
use sagakit_common::ledger::{LedgerEntry, LedgerEntryKind};
use sagakit_common::Amount;
use uuid::Uuid;

use crate::stmt::{query, Column};
use crate::{
    column_as_number, column_as_nullable_string, column_as_string, unpack_into,
    SagaSqliteDatabase,
};

fn sql_row_to_ledger_entry(row: Vec<Column>) -> Result<LedgerEntry, Error> {
    unpack_into!(
        let (
            id,
            account_id,
            amount,
            kind,
            reference_id,
            created_time,
            reason
        ) = row
    );

    let id = column_as_string!(&id, Uuid::parse_str);
    let amount: i64 = column_as_number!(amount);
    let kind: i64 = column_as_number!(kind);
    let created_time: u64 = column_as_number!(created_time);

    Ok(LedgerEntry {
        id,
        account_id: column_as_string!(&account_id),
        amount: Amount::from(amount),
        kind: LedgerEntryKind::try_from(kind)?,
        reference_id: column_as_string!(&reference_id),
        created_time,
        reason: column_as_nullable_string!(&reason),
    })
}

#[async_trait]
impl LedgerDatabase for SagaSqliteDatabase {
    async fn insert_ledger_entry(&self, entry: &LedgerEntry) -> Result<(), Error> {
        query(
            r#"
            INSERT INTO ledger_entry
            (id, account_id, amount, kind, reference_id, created_time, reason)
            VALUES
            (:id, :account_id, :amount, :kind, :reference_id, :created_time, :reason)
            "#,
        )?
        .bind("id", entry.id.to_string())
        .bind("account_id", entry.account_id.as_str())
        .bind("amount", entry.amount.to_i64())
        .bind("kind", entry.kind.to_i64())
        .bind("reference_id", entry.reference_id.as_str())
        .bind("created_time", entry.created_time)
        .bind("reason", entry.reason.as_deref())
        .execute(self.executor())
        .await?;

        Ok(())
    }

    async fn get_ledger_entry_by_reference(
        &self,
        reference_id: &str,
    ) -> Result<Option<LedgerEntry>, Error> {
        query(
            r#"
            SELECT
                id,
                account_id,
                amount,
                kind,
                reference_id,
                created_time,
                reason
            FROM
                ledger_entry
            WHERE
                reference_id = :reference_id
            "#,
        )?
        .bind("reference_id", reference_id)
        .fetch_one(self.executor())
        .await?
        .map(sql_row_to_ledger_entry)
        .transpose()
    }

    async fn ledger_balance(&self, account_id: &str) -> Result<Amount, Error> {
        let balance = query(
            r#"
            SELECT COALESCE(SUM(amount), 0)
            FROM ledger_entry
            WHERE account_id = :account_id
            "#,
        )?
        .bind("account_id", account_id)
        .pluck(self.executor())
        .await?;

        match balance {
            Some(Column::Integer(total)) => Ok(Amount::from(total)),
            Some(Column::Null) | None => Ok(Amount::ZERO),
            Some(other) => Err(Error::Internal(format!(
                "unexpected balance column {other:?}"
            ))),
        }
    }
}
