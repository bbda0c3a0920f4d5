//! Idempotency key storage.

use async_trait::async_trait;
use sagakit_common::database::{Error, IdempotencyDatabase};
use sagakit_common::idempotency::IdempotencyKey;
use sagakit_common::util::unix_time_millis;

use crate::stmt::{query, Column};
use crate::{
    column_as_number, column_as_nullable_number, column_as_nullable_string, column_as_string,
    unpack_into, SagaSqliteDatabase,
};

fn sql_row_to_idempotency_key(row: Vec<Column>) -> Result<IdempotencyKey, Error> {
    unpack_into!(
        let (
            key,
            created_time,
            is_consumed,
            locked_by,
            locked_until
        ) = row
    );

    let created_time: u64 = column_as_number!(created_time);
    let is_consumed: i64 = column_as_number!(is_consumed);
    let locked_until: Option<u64> = column_as_nullable_number!(locked_until);

    Ok(IdempotencyKey {
        key: column_as_string!(&key),
        created_time,
        is_consumed: is_consumed != 0,
        locked_by: column_as_nullable_string!(&locked_by),
        locked_until,
    })
}

#[async_trait]
impl IdempotencyDatabase for SagaSqliteDatabase {
    async fn claim_idempotency_key(
        &self,
        key: &str,
        owner_id: &str,
        lease_until: u64,
        now: u64,
    ) -> Result<bool, Error> {
        // Insert-or-takeover in one statement: the upsert only fires while
        // the existing row is unconsumed and its lease has lapsed.
        let affected = query(
            r#"
            INSERT INTO idempotency_key
            (key, created_time, is_consumed, locked_by, locked_until)
            VALUES
            (:key, :created_time, FALSE, :owner_id, :lease_until)
            ON CONFLICT(key) DO UPDATE SET
                locked_by = excluded.locked_by,
                locked_until = excluded.locked_until
            WHERE
                idempotency_key.is_consumed = FALSE
                AND (idempotency_key.locked_until IS NULL OR idempotency_key.locked_until < :now)
            "#,
        )?
        .bind("key", key)
        .bind("created_time", unix_time_millis())
        .bind("owner_id", owner_id)
        .bind("lease_until", lease_until)
        .bind("now", now)
        .execute(self.executor())
        .await?;

        Ok(affected > 0)
    }

    async fn seal_idempotency_key(&self, key: &str, owner_id: &str) -> Result<bool, Error> {
        let affected = query(
            r#"
            UPDATE idempotency_key
            SET is_consumed = TRUE, locked_by = NULL, locked_until = NULL
            WHERE key = :key AND locked_by = :owner_id AND is_consumed = FALSE
            "#,
        )?
        .bind("key", key)
        .bind("owner_id", owner_id)
        .execute(self.executor())
        .await?;

        Ok(affected > 0)
    }

    async fn get_idempotency_key(&self, key: &str) -> Result<Option<IdempotencyKey>, Error> {
        query(
            r#"
            SELECT
                key,
                created_time,
                is_consumed,
                locked_by,
                locked_until
            FROM
                idempotency_key
            WHERE
                key = :key
            "#,
        )?
        .bind("key", key)
        .fetch_one(self.executor())
        .await?
        .map(sql_row_to_idempotency_key)
        .transpose()
    }
}
