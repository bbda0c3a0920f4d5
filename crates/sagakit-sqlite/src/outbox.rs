//! Outbox message storage.

use async_trait::async_trait;
use sagakit_common::database::{Error, OutboxDatabase};
use sagakit_common::outbox::{OutboxMessage, LAST_ERROR_MAX_LEN};
use uuid::Uuid;

use crate::database::DatabaseExecutor;
use crate::stmt::{query, Column};
use crate::{
    column_as_number, column_as_nullable_number, column_as_nullable_string, column_as_string,
    unpack_into, SagaSqliteDatabase,
};

fn sql_row_to_outbox_message(row: Vec<Column>) -> Result<OutboxMessage, Error> {
    unpack_into!(
        let (
            id,
            message_type,
            payload,
            created_time,
            processed_time,
            attempt_count,
            last_error,
            locked_by,
            locked_until
        ) = row
    );

    let id = column_as_string!(&id, Uuid::parse_str);
    let created_time: u64 = column_as_number!(created_time);
    let processed_time: Option<u64> = column_as_nullable_number!(processed_time);
    let attempt_count: u32 = column_as_number!(attempt_count);
    let locked_until: Option<u64> = column_as_nullable_number!(locked_until);

    Ok(OutboxMessage {
        id,
        message_type: column_as_string!(&message_type),
        payload: column_as_string!(&payload),
        created_time,
        processed_time,
        attempt_count,
        last_error: column_as_nullable_string!(&last_error),
        locked_by: column_as_nullable_string!(&locked_by),
        locked_until,
    })
}

const OUTBOX_COLUMNS: &str = r#"
    id,
    message_type,
    payload,
    created_time,
    processed_time,
    attempt_count,
    last_error,
    locked_by,
    locked_until
"#;

pub(crate) async fn insert_outbox_message<C>(
    conn: &C,
    message: &OutboxMessage,
) -> Result<(), Error>
where
    C: DatabaseExecutor,
{
    query(
        r#"
        INSERT INTO outbox_message
        (id, message_type, payload, created_time, processed_time, attempt_count, last_error, locked_by, locked_until)
        VALUES
        (:id, :message_type, :payload, :created_time, :processed_time, :attempt_count, :last_error, :locked_by, :locked_until)
        "#,
    )?
    .bind("id", message.id.to_string())
    .bind("message_type", message.message_type.as_str())
    .bind("payload", message.payload.as_str())
    .bind("created_time", message.created_time)
    .bind("processed_time", message.processed_time)
    .bind("attempt_count", message.attempt_count)
    .bind("last_error", message.last_error.as_deref())
    .bind("locked_by", message.locked_by.as_deref())
    .bind("locked_until", message.locked_until)
    .execute(conn)
    .await?;

    Ok(())
}

#[async_trait]
impl OutboxDatabase for SagaSqliteDatabase {
    async fn next_outbox_candidate(&self, now: u64) -> Result<Option<OutboxMessage>, Error> {
        query(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM outbox_message
            WHERE
                processed_time IS NULL
                AND (locked_until IS NULL OR locked_until < :now)
            ORDER BY created_time ASC
            LIMIT 1
            "#
        ))?
        .bind("now", now)
        .fetch_one(self.executor())
        .await?
        .map(sql_row_to_outbox_message)
        .transpose()
    }

    async fn claim_outbox_message(
        &self,
        id: &Uuid,
        worker_id: &str,
        lease_until: u64,
        now: u64,
    ) -> Result<bool, Error> {
        let affected = query(
            r#"
            UPDATE outbox_message
            SET locked_by = :worker_id, locked_until = :lease_until
            WHERE
                id = :id
                AND processed_time IS NULL
                AND (locked_until IS NULL OR locked_until < :now)
            "#,
        )?
        .bind("worker_id", worker_id)
        .bind("lease_until", lease_until)
        .bind("id", id.to_string())
        .bind("now", now)
        .execute(self.executor())
        .await?;

        Ok(affected > 0)
    }

    async fn get_outbox_message(&self, id: &Uuid) -> Result<Option<OutboxMessage>, Error> {
        query(&format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM outbox_message
            WHERE id = :id
            "#
        ))?
        .bind("id", id.to_string())
        .fetch_one(self.executor())
        .await?
        .map(sql_row_to_outbox_message)
        .transpose()
    }

    async fn mark_outbox_processed(&self, id: &Uuid, now: u64) -> Result<(), Error> {
        query(
            r#"
            UPDATE outbox_message
            SET processed_time = :now, locked_by = NULL, locked_until = NULL
            WHERE id = :id AND processed_time IS NULL
            "#,
        )?
        .bind("now", now)
        .bind("id", id.to_string())
        .execute(self.executor())
        .await?;

        Ok(())
    }

    async fn release_outbox_message(
        &self,
        id: &Uuid,
        retry_at: u64,
        increment_attempts: bool,
        last_error: Option<&str>,
    ) -> Result<(), Error> {
        let last_error = last_error.map(|reason| {
            if reason.len() <= LAST_ERROR_MAX_LEN {
                return reason.to_owned();
            }
            // Cut at the last char boundary within the byte limit.
            let mut end = LAST_ERROR_MAX_LEN;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason[..end].to_owned()
        });

        query(
            r#"
            UPDATE outbox_message
            SET
                locked_by = NULL,
                locked_until = :retry_at,
                attempt_count = attempt_count + :increment,
                last_error = COALESCE(:last_error, last_error)
            WHERE id = :id
            "#,
        )?
        .bind("retry_at", retry_at)
        .bind("increment", i64::from(increment_attempts))
        .bind("last_error", last_error)
        .bind("id", id.to_string())
        .execute(self.executor())
        .await?;

        Ok(())
    }
}
