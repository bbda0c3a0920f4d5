//! Saga snapshot storage and the atomic saga + outbox writer.

use std::str::FromStr;

use async_trait::async_trait;
use sagakit_common::database::{
    DbTransactionFinalizer, Error, SagaTransaction, SagasDatabase,
};
use sagakit_common::saga::{SagaSnapshot, SagaState};
use sagakit_common::util::unix_time_millis;
use uuid::Uuid;

use crate::database::DatabaseExecutor;
use crate::stmt::{query, Column};
use crate::{column_as_number, column_as_string, unpack_into, SagaSqliteDatabase};

fn sql_row_to_saga(row: Vec<Column>) -> Result<SagaSnapshot, Error> {
    unpack_into!(
        let (
            id,
            state,
            current_step_index,
            data_json,
            data_type,
            error_log,
            created_time,
            updated_time
        ) = row
    );

    let id = column_as_string!(&id, Uuid::parse_str);
    let state_str = column_as_string!(&state);
    // An unrecognized persisted state rehydrates as Failed so compensation
    // can still be attempted.
    let state = SagaState::from_str(&state_str).unwrap_or_else(|_| {
        tracing::warn!("Unknown saga state {state_str:?}, rehydrating as Failed");
        SagaState::Failed
    });
    let cursor: usize = column_as_number!(current_step_index);
    let error_log: Vec<String> = serde_json::from_str(&column_as_string!(&error_log))?;
    let created_time: u64 = column_as_number!(created_time);
    let updated_time: u64 = column_as_number!(updated_time);

    Ok(SagaSnapshot {
        id,
        state,
        cursor,
        data_json: column_as_string!(&data_json),
        data_type: column_as_string!(&data_type),
        error_log,
        created_time,
        updated_time,
    })
}

pub(crate) async fn upsert_saga<C>(conn: &C, snapshot: &SagaSnapshot) -> Result<(), Error>
where
    C: DatabaseExecutor,
{
    query(
        r#"
        INSERT INTO saga
        (id, state, current_step_index, data_json, data_type, error_log, created_time, updated_time)
        VALUES
        (:id, :state, :current_step_index, :data_json, :data_type, :error_log, :created_time, :updated_time)
        ON CONFLICT(id) DO UPDATE SET
            state = excluded.state,
            current_step_index = excluded.current_step_index,
            data_json = excluded.data_json,
            error_log = excluded.error_log,
            updated_time = excluded.updated_time
        "#,
    )?
    .bind("id", snapshot.id.to_string())
    .bind("state", snapshot.state.to_string())
    .bind("current_step_index", snapshot.cursor as i64)
    .bind("data_json", snapshot.data_json.as_str())
    .bind("data_type", snapshot.data_type.as_str())
    .bind("error_log", serde_json::to_string(&snapshot.error_log)?)
    .bind("created_time", snapshot.created_time)
    .bind("updated_time", unix_time_millis())
    .execute(conn)
    .await?;

    Ok(())
}

/// Insert a brand new saga row; duplicates surface as [`Error::Duplicate`].
pub(crate) async fn insert_saga<C>(conn: &C, snapshot: &SagaSnapshot) -> Result<(), Error>
where
    C: DatabaseExecutor,
{
    query(
        r#"
        INSERT INTO saga
        (id, state, current_step_index, data_json, data_type, error_log, created_time, updated_time)
        VALUES
        (:id, :state, :current_step_index, :data_json, :data_type, :error_log, :created_time, :updated_time)
        "#,
    )?
    .bind("id", snapshot.id.to_string())
    .bind("state", snapshot.state.to_string())
    .bind("current_step_index", snapshot.cursor as i64)
    .bind("data_json", snapshot.data_json.as_str())
    .bind("data_type", snapshot.data_type.as_str())
    .bind("error_log", serde_json::to_string(&snapshot.error_log)?)
    .bind("created_time", snapshot.created_time)
    .bind("updated_time", snapshot.updated_time)
    .execute(conn)
    .await?;

    Ok(())
}

#[async_trait]
impl SagasDatabase for SagaSqliteDatabase {
    async fn upsert_saga(&self, snapshot: &SagaSnapshot) -> Result<(), Error> {
        upsert_saga(self.executor(), snapshot).await
    }

    async fn get_saga(&self, id: &Uuid) -> Result<Option<SagaSnapshot>, Error> {
        query(
            r#"
            SELECT
                id,
                state,
                current_step_index,
                data_json,
                data_type,
                error_log,
                created_time,
                updated_time
            FROM
                saga
            WHERE
                id = :id
            "#,
        )?
        .bind("id", id.to_string())
        .fetch_one(self.executor())
        .await?
        .map(sql_row_to_saga)
        .transpose()
    }
}

/// Transaction writer for the atomic saga + outbox insert.
#[derive(Debug)]
pub struct SqliteSagaTransaction<'a> {
    pub(crate) inner: crate::async_rusqlite::Transaction<'a>,
}

#[async_trait]
impl DbTransactionFinalizer for SqliteSagaTransaction<'_> {
    async fn commit(self: Box<Self>) -> Result<(), Error> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), Error> {
        self.inner.rollback().await
    }
}

#[async_trait]
impl SagaTransaction for SqliteSagaTransaction<'_> {
    async fn add_saga(&mut self, snapshot: &SagaSnapshot) -> Result<(), Error> {
        insert_saga(&self.inner, snapshot).await
    }

    async fn add_outbox_message(
        &mut self,
        message: &sagakit_common::outbox::OutboxMessage,
    ) -> Result<(), Error> {
        crate::outbox::insert_outbox_message(&self.inner, message).await
    }
}
