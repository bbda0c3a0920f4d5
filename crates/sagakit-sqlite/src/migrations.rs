//! Schema migrations
//!
//! Rudimentary but standard migration and versioning system: every migration
//! is a named batch of statements, applied in order and recorded in the
//! `migrations` table so reruns are no-ops.

use sagakit_common::database::Error;

use crate::column_as_string;
use crate::database::DatabaseExecutor;
use crate::stmt::query;

/// Ordered list of `(name, sql)` migrations.
pub static MIGRATIONS: &[(&str, &str)] = &[(
    "20250701120000_init",
    r#"
CREATE TABLE IF NOT EXISTS saga (
    id TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    current_step_index INTEGER NOT NULL DEFAULT 0,
    data_json TEXT NOT NULL,
    data_type TEXT NOT NULL,
    error_log TEXT NOT NULL DEFAULT '[]',
    created_time INTEGER NOT NULL,
    updated_time INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS outbox_message (
    id TEXT PRIMARY KEY,
    message_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_time INTEGER NOT NULL,
    processed_time INTEGER,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    locked_by TEXT,
    locked_until INTEGER
);

CREATE INDEX IF NOT EXISTS outbox_unprocessed_index
    ON outbox_message(processed_time) WHERE processed_time IS NULL;
CREATE INDEX IF NOT EXISTS outbox_created_time_index
    ON outbox_message(created_time);

CREATE TABLE IF NOT EXISTS idempotency_key (
    key TEXT PRIMARY KEY,
    created_time INTEGER NOT NULL,
    is_consumed BOOLEAN NOT NULL DEFAULT FALSE,
    locked_by TEXT,
    locked_until INTEGER
);

CREATE TABLE IF NOT EXISTS ledger_entry (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    amount INTEGER NOT NULL,
    kind INTEGER NOT NULL,
    reference_id TEXT NOT NULL UNIQUE,
    created_time INTEGER NOT NULL,
    reason TEXT
);

CREATE INDEX IF NOT EXISTS ledger_account_index ON ledger_entry(account_id);
"#,
)];

/// Applies every pending migration.
pub(crate) async fn migrate<C>(conn: &C) -> Result<(), Error>
where
    C: DatabaseExecutor,
{
    query(
        r#"
        CREATE TABLE IF NOT EXISTS migrations (
            name TEXT PRIMARY KEY,
            applied_time INTEGER NOT NULL
        )
        "#,
    )?
    .batch(conn)
    .await?;

    let applied = query(r#"SELECT name FROM migrations"#)?
        .fetch_all(conn)
        .await?
        .into_iter()
        .map(|row| Ok(column_as_string!(&row[0])))
        .collect::<Result<std::collections::HashSet<String>, Error>>()?;

    for (name, sql) in MIGRATIONS {
        if applied.contains(*name) {
            continue;
        }

        tracing::info!("Applying migration {}", name);
        query(sql)?.batch(conn).await?;
        query(r#"INSERT INTO migrations (name, applied_time) VALUES (:name, :applied_time)"#)?
            .bind("name", *name)
            .bind("applied_time", sagakit_common::util::unix_time_millis())
            .execute(conn)
            .await?;
    }

    Ok(())
}
