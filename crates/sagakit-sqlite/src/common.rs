//! Connection setup and value conversions for rusqlite.

use rusqlite::Connection;

use crate::value::Value;

/// Opens a configured rusqlite connection to a SQLite database.
pub fn open_connection(path: &str) -> Result<Connection, rusqlite::Error> {
    let conn = if path.contains(":memory:") {
        Connection::open_in_memory()?
    } else {
        Connection::open(path)?
    };

    // Apply pragmas
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "journal_mode", "wal")?;
    conn.pragma_update(None, "synchronous", "normal")?;
    conn.pragma_update(None, "temp_store", "memory")?;
    conn.pragma_update(None, "foreign_keys", "on")?;

    Ok(conn)
}

pub(crate) fn to_sqlite(value: Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Integer(n) => rusqlite::types::Value::Integer(n),
        Value::Real(f) => rusqlite::types::Value::Real(f),
        Value::Text(text) => rusqlite::types::Value::Text(text),
        Value::Blob(bytes) => rusqlite::types::Value::Blob(bytes),
    }
}

pub(crate) fn from_sqlite(value: rusqlite::types::Value) -> Value {
    match value {
        rusqlite::types::Value::Null => Value::Null,
        rusqlite::types::Value::Integer(n) => Value::Integer(n),
        rusqlite::types::Value::Real(f) => Value::Real(f),
        rusqlite::types::Value::Text(text) => Value::Text(text),
        rusqlite::types::Value::Blob(bytes) => Value::Blob(bytes),
    }
}
