//! SQLite storage backend for sagakit.
//!
//! Statements are written with `:name` placeholders and executed by a
//! dedicated thread owning the connection (see [`async_rusqlite`]), so the
//! async engine never blocks on SQLite. The schema is created and upgraded
//! through embedded migrations on open.

use async_trait::async_trait;
use sagakit_common::database::{Database, Error, SagaTransaction};

pub mod async_rusqlite;
pub mod common;
pub mod database;
pub mod memory;
pub mod migrations;
pub mod stmt;
pub mod value;

mod idempotency;
mod ledger;
mod macros;
mod outbox;
mod saga;

pub use saga::SqliteSagaTransaction;

use crate::async_rusqlite::AsyncRusqlite;

/// Saga SQLite Database
#[derive(Debug, Clone)]
pub struct SagaSqliteDatabase {
    db: AsyncRusqlite,
}

impl SagaSqliteDatabase {
    /// Opens (creating if needed) a database at `path` and applies pending
    /// migrations. `":memory:"` yields a private in-memory database.
    pub async fn new(path: &str) -> Result<Self, Error> {
        let conn = common::open_connection(path).map_err(|e| Error::Database(Box::new(e)))?;
        let db = Self {
            db: AsyncRusqlite::new(conn),
        };
        migrations::migrate(&db.db).await?;
        Ok(db)
    }

    pub(crate) fn executor(&self) -> &AsyncRusqlite {
        &self.db
    }
}

#[async_trait]
impl Database for SagaSqliteDatabase {
    async fn begin_transaction<'a>(
        &'a self,
    ) -> Result<Box<dyn SagaTransaction + Send + Sync + 'a>, Error> {
        Ok(Box::new(SqliteSagaTransaction {
            inner: self.db.begin().await?,
        }))
    }
}

#[cfg(test)]
mod tests;
