//! Async, pipelined rusqlite client
//!
//! A dedicated thread owns the connection and executes statements sent over a
//! channel. Transactions take over the thread until they are finalized, which
//! gives them exclusive access without any locking on the Rust side.

use std::marker::PhantomData;
use std::thread::spawn;
use std::time::Instant;

use rusqlite::{ffi, Connection, ErrorCode, TransactionBehavior};
use sagakit_common::database::Error;
use tokio::sync::{mpsc, oneshot};

use crate::common::{from_sqlite, to_sqlite};
use crate::database::DatabaseExecutor;
use crate::stmt::{Column, ExpectedSqlResponse, Statement as InnerStatement};

/// The number of queued SQL statements before it starts failing
const SQL_QUEUE_SIZE: usize = 10_000;
/// How many ms is considered a slow query; slower ones are logged
const SLOW_QUERY_THRESHOLD_MS: u128 = 20;

/// Async handle over the rusqlite worker thread.
#[derive(Debug, Clone)]
pub struct AsyncRusqlite {
    sender: mpsc::Sender<DbRequest>,
}

/// Internal request for the database thread
#[derive(Debug)]
enum DbRequest {
    Sql(InnerStatement, oneshot::Sender<DbResponse>),
    Begin(oneshot::Sender<DbResponse>),
    Commit(oneshot::Sender<DbResponse>),
    Rollback(oneshot::Sender<DbResponse>),
}

#[derive(Debug)]
enum DbResponse {
    Transaction(mpsc::Sender<DbRequest>),
    AffectedRows(usize),
    Pluck(Option<Column>),
    Row(Option<Vec<Column>>),
    Rows(Vec<Vec<Column>>),
    Error(Error),
    Unexpected,
    Ok,
}

/// Maps a rusqlite failure into the shared database error, surfacing primary
/// key and unique constraint violations as `Duplicate`.
fn map_sqlite_error(err: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(
        ffi::Error {
            code,
            extended_code,
        },
        _,
    ) = &err
    {
        if *code == ErrorCode::ConstraintViolation
            && (*extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                || *extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE)
        {
            return Error::Duplicate;
        }
    }
    Error::Internal(err.to_string())
}

/// Process a query
#[inline(always)]
fn process_query(conn: &Connection, statement: InnerStatement) -> Result<DbResponse, Error> {
    let start = Instant::now();
    let expected_response = statement.expected_response;
    let (sql, placeholder_values) = statement.to_sql()?;

    if matches!(expected_response, ExpectedSqlResponse::Batch) {
        conn.execute_batch(&sql).map_err(map_sqlite_error)?;
        return Ok(DbResponse::Ok);
    }

    let mut stmt = conn.prepare_cached(&sql).map_err(map_sqlite_error)?;
    for (i, value) in placeholder_values.into_iter().enumerate() {
        stmt.raw_bind_parameter(i + 1, to_sqlite(value))
            .map_err(map_sqlite_error)?;
    }

    let columns = stmt.column_count();

    let to_return = match expected_response {
        ExpectedSqlResponse::Batch => unreachable!("handled above"),
        ExpectedSqlResponse::AffectedRows => {
            DbResponse::AffectedRows(stmt.raw_execute().map_err(map_sqlite_error)?)
        }
        ExpectedSqlResponse::ManyRows => {
            let mut rows = stmt.raw_query();
            let mut results = vec![];

            while let Some(row) = rows.next().map_err(map_sqlite_error)? {
                results.push(
                    (0..columns)
                        .map(|i| row.get(i).map(from_sqlite))
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(map_sqlite_error)?,
                )
            }

            DbResponse::Rows(results)
        }
        ExpectedSqlResponse::Pluck => {
            let mut rows = stmt.raw_query();
            DbResponse::Pluck(
                rows.next()
                    .map_err(map_sqlite_error)?
                    .map(|row| row.get(0usize).map(from_sqlite))
                    .transpose()
                    .map_err(map_sqlite_error)?,
            )
        }
        ExpectedSqlResponse::SingleRow => {
            let mut rows = stmt.raw_query();
            let row = rows
                .next()
                .map_err(map_sqlite_error)?
                .map(|row| {
                    (0..columns)
                        .map(|i| row.get(i).map(from_sqlite))
                        .collect::<Result<Vec<_>, _>>()
                })
                .transpose()
                .map_err(map_sqlite_error)?;
            DbResponse::Row(row)
        }
    };

    let duration = start.elapsed();

    if duration.as_millis() > SLOW_QUERY_THRESHOLD_MS {
        tracing::warn!("[SLOW QUERY] Took {} ms: {}", duration.as_millis(), sql);
    }

    Ok(to_return)
}

/// # Rusqlite main worker
///
/// Takes ownership of the connection and executes every statement sent over
/// the channel, replying through the provided oneshot. Transactions hijack
/// the loop until they are finalized; there is no point in queueing further
/// statements while a transaction holds exclusive access.
///
/// This is meant to be called in its own thread; it does not exit the loop
/// until the communication channel is closed.
fn rusqlite_worker_manager(mut receiver: mpsc::Receiver<DbRequest>, mut conn: Connection) {
    let mut tx_id: usize = 0;

    while let Some(request) = receiver.blocking_recv() {
        match request {
            DbRequest::Sql(statement, reply_to) => {
                let _ = match process_query(&conn, statement) {
                    Ok(ok) => reply_to.send(ok),
                    Err(err) => {
                        tracing::error!("Failed query with error {}", err);
                        reply_to.send(DbResponse::Error(err))
                    }
                };
            }
            DbRequest::Begin(reply_to) => {
                let (sender, mut tx_receiver) = mpsc::channel(SQL_QUEUE_SIZE);
                let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
                    Ok(tx) => tx,
                    Err(err) => {
                        tracing::error!("Failed to begin a transaction: {}", err);
                        let _ = reply_to.send(DbResponse::Error(map_sqlite_error(err)));
                        continue;
                    }
                };

                // Transaction has begun successfully, send the `sender` back
                // to the caller and wait for statements to execute. On `Drop`
                // the wrapper transaction sends a rollback.
                let _ = reply_to.send(DbResponse::Transaction(sender));

                tx_id += 1;

                loop {
                    let request = if let Some(request) = tx_receiver.blocking_recv() {
                        request
                    } else {
                        // All senders are gone without an explicit `Commit`,
                        // roll the transaction back
                        tracing::trace!("Tx {}: transaction rollback on drop", tx_id);
                        let _ = tx.rollback();
                        break;
                    };

                    match request {
                        DbRequest::Commit(reply_to) => {
                            tracing::trace!("Tx {}: commit", tx_id);
                            let _ = reply_to.send(match tx.commit() {
                                Ok(()) => DbResponse::Ok,
                                Err(err) => {
                                    tracing::error!("Failed commit {}", err);
                                    DbResponse::Error(map_sqlite_error(err))
                                }
                            });
                            break;
                        }
                        DbRequest::Rollback(reply_to) => {
                            tracing::trace!("Tx {}: rollback", tx_id);
                            let _ = reply_to.send(match tx.rollback() {
                                Ok(()) => DbResponse::Ok,
                                Err(err) => {
                                    tracing::error!("Failed rollback {}", err);
                                    DbResponse::Error(map_sqlite_error(err))
                                }
                            });
                            break;
                        }
                        DbRequest::Begin(reply_to) => {
                            let _ = reply_to.send(DbResponse::Unexpected);
                        }
                        DbRequest::Sql(statement, reply_to) => {
                            let _ = match process_query(&tx, statement) {
                                Ok(ok) => reply_to.send(ok),
                                Err(err) => {
                                    tracing::error!(
                                        "Tx {}: failed query with error {}",
                                        tx_id,
                                        err
                                    );
                                    reply_to.send(DbResponse::Error(err))
                                }
                            };
                        }
                    }
                }
            }
            DbRequest::Commit(reply_to) => {
                let _ = reply_to.send(DbResponse::Unexpected);
            }
            DbRequest::Rollback(reply_to) => {
                let _ = reply_to.send(DbResponse::Unexpected);
            }
        }
    }
}

impl AsyncRusqlite {
    /// Creates a new Async Rusqlite wrapper owning `conn`.
    pub fn new(conn: Connection) -> Self {
        let (sender, receiver) = mpsc::channel(SQL_QUEUE_SIZE);
        spawn(move || {
            rusqlite_worker_manager(receiver, conn);
        });

        Self { sender }
    }

    fn get_queue_sender(&self) -> &mpsc::Sender<DbRequest> {
        &self.sender
    }

    /// Begins a transaction
    ///
    /// If the transaction is dropped it will trigger a rollback operation
    pub async fn begin(&self) -> Result<Transaction<'_>, Error> {
        let (sender, receiver) = oneshot::channel();
        self.sender
            .send(DbRequest::Begin(sender))
            .await
            .map_err(|_| Error::Internal("Communication".to_owned()))?;

        match receiver
            .await
            .map_err(|_| Error::Internal("Communication".to_owned()))?
        {
            DbResponse::Transaction(db_sender) => Ok(Transaction {
                db_sender,
                _marker: PhantomData,
            }),
            DbResponse::Error(err) => Err(err),
            _ => Err(Error::InvalidDbResponse),
        }
    }
}

macro_rules! send_request {
    ($sender:expr, $statement:expr, $expected:ident, $response:ident => $out:expr) => {{
        let (sender, receiver) = oneshot::channel();
        let mut statement = $statement;
        statement.expected_response = ExpectedSqlResponse::$expected;
        $sender
            .send(DbRequest::Sql(statement, sender))
            .await
            .map_err(|_| Error::Internal("Communication".to_owned()))?;

        match receiver
            .await
            .map_err(|_| Error::Internal("Communication".to_owned()))?
        {
            DbResponse::$response(value) => Ok($out(value)),
            DbResponse::Ok => Err(Error::InvalidDbResponse),
            DbResponse::Error(err) => Err(err),
            _ => Err(Error::InvalidDbResponse),
        }
    }};
}

macro_rules! send_unit_request {
    ($sender:expr, $statement:expr, $expected:ident) => {{
        let (sender, receiver) = oneshot::channel();
        let mut statement = $statement;
        statement.expected_response = ExpectedSqlResponse::$expected;
        $sender
            .send(DbRequest::Sql(statement, sender))
            .await
            .map_err(|_| Error::Internal("Communication".to_owned()))?;

        match receiver
            .await
            .map_err(|_| Error::Internal("Communication".to_owned()))?
        {
            DbResponse::Ok => Ok(()),
            DbResponse::Error(err) => Err(err),
            _ => Err(Error::InvalidDbResponse),
        }
    }};
}

#[async_trait::async_trait]
impl DatabaseExecutor for AsyncRusqlite {
    async fn execute(&self, statement: InnerStatement) -> Result<usize, Error> {
        send_request!(self.get_queue_sender(), statement, AffectedRows, AffectedRows => |n| n)
    }

    async fn fetch_one(&self, statement: InnerStatement) -> Result<Option<Vec<Column>>, Error> {
        send_request!(self.get_queue_sender(), statement, SingleRow, Row => |row| row)
    }

    async fn fetch_all(&self, statement: InnerStatement) -> Result<Vec<Vec<Column>>, Error> {
        send_request!(self.get_queue_sender(), statement, ManyRows, Rows => |rows| rows)
    }

    async fn pluck(&self, statement: InnerStatement) -> Result<Option<Column>, Error> {
        send_request!(self.get_queue_sender(), statement, Pluck, Pluck => |value| value)
    }

    async fn batch(&self, statement: InnerStatement) -> Result<(), Error> {
        send_unit_request!(self.get_queue_sender(), statement, Batch)
    }
}

/// Database transaction
#[derive(Debug)]
pub struct Transaction<'conn> {
    db_sender: mpsc::Sender<DbRequest>,
    _marker: PhantomData<&'conn ()>,
}

impl Transaction<'_> {
    fn get_queue_sender(&self) -> &mpsc::Sender<DbRequest> {
        &self.db_sender
    }

    /// Consumes the transaction committing the changes
    pub async fn commit(self) -> Result<(), Error> {
        let (sender, receiver) = oneshot::channel();
        self.db_sender
            .send(DbRequest::Commit(sender))
            .await
            .map_err(|_| Error::Internal("Communication".to_owned()))?;

        match receiver
            .await
            .map_err(|_| Error::Internal("Communication".to_owned()))?
        {
            DbResponse::Ok => Ok(()),
            DbResponse::Error(err) => Err(err),
            _ => Err(Error::InvalidDbResponse),
        }
    }

    /// Consumes the transaction rolling back all changes
    pub async fn rollback(self) -> Result<(), Error> {
        let (sender, receiver) = oneshot::channel();
        self.db_sender
            .send(DbRequest::Rollback(sender))
            .await
            .map_err(|_| Error::Internal("Communication".to_owned()))?;

        match receiver
            .await
            .map_err(|_| Error::Internal("Communication".to_owned()))?
        {
            DbResponse::Ok => Ok(()),
            DbResponse::Error(err) => Err(err),
            _ => Err(Error::InvalidDbResponse),
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        let (sender, _) = oneshot::channel();
        let _ = self.db_sender.try_send(DbRequest::Rollback(sender));
    }
}

#[async_trait::async_trait]
impl DatabaseExecutor for Transaction<'_> {
    async fn execute(&self, statement: InnerStatement) -> Result<usize, Error> {
        send_request!(self.get_queue_sender(), statement, AffectedRows, AffectedRows => |n| n)
    }

    async fn fetch_one(&self, statement: InnerStatement) -> Result<Option<Vec<Column>>, Error> {
        send_request!(self.get_queue_sender(), statement, SingleRow, Row => |row| row)
    }

    async fn fetch_all(&self, statement: InnerStatement) -> Result<Vec<Vec<Column>>, Error> {
        send_request!(self.get_queue_sender(), statement, ManyRows, Rows => |rows| rows)
    }

    async fn pluck(&self, statement: InnerStatement) -> Result<Option<Column>, Error> {
        send_request!(self.get_queue_sender(), statement, Pluck, Pluck => |value| value)
    }

    async fn batch(&self, statement: InnerStatement) -> Result<(), Error> {
        send_unit_request!(self.get_queue_sender(), statement, Batch)
    }
}
