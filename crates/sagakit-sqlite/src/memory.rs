//! In-memory database provided by the `sagakit-sqlite` crate, mainly for
//! testing purposes.

use sagakit_common::database::Error;

use crate::SagaSqliteDatabase;

/// Creates a new in-memory [`SagaSqliteDatabase`] instance
pub async fn empty() -> Result<SagaSqliteDatabase, Error> {
    SagaSqliteDatabase::new(":memory:").await
}
