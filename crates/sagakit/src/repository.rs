//! Saga repository: atomic acceptance, snapshot persistence, rehydration.

use std::sync::Arc;

use sagakit_common::database::{Database, DbTransactionFinalizer, DynSagaDatabase, SagasDatabase};
use sagakit_common::outbox::OutboxMessage;
use sagakit_common::saga::{SagaSnapshot, SagaState};
use sagakit_common::Error;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use crate::instance::SagaInstance;
use crate::step::SagaStep;

/// Owns the persisted saga snapshot. Each [`load`](Self::load) returns a
/// fresh instance; nothing holds a back-pointer.
#[derive(Debug, Clone)]
pub struct SagaRepository {
    db: DynSagaDatabase,
}

impl SagaRepository {
    /// New repository over `db`.
    pub fn new(db: DynSagaDatabase) -> Self {
        Self { db }
    }

    /// Accepts a new saga: inserts the snapshot (`Created`, cursor zero,
    /// empty error log) and its `StartSaga` outbox row in one transaction.
    /// On failure neither row exists.
    #[instrument(skip(self, data))]
    pub async fn create_saga<D>(
        &self,
        saga_id: Uuid,
        data: &D,
        data_type: &str,
    ) -> Result<SagaSnapshot, Error>
    where
        D: Serialize + Sync,
    {
        let snapshot = SagaSnapshot::new(
            saga_id,
            serde_json::to_string(data)?,
            data_type.to_owned(),
        );
        let message = OutboxMessage::start_saga(saga_id);

        let mut tx = self.db.begin_transaction().await?;

        if let Err(err) = tx.add_saga(&snapshot).await {
            tx.rollback().await?;
            return Err(err.into());
        }

        if let Err(err) = tx.add_outbox_message(&message).await {
            tx.rollback().await?;
            return Err(err.into());
        }

        tx.commit().await?;

        tracing::info!("Accepted saga {} ({})", saga_id, data_type);

        Ok(snapshot)
    }

    /// Persists the instance's current snapshot. Called after every cursor
    /// change and state transition.
    pub async fn save<D>(&self, instance: &SagaInstance<D>) -> Result<(), Error>
    where
        D: Serialize,
    {
        self.db.upsert_saga(&instance.snapshot()?).await?;
        Ok(())
    }

    /// Rehydrates a saga, attaching the caller's step list.
    ///
    /// A forward snapshot whose cursor already covers every step is promoted
    /// to `Completed` (self-healing; the process died between the last step
    /// and the final save).
    #[instrument(skip(self, steps))]
    pub async fn load<D>(
        &self,
        saga_id: &Uuid,
        steps: Vec<Arc<dyn SagaStep<D>>>,
    ) -> Result<Option<SagaInstance<D>>, Error>
    where
        D: DeserializeOwned,
    {
        let Some(snapshot) = self.db.get_saga(saga_id).await? else {
            return Ok(None);
        };

        let data: D = serde_json::from_str(&snapshot.data_json)
            .map_err(|err| Error::CorruptSnapshot(format!("saga {saga_id}: {err}")))?;

        let mut state = snapshot.state;
        if snapshot.cursor >= steps.len() && state.is_forward() {
            tracing::debug!(
                "Saga {} rehydrated at cursor {} with state {}, promoting to Completed",
                saga_id,
                snapshot.cursor,
                state
            );
            state = SagaState::Completed;
        }

        Ok(Some(SagaInstance::load_state(
            snapshot.id,
            state,
            snapshot.cursor,
            data,
            snapshot.data_type,
            snapshot.error_log,
            steps,
            snapshot.created_time,
        )))
    }

    /// Raw snapshot read, used by status surfaces.
    pub async fn get_snapshot(&self, saga_id: &Uuid) -> Result<Option<SagaSnapshot>, Error> {
        Ok(self.db.get_saga(saga_id).await?)
    }
}
