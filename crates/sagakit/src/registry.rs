//! Saga-type registry.
//!
//! Each saga type pairs a data shape with a step sequence. The composition
//! root assembles a driver per type — with the idempotency store and ledger
//! already wired into its steps — and the outbox worker dispatches through
//! the registry without knowing any concrete data type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use sagakit_common::database::{DynSagaDatabase, SagasDatabase};
use sagakit_common::Error;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::coordinator::Coordinator;
use crate::repository::SagaRepository;
use crate::step::SagaStep;

/// Type-erased driver for one saga type.
#[async_trait]
pub trait SagaDriver: Send + Sync {
    /// The `data_type` tag this driver handles
    fn data_type(&self) -> &str;

    /// Step names in declared order
    fn step_names(&self) -> Vec<String>;

    /// Rehydrates the saga and drives it to quiescence
    async fn drive(&self, saga_id: Uuid, cancel: &CancellationToken) -> Result<(), Error>;
}

/// Generic [`SagaDriver`] binding a data type to its step list.
pub struct TypedSagaDriver<D> {
    data_type: String,
    repository: SagaRepository,
    coordinator: Coordinator,
    steps: Vec<Arc<dyn SagaStep<D>>>,
}

impl<D> TypedSagaDriver<D> {
    /// New driver for `data_type` over the given step list.
    pub fn new(
        data_type: impl Into<String>,
        repository: SagaRepository,
        steps: Vec<Arc<dyn SagaStep<D>>>,
    ) -> Self {
        let coordinator = Coordinator::new(repository.clone());
        Self {
            data_type: data_type.into(),
            repository,
            coordinator,
            steps,
        }
    }
}

impl<D> fmt::Debug for TypedSagaDriver<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedSagaDriver")
            .field("data_type", &self.data_type)
            .field("steps", &self.steps.len())
            .finish()
    }
}

#[async_trait]
impl<D> SagaDriver for TypedSagaDriver<D>
where
    D: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn data_type(&self) -> &str {
        &self.data_type
    }

    fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|step| step.name().to_owned()).collect()
    }

    async fn drive(&self, saga_id: Uuid, cancel: &CancellationToken) -> Result<(), Error> {
        let mut instance = self
            .repository
            .load(&saga_id, self.steps.clone())
            .await?
            .ok_or(Error::SagaNotFound(saga_id))?;

        self.coordinator.process(&mut instance, cancel).await
    }
}

/// Maps `data_type` tags to their drivers.
pub struct SagaRegistry {
    db: DynSagaDatabase,
    drivers: HashMap<String, Arc<dyn SagaDriver>>,
}

impl fmt::Debug for SagaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaRegistry")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SagaRegistry {
    /// New empty registry over `db`.
    pub fn new(db: DynSagaDatabase) -> Self {
        Self {
            db,
            drivers: HashMap::new(),
        }
    }

    /// Registers a driver under its data type. The latest registration for
    /// a tag wins.
    pub fn register(&mut self, driver: Arc<dyn SagaDriver>) {
        self.drivers.insert(driver.data_type().to_owned(), driver);
    }

    /// Step names for a saga type, if registered.
    pub fn step_names(&self, data_type: &str) -> Option<Vec<String>> {
        self.drivers
            .get(data_type)
            .map(|driver| driver.step_names())
    }

    /// Loads the saga's snapshot to learn its type and hands it to the
    /// matching driver.
    pub async fn drive(&self, saga_id: Uuid, cancel: &CancellationToken) -> Result<(), Error> {
        let snapshot = self
            .db
            .get_saga(&saga_id)
            .await?
            .ok_or(Error::SagaNotFound(saga_id))?;

        let driver = self
            .drivers
            .get(&snapshot.data_type)
            .ok_or_else(|| Error::UnknownSagaType(snapshot.data_type.clone()))?;

        driver.drive(saga_id, cancel).await
    }
}
