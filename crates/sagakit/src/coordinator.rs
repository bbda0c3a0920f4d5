//! Saga coordinator: forward execution and reverse-order compensation.

use sagakit_common::saga::SagaState;
use sagakit_common::Error;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::instance::SagaInstance;
use crate::repository::SagaRepository;

/// Drives one saga to quiescence.
///
/// The outbox lease guarantees at most one coordinator drives a given saga
/// at a time, so processing is single-tasked relative to its saga. The
/// snapshot is saved after every cursor change and state transition; the
/// cursor only advances *after* a step succeeded, so a crash or
/// cancellation at any suspension point leaves a consistent snapshot.
#[derive(Debug, Clone)]
pub struct Coordinator {
    repository: SagaRepository,
}

impl Coordinator {
    /// New coordinator persisting through `repository`.
    pub fn new(repository: SagaRepository) -> Self {
        Self { repository }
    }

    /// Processes `instance` until it is terminal or a recoverable error
    /// ([`Error::RetryLater`], [`Error::LostLease`], [`Error::Cancelled`])
    /// propagates to the outbox for re-queueing.
    #[instrument(skip_all, fields(saga_id = %instance.id()))]
    pub async fn process<D>(
        &self,
        instance: &mut SagaInstance<D>,
        cancel: &CancellationToken,
    ) -> Result<(), Error>
    where
        D: Serialize + Send + Sync,
    {
        if instance.is_terminal() {
            return Ok(());
        }

        // Resumed compensation after a restart jumps straight back into the
        // compensation loop.
        if matches!(
            instance.state(),
            SagaState::Compensating | SagaState::Failed
        ) {
            if instance.state() == SagaState::Failed {
                instance.mark_compensating();
                self.repository.save(instance).await?;
            }
            return self.compensate(instance, cancel).await;
        }

        if instance.state() == SagaState::Created {
            instance.mark_running();
            self.repository.save(instance).await?;
        }

        while !instance.is_terminal() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let Some(step) = instance.current_step() else {
                instance.mark_completed();
                self.repository.save(instance).await?;
                return Ok(());
            };

            match step.execute(instance.data_mut(), cancel).await {
                Ok(()) => {
                    tracing::debug!(
                        "Step {} ({}) succeeded",
                        instance.cursor(),
                        step.name()
                    );
                    instance.advance();
                    self.repository.save(instance).await?;
                }
                Err(err @ (Error::RetryLater(_) | Error::LostLease(_))) => {
                    // Save without advancing; the outbox re-queues with the
                    // matching delay.
                    self.repository.save(instance).await?;
                    return Err(err);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    tracing::warn!(
                        "Step {} ({}) failed permanently: {}",
                        instance.cursor(),
                        step.name(),
                        err
                    );
                    instance.fail(format!("{}: {}", step.name(), err));
                    instance.mark_compensating();
                    self.repository.save(instance).await?;
                    return self.compensate(instance, cancel).await;
                }
            }
        }

        Ok(())
    }

    /// Runs compensation for every executed step in strict reverse order.
    ///
    /// A permanent compensation failure is recorded and the loop continues
    /// with the earlier steps: compensating as many of them as possible
    /// minimizes residual side effects. `FatalError` is the explicit signal
    /// for operator intervention.
    async fn compensate<D>(
        &self,
        instance: &mut SagaInstance<D>,
        cancel: &CancellationToken,
    ) -> Result<(), Error>
    where
        D: Serialize + Send + Sync,
    {
        let mut compensation_failed = false;
        let executed: Vec<_> = instance.executed_steps_reverse().collect();

        for (index, step) in executed {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match step.compensate(instance.data_mut(), cancel).await {
                Ok(()) => {
                    tracing::debug!("Compensated step {} ({})", index, step.name());
                }
                Err(err @ (Error::RetryLater(_) | Error::LostLease(_))) => {
                    // Retry the whole compensation later; the reverse
                    // iteration is deterministic so resumption re-examines
                    // the executed steps.
                    self.repository.save(instance).await?;
                    return Err(err);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    tracing::error!(
                        "Compensation of step {} ({}) failed: {}",
                        index,
                        step.name(),
                        err
                    );
                    instance.record_error(format!(
                        "COMPENSATION FAILED: step {} ({}): {}",
                        index,
                        step.name(),
                        err
                    ));
                    compensation_failed = true;
                }
            }
        }

        if compensation_failed {
            instance.mark_fatal("Manual review required");
        } else {
            instance.mark_compensated();
        }
        self.repository.save(instance).await?;

        Ok(())
    }
}
