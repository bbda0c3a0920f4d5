//! In-memory saga state machine.

use std::fmt;
use std::sync::Arc;

use sagakit_common::saga::{SagaSnapshot, SagaState};
use sagakit_common::util::unix_time_millis;
use sagakit_common::Error;
use serde::Serialize;
use uuid::Uuid;

use crate::step::SagaStep;

/// A saga rehydrated into memory, owned transiently by whichever worker
/// holds the outbox lease for it.
///
/// All state is opaque to callers except through the transition operations
/// below. Every mutator is a guarded no-op once the saga reached a terminal
/// state, and invalid transitions are ignored, so replays after crashes can
/// never corrupt the state machine.
pub struct SagaInstance<D> {
    id: Uuid,
    state: SagaState,
    cursor: usize,
    data: D,
    data_type: String,
    error_log: Vec<String>,
    steps: Vec<Arc<dyn SagaStep<D>>>,
    created_time: u64,
}

impl<D> fmt::Debug for SagaInstance<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaInstance")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("cursor", &self.cursor)
            .field("steps", &self.steps.len())
            .finish()
    }
}

impl<D> SagaInstance<D> {
    /// Fresh saga in `Created` at cursor zero.
    pub fn new(
        id: Uuid,
        data: D,
        data_type: impl Into<String>,
        steps: Vec<Arc<dyn SagaStep<D>>>,
    ) -> Self {
        Self {
            id,
            state: SagaState::Created,
            cursor: 0,
            data,
            data_type: data_type.into(),
            error_log: Vec::new(),
            steps,
            created_time: unix_time_millis(),
        }
    }

    /// Rehydrates an instance from persisted state. Used by the repository
    /// only.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn load_state(
        id: Uuid,
        state: SagaState,
        cursor: usize,
        data: D,
        data_type: String,
        error_log: Vec<String>,
        steps: Vec<Arc<dyn SagaStep<D>>>,
        created_time: u64,
    ) -> Self {
        Self {
            id,
            state,
            cursor,
            data,
            data_type,
            error_log,
            steps,
            created_time,
        }
    }

    /// Saga id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Tag identifying the data shape and step list of this saga
    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    /// Current state
    pub fn state(&self) -> SagaState {
        self.state
    }

    /// Index of the next step to execute
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Saga data
    pub fn data(&self) -> &D {
        &self.data
    }

    /// Mutable saga data, handed to steps
    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    /// Failures recorded while driving this saga, in order
    pub fn error_log(&self) -> &[String] {
        &self.error_log
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The step the cursor points at, if any
    pub fn current_step(&self) -> Option<Arc<dyn SagaStep<D>>> {
        self.steps.get(self.cursor).cloned()
    }

    /// Executed steps in strict reverse order: `(index, step)` for
    /// `index = cursor - 1 .. 0`. The iteration is deterministic so a
    /// resumed compensation re-examines the same steps.
    pub fn executed_steps_reverse(
        &self,
    ) -> impl Iterator<Item = (usize, Arc<dyn SagaStep<D>>)> + '_ {
        (0..self.cursor.min(self.steps.len()))
            .rev()
            .map(|index| (index, self.steps[index].clone()))
    }

    /// `Created` -> `Running`
    pub fn mark_running(&mut self) {
        if self.state == SagaState::Created {
            self.state = SagaState::Running;
        }
    }

    /// Advance the cursor after a successful step; completes the saga when
    /// the last step ran.
    pub fn advance(&mut self) {
        if self.state != SagaState::Running {
            return;
        }
        self.cursor += 1;
        if self.cursor >= self.steps.len() {
            self.state = SagaState::Completed;
        }
    }

    /// `Running` -> `Completed`, for sagas that have no step left to run.
    pub fn mark_completed(&mut self) {
        if self.state == SagaState::Running {
            self.state = SagaState::Completed;
        }
    }

    /// `Running` -> `Failed`, recording the reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.state == SagaState::Running {
            self.state = SagaState::Failed;
            self.error_log.push(reason.into());
        }
    }

    /// `Failed` or `Running` -> `Compensating`
    pub fn mark_compensating(&mut self) {
        if matches!(self.state, SagaState::Failed | SagaState::Running) {
            self.state = SagaState::Compensating;
        }
    }

    /// `Compensating` -> `Compensated`
    pub fn mark_compensated(&mut self) {
        if self.state == SagaState::Compensating {
            self.state = SagaState::Compensated;
        }
    }

    /// `Compensating` -> `FatalError`, recording the reason.
    pub fn mark_fatal(&mut self, reason: impl Into<String>) {
        if self.state == SagaState::Compensating {
            self.state = SagaState::FatalError;
            self.error_log.push(reason.into());
        }
    }

    /// Record a failure without changing state (compensation failures are
    /// collected while the loop keeps going).
    pub fn record_error(&mut self, reason: impl Into<String>) {
        self.error_log.push(reason.into());
    }
}

impl<D> SagaInstance<D>
where
    D: Serialize,
{
    /// The persistable form of this instance.
    pub fn snapshot(&self) -> Result<SagaSnapshot, Error> {
        Ok(SagaSnapshot {
            id: self.id,
            state: self.state,
            cursor: self.cursor,
            data_json: serde_json::to_string(&self.data)?,
            data_type: self.data_type.clone(),
            error_log: self.error_log.clone(),
            created_time: self.created_time,
            updated_time: unix_time_millis(),
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;

    struct NoopStep;

    #[async_trait]
    impl SagaStep<()> for NoopStep {
        fn name(&self) -> &str {
            "Noop"
        }

        async fn execute(&self, _data: &mut (), _cancel: &CancellationToken) -> Result<(), Error> {
            Ok(())
        }

        async fn compensate(
            &self,
            _data: &mut (),
            _cancel: &CancellationToken,
        ) -> Result<(), Error> {
            Ok(())
        }
    }

    fn two_step_instance() -> SagaInstance<()> {
        SagaInstance::new(
            Uuid::new_v4(),
            (),
            "Noop",
            vec![Arc::new(NoopStep), Arc::new(NoopStep)],
        )
    }

    #[test]
    fn test_forward_transitions() {
        let mut saga = two_step_instance();
        assert_eq!(saga.state(), SagaState::Created);

        saga.mark_running();
        assert_eq!(saga.state(), SagaState::Running);

        saga.advance();
        assert_eq!(saga.state(), SagaState::Running);
        assert_eq!(saga.cursor(), 1);

        saga.advance();
        assert_eq!(saga.state(), SagaState::Completed);
        assert_eq!(saga.cursor(), 2);
        assert!(saga.current_step().is_none());
    }

    #[test]
    fn test_fail_then_compensation_transitions() {
        let mut saga = two_step_instance();
        saga.mark_running();
        saga.advance();

        saga.fail("credit refused");
        assert_eq!(saga.state(), SagaState::Failed);
        assert_eq!(saga.error_log(), ["credit refused"]);

        saga.mark_compensating();
        assert_eq!(saga.state(), SagaState::Compensating);

        saga.mark_compensated();
        assert_eq!(saga.state(), SagaState::Compensated);
    }

    #[test]
    fn test_fatal_records_reason() {
        let mut saga = two_step_instance();
        saga.mark_running();
        saga.advance();
        saga.fail("boom");
        saga.mark_compensating();
        saga.record_error("COMPENSATION FAILED: step 0 (Noop): boom");
        saga.mark_fatal("Manual review required");

        assert_eq!(saga.state(), SagaState::FatalError);
        assert_eq!(saga.error_log().len(), 3);
    }

    #[test]
    fn test_terminal_states_guard_mutators() {
        let mut saga = two_step_instance();
        saga.mark_running();
        saga.advance();
        saga.advance();
        assert_eq!(saga.state(), SagaState::Completed);

        saga.fail("late failure");
        saga.mark_compensating();
        saga.advance();
        assert_eq!(saga.state(), SagaState::Completed);
        assert_eq!(saga.cursor(), 2);
        assert!(saga.error_log().is_empty());
    }

    #[test]
    fn test_executed_steps_reverse_order() {
        let mut saga = two_step_instance();
        saga.mark_running();
        saga.advance();
        saga.advance();

        let indexes: Vec<usize> = saga.executed_steps_reverse().map(|(i, _)| i).collect();
        assert_eq!(indexes, vec![1, 0]);
    }

    #[test]
    fn test_no_steps_executed_means_empty_reverse_iteration() {
        let saga = two_step_instance();
        assert_eq!(saga.executed_steps_reverse().count(), 0);
    }
}
