//! Saga types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::unix_time_millis;

/// State of a saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaState {
    /// Persisted but not yet picked up by a worker
    Created,
    /// Executing forward steps
    Running,
    /// All steps executed
    Completed,
    /// A step failed permanently; compensation has not started yet
    Failed,
    /// Executing compensations in reverse order
    Compensating,
    /// Every executed step was compensated
    Compensated,
    /// At least one compensation failed permanently; operator intervention
    /// is required
    FatalError,
}

impl SagaState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Compensated | SagaState::FatalError
        )
    }

    /// Forward states are the ones in which the cursor may still advance.
    pub fn is_forward(&self) -> bool {
        matches!(self, SagaState::Created | SagaState::Running)
    }
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SagaState::Created => "Created",
            SagaState::Running => "Running",
            SagaState::Completed => "Completed",
            SagaState::Failed => "Failed",
            SagaState::Compensating => "Compensating",
            SagaState::Compensated => "Compensated",
            SagaState::FatalError => "FatalError",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SagaState {
    type Err = crate::database::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Created" => Ok(SagaState::Created),
            "Running" => Ok(SagaState::Running),
            "Completed" => Ok(SagaState::Completed),
            "Failed" => Ok(SagaState::Failed),
            "Compensating" => Ok(SagaState::Compensating),
            "Compensated" => Ok(SagaState::Compensated),
            "FatalError" => Ok(SagaState::FatalError),
            state => Err(crate::database::Error::InvalidSagaState(state.to_owned())),
        }
    }
}

/// Persisted form of a saga.
///
/// The snapshot is the durable truth; the in-memory instance a worker drives
/// is rehydrated from it and written back after every cursor change or state
/// transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaSnapshot {
    /// Saga id
    pub id: Uuid,
    /// Current state
    pub state: SagaState,
    /// Index of the next step to execute; `cursor == steps.len()` means all
    /// steps ran
    pub cursor: usize,
    /// Saga data serialized as JSON
    pub data_json: String,
    /// Tag identifying the data shape and step list for this saga
    pub data_type: String,
    /// Ordered log of failures observed while driving this saga
    pub error_log: Vec<String>,
    /// Unix millis the saga was created
    pub created_time: u64,
    /// Unix millis of the last snapshot write
    pub updated_time: u64,
}

impl SagaSnapshot {
    /// New snapshot for a freshly accepted saga.
    pub fn new(id: Uuid, data_json: String, data_type: String) -> Self {
        let now = unix_time_millis();
        Self {
            id,
            state: SagaState::Created,
            cursor: 0,
            data_json,
            data_type,
            error_log: Vec::new(),
            created_time: now,
            updated_time: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            SagaState::Created,
            SagaState::Running,
            SagaState::Completed,
            SagaState::Failed,
            SagaState::Compensating,
            SagaState::Compensated,
            SagaState::FatalError,
        ] {
            assert_eq!(SagaState::from_str(&state.to_string()).ok(), Some(state));
        }
        assert!(SagaState::from_str("Bogus").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(SagaState::Completed.is_terminal());
        assert!(SagaState::Compensated.is_terminal());
        assert!(SagaState::FatalError.is_terminal());
        assert!(!SagaState::Running.is_terminal());
        assert!(!SagaState::Compensating.is_terminal());
    }
}
