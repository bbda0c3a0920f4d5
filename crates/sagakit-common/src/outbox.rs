//! Transactional outbox types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::unix_time_millis;

/// Message type dispatched when a saga row is created.
pub const START_SAGA: &str = "StartSaga";

/// Maximum length persisted for `last_error`; longer reasons are truncated.
pub const LAST_ERROR_MAX_LEN: usize = 500;

/// A durable intent row, written in the same transaction as the business
/// state it refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Message id
    pub id: Uuid,
    /// Message type, drives worker dispatch
    pub message_type: String,
    /// JSON payload
    pub payload: String,
    /// Unix millis the message was enqueued
    pub created_time: u64,
    /// Unix millis the message was finalized; set exactly once
    pub processed_time: Option<u64>,
    /// Failed dispatch attempts (transient conflicts do not count)
    pub attempt_count: u32,
    /// Reason recorded by the most recent failed attempt
    pub last_error: Option<String>,
    /// Worker currently holding the lease
    pub locked_by: Option<String>,
    /// Lease deadline in unix millis
    pub locked_until: Option<u64>,
}

/// Payload of a [`START_SAGA`] message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSagaPayload {
    /// Saga to drive
    #[serde(rename = "SagaId")]
    pub saga_id: Uuid,
}

impl OutboxMessage {
    /// New [`START_SAGA`] message for a saga id.
    ///
    /// # Panics
    ///
    /// Never panics; the payload struct always serializes.
    pub fn start_saga(saga_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: START_SAGA.to_string(),
            payload: serde_json::to_string(&StartSagaPayload { saga_id })
                .expect("payload is a plain struct"),
            created_time: unix_time_millis(),
            processed_time: None,
            attempt_count: 0,
            last_error: None,
            locked_by: None,
            locked_until: None,
        }
    }
}
