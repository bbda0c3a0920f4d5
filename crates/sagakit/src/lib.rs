//! Durable saga orchestration engine.
//!
//! The engine is formed by four tightly coupled pieces:
//!
//! 1. the saga state machine ([`instance`]) and [`coordinator`] — forward
//!    execution plus reverse-order compensation,
//! 2. the transactional [`outbox`] worker — durable intent queue with
//!    lease-based claims and backoff,
//! 3. the [`idempotency`] store — lease-or-takeover semantics with
//!    owner-verified completion, and
//! 4. the [`ledger`] service — idempotent debit/credit with refund and
//!    tombstone semantics.
//!
//! Delivery is at-least-once; effect is at-most-once through the composite
//! idempotency contract (step lock + domain idempotency key + unique
//! constraint on the ledger reference).

pub mod coordinator;
pub mod idempotency;
pub mod instance;
pub mod ledger;
pub mod outbox;
pub mod registry;
pub mod repository;
pub mod step;
pub mod transfer;

pub use sagakit_common::{Amount, Error};

pub use self::coordinator::Coordinator;
pub use self::idempotency::IdempotencyStore;
pub use self::instance::SagaInstance;
pub use self::ledger::LedgerService;
pub use self::outbox::{OutboxWorker, WorkerConfig};
pub use self::registry::{SagaDriver, SagaRegistry, TypedSagaDriver};
pub use self::repository::SagaRepository;
pub use self::step::SagaStep;

#[cfg(test)]
mod tests;
