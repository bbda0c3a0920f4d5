//! Transactional outbox worker.
//!
//! A pool of these runs as long-lived background tasks; any number of
//! instances is safe because all cross-worker coordination happens through
//! atomic store operations. Each iteration scouts the oldest eligible
//! message, claims it with a conditional update under lease, rehydrates and
//! drives the saga, and finalizes or releases the message according to the
//! failure disposition.

use std::cmp::min;
use std::sync::Arc;
use std::time::Duration;

use sagakit_common::database::{DynSagaDatabase, OutboxDatabase};
use sagakit_common::outbox::{OutboxMessage, StartSagaPayload, START_SAGA};
use sagakit_common::util::unix_time_millis;
use sagakit_common::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::registry::SagaRegistry;

/// Outbox worker tuning.
///
/// The lease TTL must cover the longest expected `process` duration; a
/// too-short lease produces benign `LostLease` retries but duplicate work,
/// a too-long one delays recovery from genuinely dead workers.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep when the queue is empty
    pub empty_queue_delay: Duration,
    /// Message lease duration
    pub lease_ttl: Duration,
    /// Re-queue delay after a transient conflict (attempt not counted)
    pub transient_conflict_delay: Duration,
    /// Re-queue delay after a lost lease (attempt counted)
    pub lost_lease_delay: Duration,
    /// Linear backoff step for other failures
    pub failure_backoff_step: Duration,
    /// Backoff ceiling
    pub failure_backoff_max: Duration,
    /// Attempt count at which an operator-visible warning is emitted
    pub max_attempts_before_dlq: u32,
    /// Sleep after a loop-level error (e.g. store connection lost)
    pub error_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            empty_queue_delay: Duration::from_secs(1),
            lease_ttl: Duration::from_secs(30),
            transient_conflict_delay: Duration::from_secs(2),
            lost_lease_delay: Duration::from_secs(5),
            failure_backoff_step: Duration::from_secs(5),
            failure_backoff_max: Duration::from_secs(60),
            max_attempts_before_dlq: 10,
            error_delay: Duration::from_secs(5),
        }
    }
}

enum Iteration {
    /// Nothing eligible; sleep before the next scout
    Idle,
    /// Made progress (processed, released, or lost a claim race); scout
    /// again without sleeping
    Busy,
}

/// Long-lived outbox polling task.
#[derive(Debug)]
pub struct OutboxWorker {
    db: DynSagaDatabase,
    registry: Arc<SagaRegistry>,
    config: WorkerConfig,
    worker_id: String,
}

impl OutboxWorker {
    /// New worker with a unique id.
    pub fn new(db: DynSagaDatabase, registry: Arc<SagaRegistry>, config: WorkerConfig) -> Self {
        Self {
            db,
            registry,
            config,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }

    /// This worker's lease owner id.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Runs until `shutdown` is cancelled. New messages stop being picked
    /// up promptly; an in-flight saga receives the same token and is
    /// expected to abort cleanly at its next suspension point.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("Outbox worker {} started", self.worker_id);

        while !shutdown.is_cancelled() {
            match self.run_once(&shutdown).await {
                Ok(Iteration::Busy) => {}
                Ok(Iteration::Idle) => {
                    self.sleep(self.config.empty_queue_delay, &shutdown).await;
                }
                Err(err) => {
                    tracing::error!("Outbox worker {} iteration failed: {}", self.worker_id, err);
                    self.sleep(self.config.error_delay, &shutdown).await;
                }
            }
        }

        tracing::info!("Outbox worker {} stopped", self.worker_id);
    }

    async fn sleep(&self, delay: Duration, shutdown: &CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    async fn run_once(&self, cancel: &CancellationToken) -> Result<Iteration, Error> {
        // Scout: read-only peek at the oldest eligible message.
        let now = unix_time_millis();
        let Some(candidate) = self.db.next_outbox_candidate(now).await? else {
            return Ok(Iteration::Idle);
        };

        // Claim: conditional update; exactly one racing worker wins.
        let lease_until = now + self.config.lease_ttl.as_millis() as u64;
        if !self
            .db
            .claim_outbox_message(&candidate.id, &self.worker_id, lease_until, now)
            .await?
        {
            tracing::debug!(
                "Message {} was claimed by another worker, moving on",
                candidate.id
            );
            return Ok(Iteration::Busy);
        }

        // Load the claimed row fresh; the scouted copy may be stale.
        let Some(message) = self.db.get_outbox_message(&candidate.id).await? else {
            return Err(Error::Internal(format!(
                "claimed outbox message {} disappeared",
                candidate.id
            )));
        };

        match self.dispatch(&message, cancel).await {
            Ok(()) => {
                self.db
                    .mark_outbox_processed(&message.id, unix_time_millis())
                    .await?;
            }
            Err(err) => {
                self.release_after_failure(&message, err).await?;
            }
        }

        Ok(Iteration::Busy)
    }

    #[instrument(skip_all, fields(message_id = %message.id, message_type = %message.message_type))]
    async fn dispatch(&self, message: &OutboxMessage, cancel: &CancellationToken) -> Result<(), Error> {
        match message.message_type.as_str() {
            START_SAGA => {
                let payload: StartSagaPayload = match serde_json::from_str(&message.payload) {
                    Ok(payload) => payload,
                    Err(err) => {
                        // A poison payload would loop forever; finalize it.
                        tracing::error!(
                            "Outbox message {} has an undecodable payload ({}), marking processed",
                            message.id,
                            err
                        );
                        return Ok(());
                    }
                };

                match self.registry.drive(payload.saga_id, cancel).await {
                    Ok(()) => Ok(()),
                    Err(Error::SagaNotFound(saga_id)) => {
                        tracing::warn!(
                            "Outbox message {} refers to missing saga {}, marking processed",
                            message.id,
                            saga_id
                        );
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            other => {
                tracing::warn!(
                    "Unknown outbox message type {:?} on {}, marking processed",
                    other,
                    message.id
                );
                Ok(())
            }
        }
    }

    /// The three-way failure dispatch table. Dispositions are distinguished
    /// by error variant, never by string matching.
    async fn release_after_failure(&self, message: &OutboxMessage, err: Error) -> Result<(), Error> {
        let now = unix_time_millis();

        match err {
            Error::RetryLater(reason) => {
                tracing::debug!(
                    "Message {} hit a transient conflict ({}), retrying shortly",
                    message.id,
                    reason
                );
                self.db
                    .release_outbox_message(
                        &message.id,
                        now + self.config.transient_conflict_delay.as_millis() as u64,
                        false,
                        Some(&reason),
                    )
                    .await?;
            }
            Error::Cancelled => {
                // Shutdown mid-flight; hand the message back promptly for
                // another worker, without counting an attempt.
                self.db
                    .release_outbox_message(
                        &message.id,
                        now + self.config.transient_conflict_delay.as_millis() as u64,
                        false,
                        Some("processing cancelled by shutdown"),
                    )
                    .await?;
            }
            Error::LostLease(reason) => {
                tracing::warn!("Message {} lost its lease ({})", message.id, reason);
                self.db
                    .release_outbox_message(
                        &message.id,
                        now + self.config.lost_lease_delay.as_millis() as u64,
                        true,
                        Some(&reason),
                    )
                    .await?;
            }
            err => {
                let attempts = message.attempt_count + 1;
                let backoff = min(
                    self.config.failure_backoff_max,
                    self.config.failure_backoff_step * attempts,
                );
                tracing::error!(
                    "Message {} failed attempt {} ({}), backing off {:?}",
                    message.id,
                    attempts,
                    err,
                    backoff
                );
                self.db
                    .release_outbox_message(
                        &message.id,
                        now + backoff.as_millis() as u64,
                        true,
                        Some(&err.to_string()),
                    )
                    .await?;

                if attempts >= self.config.max_attempts_before_dlq {
                    tracing::warn!(
                        "Message {} exceeded {} attempts and needs operator attention",
                        message.id,
                        self.config.max_attempts_before_dlq
                    );
                }
            }
        }

        Ok(())
    }
}
