//! Intent Consumer
//!
//! Long-lived workers draining the intent queue, one per partition.
//!
//! # Per-delivery flow
//!
//! ```text
//! record lookup ──▶ terminal? ──yes──▶ ack (duplicate)
//!       │
//!       ▼
//! claim QUEUED → PENDING (CAS)
//!       │
//!       ▼
//! resolve accounts ──not found──▶ FAILED "Invalid account", ack
//!       │
//!       ▼
//! ledger.transfer(cid, ..) ──▶ SUCCESS | FAILED <remark>, ack
//!       │
//!   transient error
//!       ▼
//! nack with backoff ... attempts exhausted ──▶ FAILED (reconciliation), ack
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Lookup-before-mutate**: the record is read by correlation id before
//!    the ledger is touched; terminal records are acked without mutation.
//! 2. **Idempotent apply**: the ledger call carries the correlation id, so a
//!    redelivery that slips past the record check still mutates at most once.
//! 3. **Run to completion**: once a delivery has been received it is
//!    processed to an ack or nack even if `stop` is called meanwhile. A
//!    record-store, directory or queue failure on the way is a retry, never
//!    a silently dropped delivery.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{ErrorCategory, TransferError};
use super::queue::{Delivery, IntentQueue};
use super::records::TransactionRecordStore;
use super::state::TransactionStatus;
use super::types::{
    CorrelationId, DAILY_LIMIT_REMARK, INFRA_FAILURE_REMARK, INSUFFICIENT_BALANCE_REMARK,
    INVALID_ACCOUNT_REMARK, SUCCESS_REMARK,
};
use crate::account::AccountDirectory;
use crate::core_types::AccountId;
use crate::ledger::{ApplyOutcome, LedgerService};

const PROCESSING_REMARK: &str = "Processing";

/// Retry and timeout bounds for the consumer
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Deliveries before a transient failure is given up on
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Bound on each directory, ledger and record-store call
    pub call_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            call_timeout: Duration::from_secs(2),
        }
    }
}

impl ConsumerConfig {
    /// Delay before redelivering after failed attempt number `attempt`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Default)]
pub struct ConsumerStats {
    applied: AtomicU64,
    rejected: AtomicU64,
    duplicates: AtomicU64,
    retried: AtomicU64,
    exhausted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStatsSnapshot {
    pub applied: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub retried: u64,
    pub exhausted: u64,
}

impl ConsumerStatsSnapshot {
    /// Deliveries that reached a terminal record
    pub fn settled(&self) -> u64 {
        self.applied + self.rejected + self.exhausted
    }
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }
}

/// Result of handling one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Ledger mutated, record SUCCESS
    Applied,
    /// Permanent failure, record FAILED with this remark
    Rejected(String),
    /// Record already terminal (or finished by a concurrent delivery)
    Duplicate,
    /// No record for the correlation id; acked and dropped
    Orphaned,
    /// Transient failure; redelivery scheduled
    Retrying { attempt: u32, delay: Duration },
    /// Retries exhausted; record FAILED pending reconciliation
    Exhausted,
}

impl ConsumeOutcome {
    /// Failure category behind this outcome; `None` when applied
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            ConsumeOutcome::Applied => None,
            ConsumeOutcome::Rejected(_) | ConsumeOutcome::Orphaned => {
                Some(ErrorCategory::PermanentApply)
            }
            ConsumeOutcome::Duplicate => Some(ErrorCategory::DuplicateDelivery),
            ConsumeOutcome::Retrying { .. } | ConsumeOutcome::Exhausted => {
                Some(ErrorCategory::TransientInfra)
            }
        }
    }
}

struct Running {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct IntentConsumer {
    directory: Arc<dyn AccountDirectory>,
    ledger: Arc<dyn LedgerService>,
    records: Arc<dyn TransactionRecordStore>,
    queue: Arc<dyn IntentQueue>,
    config: ConsumerConfig,
    stats: ConsumerStats,
    running: Mutex<Option<Running>>,
}

impl IntentConsumer {
    pub fn new(
        directory: Arc<dyn AccountDirectory>,
        ledger: Arc<dyn LedgerService>,
        records: Arc<dyn TransactionRecordStore>,
        queue: Arc<dyn IntentQueue>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            directory,
            ledger,
            records,
            queue,
            config,
            stats: ConsumerStats::default(),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|running| running.is_some())
            .unwrap_or(false)
    }

    /// Subscribe: spawn one worker per queue partition.
    ///
    /// Workers stop when `cancel` fires or `stop` is called.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), TransferError> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| TransferError::SystemError("consumer state poisoned".to_string()))?;
        if running.is_some() {
            warn!("Consumer already running");
            return Ok(());
        }

        let partitions = self.queue.partitions();
        let handles = (0..partitions)
            .map(|partition| {
                let consumer = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move { consumer.run_worker(partition, cancel).await })
            })
            .collect();

        info!(
            partitions,
            max_attempts = self.config.max_attempts,
            base_backoff_ms = self.config.base_backoff.as_millis() as u64,
            "Intent consumer started"
        );
        *running = Some(Running { cancel, handles });
        Ok(())
    }

    /// Close the subscription and wait for in-flight deliveries to finish
    pub async fn stop(&self) {
        let running = match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(_) => None,
        };
        let Some(running) = running else {
            return;
        };

        running.cancel.cancel();
        for handle in running.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Consumer worker panicked");
            }
        }
        info!(stats = ?self.stats(), "Intent consumer stopped");
    }

    async fn run_worker(&self, partition: usize, cancel: CancellationToken) {
        debug!(partition, "Consumer worker started");
        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                received = self.queue.recv(partition) => received,
            };

            match received {
                Ok(delivery) => {
                    let correlation_id = delivery.intent.correlation_id;
                    let attempt = delivery.attempt;
                    match self.handle(delivery.clone()).await {
                        Ok(outcome) => {
                            debug!(
                                partition,
                                correlation_id = %correlation_id,
                                outcome = ?outcome,
                                category = ?outcome.category(),
                                "Delivery settled"
                            );
                        }
                        Err(e) => {
                            // Neither acked nor nacked; hand it back so it is not stranded
                            error!(
                                partition,
                                correlation_id = %correlation_id,
                                error = %e,
                                "Delivery handling failed"
                            );
                            let delay = self.config.backoff(attempt);
                            if let Err(e) = self.queue.nack(delivery, delay).await {
                                error!(
                                    alert = "reconciliation_required",
                                    partition,
                                    correlation_id = %correlation_id,
                                    error = %e,
                                    "Delivery could not be returned to the queue"
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(partition, error = %e, "Queue receive failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.base_backoff) => {}
                    }
                }
            }
        }
        debug!(partition, "Consumer worker stopped");
    }

    /// Process one delivery to an ack or a nack.
    ///
    /// Any failure before the delivery is settled is retried with backoff,
    /// and after `max_attempts` the record is closed FAILED with an alert.
    /// `Err` only when the queue itself refuses the nack or ack.
    pub async fn handle(&self, delivery: Delivery) -> Result<ConsumeOutcome, TransferError> {
        match self.process(&delivery).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.retry_or_exhaust(delivery, e).await,
        }
    }

    async fn process(&self, delivery: &Delivery) -> Result<ConsumeOutcome, TransferError> {
        let correlation_id = delivery.intent.correlation_id;

        let Some(record) = self.bounded(self.records.get(&correlation_id)).await? else {
            warn!(correlation_id = %correlation_id, "Intent without transaction record dropped");
            self.queue.ack(delivery).await?;
            return Ok(ConsumeOutcome::Orphaned);
        };
        if record.status.is_terminal() {
            return self.absorb_duplicate(delivery, record.status).await;
        }

        if record.status == TransactionStatus::Queued {
            let claimed = self
                .bounded(self.records.update_status_if(
                    &correlation_id,
                    TransactionStatus::Queued,
                    TransactionStatus::Pending,
                    PROCESSING_REMARK,
                ))
                .await?;
            if !claimed {
                // Lost the claim; only a terminal state ends this delivery
                if let Some(current) = self.bounded(self.records.get(&correlation_id)).await?
                    && current.status.is_terminal()
                {
                    return self.absorb_duplicate(delivery, current.status).await;
                }
            }
        }
        // Best effort; the attempt counter is informational
        if let Err(e) = self
            .bounded(self.records.increment_attempts(&correlation_id))
            .await
        {
            debug!(correlation_id = %correlation_id, error = %e, "Attempt counter not updated");
        }

        let Some(source) = self.resolve(&delivery.intent.source_account_number).await? else {
            return self.reject(delivery, INVALID_ACCOUNT_REMARK).await;
        };
        let Some(destination) = self
            .resolve(&delivery.intent.destination_account_number)
            .await?
        else {
            return self.reject(delivery, INVALID_ACCOUNT_REMARK).await;
        };

        let applied = self
            .bounded(self.ledger.transfer(
                correlation_id,
                source,
                destination,
                delivery.intent.amount,
            ))
            .await;

        match applied {
            Ok(ApplyOutcome::Applied {
                source_balance,
                destination_balance,
            }) => {
                let won = self
                    .finish(&correlation_id, TransactionStatus::Success, SUCCESS_REMARK)
                    .await?;
                self.queue.ack(delivery).await?;
                if !won {
                    self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                    return Ok(ConsumeOutcome::Duplicate);
                }
                self.stats.applied.fetch_add(1, Ordering::Relaxed);
                info!(
                    correlation_id = %correlation_id,
                    source,
                    destination,
                    amount = %delivery.intent.amount,
                    source_balance = %source_balance,
                    destination_balance = %destination_balance,
                    attempt = delivery.attempt,
                    "Transfer applied"
                );
                Ok(ConsumeOutcome::Applied)
            }
            Ok(ApplyOutcome::InsufficientFunds { available }) => {
                debug!(correlation_id = %correlation_id, available = %available, "Insufficient balance at apply");
                self.reject(delivery, INSUFFICIENT_BALANCE_REMARK).await
            }
            Ok(ApplyOutcome::DailyLimitReached { applied, limit }) => {
                debug!(correlation_id = %correlation_id, applied, limit, "Daily limit reached at apply");
                self.reject(delivery, DAILY_LIMIT_REMARK).await
            }
            Ok(ApplyOutcome::AccountNotFound(id)) => {
                debug!(correlation_id = %correlation_id, account_id = id, "Ledger account missing");
                self.reject(delivery, INVALID_ACCOUNT_REMARK).await
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => self.reject(delivery, &e.to_string()).await,
        }
    }

    async fn resolve(&self, account_number: &str) -> Result<Option<AccountId>, TransferError> {
        self.bounded(self.directory.resolve(account_number)).await
    }

    async fn absorb_duplicate(
        &self,
        delivery: &Delivery,
        status: TransactionStatus,
    ) -> Result<ConsumeOutcome, TransferError> {
        debug!(
            correlation_id = %delivery.intent.correlation_id,
            status = %status,
            attempt = delivery.attempt,
            "Duplicate delivery absorbed"
        );
        self.queue.ack(delivery).await?;
        self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
        Ok(ConsumeOutcome::Duplicate)
    }

    /// Close the record from PENDING. `false` if another delivery got there first.
    async fn finish(
        &self,
        correlation_id: &CorrelationId,
        status: TransactionStatus,
        remark: &str,
    ) -> Result<bool, TransferError> {
        self.bounded(self.records.update_status_if(
            correlation_id,
            TransactionStatus::Pending,
            status,
            remark,
        ))
        .await
    }

    async fn reject(
        &self,
        delivery: &Delivery,
        remark: &str,
    ) -> Result<ConsumeOutcome, TransferError> {
        let correlation_id = delivery.intent.correlation_id;
        let won = self
            .finish(&correlation_id, TransactionStatus::Failed, remark)
            .await?;
        self.queue.ack(delivery).await?;
        if !won {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(ConsumeOutcome::Duplicate);
        }
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        info!(correlation_id = %correlation_id, remark, "Transfer failed");
        Ok(ConsumeOutcome::Rejected(remark.to_string()))
    }

    async fn retry_or_exhaust(
        &self,
        delivery: Delivery,
        cause: TransferError,
    ) -> Result<ConsumeOutcome, TransferError> {
        let correlation_id = delivery.intent.correlation_id;
        let attempt = delivery.attempt;

        if attempt < self.config.max_attempts {
            let delay = self.config.backoff(attempt);
            warn!(
                correlation_id = %correlation_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %cause,
                "Transient failure, redelivery scheduled"
            );
            self.queue.nack(delivery, delay).await?;
            self.stats.retried.fetch_add(1, Ordering::Relaxed);
            return Ok(ConsumeOutcome::Retrying { attempt, delay });
        }

        let closed = match self
            .finish(
                &correlation_id,
                TransactionStatus::Failed,
                INFRA_FAILURE_REMARK,
            )
            .await
        {
            Ok(true) => true,
            _ => self
                .bounded(self.records.update_status_if(
                    &correlation_id,
                    TransactionStatus::Queued,
                    TransactionStatus::Failed,
                    INFRA_FAILURE_REMARK,
                ))
                .await
                .unwrap_or(false),
        };
        error!(
            alert = "reconciliation_required",
            correlation_id = %correlation_id,
            source = %delivery.intent.source_account_number,
            destination = %delivery.intent.destination_account_number,
            amount = %delivery.intent.amount,
            attempts = attempt,
            record_closed = closed,
            error = %cause,
            "Retries exhausted"
        );
        self.queue.ack(&delivery).await?;
        self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
        Ok(ConsumeOutcome::Exhausted)
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, TransferError>>,
    ) -> Result<T, TransferError> {
        tokio::time::timeout(self.config.call_timeout, call).await?
    }
}
