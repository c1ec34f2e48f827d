//! Bulk Transfer Scheduler
//!
//! Spreads a batch from one source account over time: item `i` is submitted
//! `i × interval` after the batch was scheduled, in input order. Each
//! submission re-enters validation through a [`TransferSubmitter`], so an
//! item that became invalid while waiting fails like any other request.
//!
//! # Durability
//!
//! Items live in a [`ScheduleStore`]. A scheduler built over a reopened
//! store re-arms every pending item with its remaining delay; overdue items
//! fire immediately, in order.
//!
//! Firing is journaled before submission, so a crash mid-submit loses that
//! item rather than submitting it twice.

pub mod store;

pub use store::{ItemOutcome, ItemState, ScheduleId, ScheduleStore, ScheduledItem};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core_types::AccountId;
use crate::transfer::error::TransferError;
use crate::transfer::types::{PublishReceipt, TransferLine, TransferRequest};

/// Submit one transfer request on behalf of an actor
#[async_trait]
pub trait TransferSubmitter: Send + Sync {
    async fn submit(
        &self,
        actor: AccountId,
        request: TransferRequest,
    ) -> Result<Vec<PublishReceipt>, TransferError>;
}

/// Scheduled batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHandle {
    pub batch_id: ScheduleId,
    /// Item ids in input order
    pub items: Vec<ScheduleId>,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct BulkTransferScheduler {
    submitter: Arc<dyn TransferSubmitter>,
    store: Arc<ScheduleStore>,
    interval: Duration,
    /// Armed deadlines of pending items: (fire at, seq)
    deadlines: Mutex<HashMap<ScheduleId, (Instant, u64)>>,
    wake: Notify,
    running: Mutex<Option<Running>>,
}

impl BulkTransferScheduler {
    /// Build a scheduler and re-arm every pending item in `store`
    pub fn new(
        submitter: Arc<dyn TransferSubmitter>,
        store: Arc<ScheduleStore>,
        interval: Duration,
    ) -> Self {
        let scheduler = Self {
            submitter,
            store,
            interval,
            deadlines: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            running: Mutex::new(None),
        };
        scheduler.recover();
        scheduler
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn store(&self) -> &Arc<ScheduleStore> {
        &self.store
    }

    fn deadlines(&self) -> Result<MutexGuard<'_, HashMap<ScheduleId, (Instant, u64)>>, TransferError> {
        self.deadlines
            .lock()
            .map_err(|_| TransferError::SystemError("scheduler deadlines poisoned".to_string()))
    }

    fn recover(&self) -> usize {
        let pending = self.store.pending();
        if pending.is_empty() {
            return 0;
        }

        let now = Instant::now();
        let wall_now = Utc::now();
        let Ok(mut deadlines) = self.deadlines() else {
            return 0;
        };
        for item in &pending {
            let remaining = (item.due_at - wall_now).to_std().unwrap_or(Duration::ZERO);
            deadlines.insert(item.id, (now + remaining, item.seq));
        }
        info!(recovered = pending.len(), "Pending scheduled transfers re-armed");
        pending.len()
    }

    /// Schedule a batch. Item `i` fires `i × interval` from now.
    pub fn schedule(
        &self,
        actor: AccountId,
        source_account_number: &str,
        lines: Vec<TransferLine>,
    ) -> Result<BatchHandle, TransferError> {
        if lines.is_empty() {
            return Err(TransferError::EmptyBatch);
        }

        let batch_id = ScheduleId::new();
        let base = Instant::now();
        let wall_base = Utc::now();
        let mut ids = Vec::with_capacity(lines.len());

        for (index, line) in lines.into_iter().enumerate() {
            let offset = self.interval.saturating_mul(index as u32);
            let armed = chrono::Duration::from_std(offset)
                .map_err(|e| TransferError::SystemError(e.to_string()))
                .and_then(|offset_wall| {
                    self.store.insert(ScheduledItem {
                        id: ScheduleId::new(),
                        batch_id,
                        index,
                        seq: 0,
                        actor,
                        source_account_number: source_account_number.to_string(),
                        line,
                        due_at: wall_base + offset_wall,
                        state: ItemState::Pending,
                        outcome: None,
                    })
                })
                .and_then(|item| {
                    ids.push(item.id);
                    self.deadlines()?.insert(item.id, (base + offset, item.seq));
                    Ok(())
                });
            if let Err(e) = armed {
                self.roll_back(&batch_id, &ids);
                return Err(e);
            }
        }

        info!(
            batch_id = %batch_id,
            actor,
            source = source_account_number,
            items = ids.len(),
            interval_secs = self.interval.as_secs_f64(),
            "Bulk transfer scheduled"
        );
        self.wake.notify_one();
        Ok(BatchHandle {
            batch_id,
            items: ids,
        })
    }

    /// Cancel the already-stored items of a batch that failed part way
    fn roll_back(&self, batch_id: &ScheduleId, ids: &[ScheduleId]) {
        if let Ok(mut deadlines) = self.deadlines() {
            for id in ids {
                deadlines.remove(id);
            }
        }
        for id in ids {
            if let Err(e) = self.store.cancel(id) {
                // Disarmed in memory; a restart would re-arm it from the journal
                error!(
                    alert = "reconciliation_required",
                    batch_id = %batch_id,
                    schedule_id = %id,
                    error = %e,
                    "Partial batch item could not be cancelled"
                );
            }
        }
        warn!(batch_id = %batch_id, rolled_back = ids.len(), "Bulk schedule aborted");
    }

    /// Cancel one item before it fires. `false` if it already fired.
    pub fn cancel(&self, id: &ScheduleId) -> Result<bool, TransferError> {
        let cancelled = self.store.cancel(id)?;
        if cancelled {
            self.deadlines()?.remove(id);
            info!(schedule_id = %id, "Scheduled transfer cancelled");
            self.wake.notify_one();
        }
        Ok(cancelled)
    }

    /// Cancel every still-pending item of a batch; returns how many
    pub fn cancel_batch(&self, batch_id: &ScheduleId) -> Result<usize, TransferError> {
        let mut cancelled = 0;
        for item in self.store.batch(batch_id) {
            if item.state == ItemState::Pending && self.cancel(&item.id)? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    pub fn item(&self, id: &ScheduleId) -> Option<ScheduledItem> {
        self.store.get(id)
    }

    pub fn pending(&self) -> usize {
        self.deadlines().map(|d| d.len()).unwrap_or(0)
    }

    /// Spawn the dispatcher task
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Result<(), TransferError> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| TransferError::SystemError("scheduler state poisoned".to_string()))?;
        if running.is_some() {
            warn!("Scheduler already running");
            return Ok(());
        }

        let scheduler = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { scheduler.dispatch(token).await });
        *running = Some(Running { cancel, handle });
        info!(pending = self.pending(), "Bulk transfer scheduler started");
        Ok(())
    }

    /// Stop the dispatcher. Unfired items stay pending in the store.
    pub async fn stop(&self) {
        let running = match self.running.lock() {
            Ok(mut running) => running.take(),
            Err(_) => None,
        };
        let Some(running) = running else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.handle.await {
            error!(error = %e, "Scheduler dispatcher panicked");
        }
        info!(pending = self.pending(), "Bulk transfer scheduler stopped");
    }

    async fn dispatch(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let (due, next) = self.take_due(Instant::now());
            if !due.is_empty() {
                for id in due {
                    self.fire(id).await;
                }
                continue;
            }

            match next {
                Some(at) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = self.wake.notified() => {}
                    }
                }
            }
        }
        debug!("Scheduler dispatcher exited");
    }

    /// Remove and return due items in firing order, plus the next deadline
    fn take_due(&self, now: Instant) -> (Vec<ScheduleId>, Option<Instant>) {
        let Ok(mut deadlines) = self.deadlines() else {
            return (Vec::new(), None);
        };
        let mut due: Vec<(ScheduleId, Instant, u64)> = deadlines
            .iter()
            .filter(|(_, (at, _))| *at <= now)
            .map(|(id, (at, seq))| (*id, *at, *seq))
            .collect();
        for (id, _, _) in &due {
            deadlines.remove(id);
        }
        due.sort_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)));

        let next = deadlines.values().map(|(at, _)| *at).min();
        (due.into_iter().map(|(id, _, _)| id).collect(), next)
    }

    async fn fire(&self, id: ScheduleId) {
        match self.store.mark_fired(&id) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                // Not journaled, so not submitted; try again one interval later
                error!(schedule_id = %id, error = %e, "Failed to record firing");
                if let Ok(mut deadlines) = self.deadlines()
                    && let Some(item) = self.store.get(&id)
                {
                    deadlines.insert(id, (Instant::now() + self.interval, item.seq));
                }
                return;
            }
        }

        let Some(item) = self.store.get(&id) else {
            return;
        };
        let request = TransferRequest::single(item.source_account_number.clone(), item.line.clone());

        let outcome = match self.submitter.submit(item.actor, request).await {
            Ok(receipts) => {
                info!(
                    schedule_id = %id,
                    batch_id = %item.batch_id,
                    index = item.index,
                    destination = %item.line.destination_account_number,
                    amount = %item.line.amount,
                    "Scheduled transfer submitted"
                );
                ItemOutcome::Submitted {
                    correlation_ids: receipts.iter().map(|r| r.correlation_id).collect(),
                }
            }
            Err(e) => {
                warn!(
                    schedule_id = %id,
                    batch_id = %item.batch_id,
                    index = item.index,
                    code = e.code(),
                    error = %e,
                    "Scheduled transfer rejected"
                );
                ItemOutcome::Rejected {
                    code: e.code().to_string(),
                    message: e.to_string(),
                }
            }
        };

        if let Err(e) = self.store.record_outcome(&id, outcome) {
            error!(schedule_id = %id, error = %e, "Failed to store submission outcome");
        }
    }
}
