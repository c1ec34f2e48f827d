//! Transaction record store
//!
//! Status changes go through `update_status_if`, a compare-and-swap on the
//! current status. Two consumers racing on the same correlation id cannot
//! both win the QUEUED → PENDING claim.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

use super::error::TransferError;
use super::state::TransactionStatus;
use super::types::{CorrelationId, Page, PageRequest, TransactionRecord};
use crate::core_types::AccountId;

#[async_trait]
pub trait TransactionRecordStore: Send + Sync {
    /// Persist a new record. Returns it with the store-assigned id.
    async fn insert(&self, record: TransactionRecord) -> Result<TransactionRecord, TransferError>;

    async fn get(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<TransactionRecord>, TransferError>;

    /// Atomic CAS on status.
    ///
    /// `Ok(false)` if the record is not in `expected`. Illegal transitions
    /// are rejected before the record is looked at.
    async fn update_status_if(
        &self,
        correlation_id: &CorrelationId,
        expected: TransactionStatus,
        new_status: TransactionStatus,
        remark: &str,
    ) -> Result<bool, TransferError>;

    /// Count one more delivery; returns the new count
    async fn increment_attempts(&self, correlation_id: &CorrelationId)
    -> Result<u32, TransferError>;

    /// Records where the account is sender or receiver, newest first
    async fn list_for_account(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Page<TransactionRecord>, TransferError>;

    /// Every record, newest first
    async fn list_all(&self, page: PageRequest) -> Result<Page<TransactionRecord>, TransferError>;
}

/// In-memory record store
pub struct InMemoryRecordStore {
    records: DashMap<CorrelationId, TransactionRecord>,
    next_id: AtomicU64,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Snapshot of every record (reconciliation and tests)
    pub fn all(&self) -> Vec<TransactionRecord> {
        self.records.iter().map(|e| e.value().clone()).collect()
    }

    fn page_where(
        &self,
        page: PageRequest,
        keep: impl Fn(&TransactionRecord) -> bool,
    ) -> Page<TransactionRecord> {
        let mut matching: Vec<TransactionRecord> = self
            .records
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| e.value().clone())
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(page.offset())
            .take(page.page_size)
            .collect();

        Page {
            items,
            total,
            page_number: page.page_number,
            page_size: page.page_size,
        }
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionRecordStore for InMemoryRecordStore {
    async fn insert(
        &self,
        mut record: TransactionRecord,
    ) -> Result<TransactionRecord, TransferError> {
        match self.records.entry(record.correlation_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(TransferError::DuplicateRequest(
                record.correlation_id.to_string(),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                record.id = self.next_id.fetch_add(1, Ordering::SeqCst);
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn get(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<TransactionRecord>, TransferError> {
        Ok(self.records.get(correlation_id).map(|e| e.value().clone()))
    }

    async fn update_status_if(
        &self,
        correlation_id: &CorrelationId,
        expected: TransactionStatus,
        new_status: TransactionStatus,
        remark: &str,
    ) -> Result<bool, TransferError> {
        if !expected.can_transition_to(new_status) {
            return Err(TransferError::InvalidStateTransition(format!(
                "{} -> {}",
                expected, new_status
            )));
        }

        // The shard write lock makes compare and set one step
        let mut record = self
            .records
            .get_mut(correlation_id)
            .ok_or_else(|| TransferError::RecordNotFound(correlation_id.to_string()))?;

        if record.status != expected {
            debug!(
                correlation_id = %correlation_id,
                expected = %expected,
                actual = %record.status,
                "CAS miss"
            );
            return Ok(false);
        }

        record.status = new_status;
        record.remark = remark.to_string();
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn increment_attempts(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<u32, TransferError> {
        let mut record = self
            .records
            .get_mut(correlation_id)
            .ok_or_else(|| TransferError::RecordNotFound(correlation_id.to_string()))?;
        record.attempts += 1;
        Ok(record.attempts)
    }

    async fn list_for_account(
        &self,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Page<TransactionRecord>, TransferError> {
        Ok(self.page_where(page, |record| record.involves(account_id)))
    }

    async fn list_all(&self, page: PageRequest) -> Result<Page<TransactionRecord>, TransferError> {
        Ok(self.page_where(page, |_| true))
    }
}

/// Fault-injecting record store for tests
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn trip(remaining: &AtomicUsize) -> Result<(), TransferError> {
        let tripped = remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(TransferError::ServiceUnavailable("records down".to_string()))
        } else {
            Ok(())
        }
    }

    /// Delegates to an in-memory store. Inserts succeed `inserts_ok` times
    /// and then fail; status updates fail the first `update_failures` times.
    pub struct FlakyRecordStore {
        pub inner: Arc<InMemoryRecordStore>,
        inserts_ok: AtomicUsize,
        update_failures: AtomicUsize,
    }

    impl FlakyRecordStore {
        pub fn new(inner: Arc<InMemoryRecordStore>) -> Self {
            Self {
                inner,
                inserts_ok: AtomicUsize::new(usize::MAX),
                update_failures: AtomicUsize::new(0),
            }
        }

        pub fn fail_inserts_after(self, inserts_ok: usize) -> Self {
            self.inserts_ok.store(inserts_ok, Ordering::SeqCst);
            self
        }

        pub fn fail_updates(self, failures: usize) -> Self {
            self.update_failures.store(failures, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl TransactionRecordStore for FlakyRecordStore {
        async fn insert(
            &self,
            record: TransactionRecord,
        ) -> Result<TransactionRecord, TransferError> {
            let allowed = self
                .inserts_ok
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !allowed {
                return Err(TransferError::ServiceUnavailable("records down".to_string()));
            }
            self.inner.insert(record).await
        }

        async fn get(
            &self,
            correlation_id: &CorrelationId,
        ) -> Result<Option<TransactionRecord>, TransferError> {
            self.inner.get(correlation_id).await
        }

        async fn update_status_if(
            &self,
            correlation_id: &CorrelationId,
            expected: TransactionStatus,
            new_status: TransactionStatus,
            remark: &str,
        ) -> Result<bool, TransferError> {
            trip(&self.update_failures)?;
            self.inner
                .update_status_if(correlation_id, expected, new_status, remark)
                .await
        }

        async fn increment_attempts(
            &self,
            correlation_id: &CorrelationId,
        ) -> Result<u32, TransferError> {
            self.inner.increment_attempts(correlation_id).await
        }

        async fn list_for_account(
            &self,
            account_id: AccountId,
            page: PageRequest,
        ) -> Result<Page<TransactionRecord>, TransferError> {
            self.inner.list_for_account(account_id, page).await
        }

        async fn list_all(
            &self,
            page: PageRequest,
        ) -> Result<Page<TransactionRecord>, TransferError> {
            self.inner.list_all(page).await
        }
    }
}
