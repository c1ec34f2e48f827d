//! Transfer Service
//!
//! Caller-facing entry point: validate then publish, plus the read side
//! (statement and status queries) over the record store.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::error::TransferError;
use super::publisher::IntentPublisher;
use super::records::TransactionRecordStore;
use super::types::{
    CorrelationId, Page, PageRequest, PublishReceipt, TransactionRecord, TransferRequest,
};
use super::validator::TransferValidator;
use crate::core_types::AccountId;
use crate::scheduler::TransferSubmitter;

pub struct TransferService {
    validator: TransferValidator,
    publisher: IntentPublisher,
    records: Arc<dyn TransactionRecordStore>,
}

impl TransferService {
    pub fn new(
        validator: TransferValidator,
        publisher: IntentPublisher,
        records: Arc<dyn TransactionRecordStore>,
    ) -> Self {
        Self {
            validator,
            publisher,
            records,
        }
    }

    /// Validate and queue a batch. Returns immediately after the intents
    /// are durably enqueued; see the records for the final outcome.
    pub async fn transfer(
        &self,
        actor: AccountId,
        request: &TransferRequest,
    ) -> Result<Vec<PublishReceipt>, TransferError> {
        let validated = self.validator.validate(actor, request).await?;
        let receipts = self.publisher.publish(&validated).await?;
        info!(
            actor,
            source = %request.source_account_number,
            lines = receipts.len(),
            total = %request.total_amount(),
            "Transfer batch accepted"
        );
        Ok(receipts)
    }

    /// Transactions sent or received by `account_id`, newest first.
    /// Only the account owner may read its statement.
    pub async fn statement(
        &self,
        actor: AccountId,
        account_id: AccountId,
        page: PageRequest,
    ) -> Result<Page<TransactionRecord>, TransferError> {
        if actor != account_id {
            return Err(TransferError::Unauthorized);
        }
        self.records.list_for_account(account_id, page).await
    }

    /// Every transaction in the system, newest first. Admin only.
    pub async fn all_transactions(
        &self,
        actor: AccountId,
        page: PageRequest,
    ) -> Result<Page<TransactionRecord>, TransferError> {
        self.validator.require_admin(actor).await?;
        self.records.list_all(page).await
    }

    /// Current state of one transfer; visible to either party
    pub async fn status(
        &self,
        actor: AccountId,
        correlation_id: &CorrelationId,
    ) -> Result<TransactionRecord, TransferError> {
        let record = self
            .records
            .get(correlation_id)
            .await?
            .ok_or_else(|| TransferError::RecordNotFound(correlation_id.to_string()))?;
        if !record.involves(actor) {
            return Err(TransferError::Unauthorized);
        }
        Ok(record)
    }
}

#[async_trait]
impl TransferSubmitter for TransferService {
    async fn submit(
        &self,
        actor: AccountId,
        request: TransferRequest,
    ) -> Result<Vec<PublishReceipt>, TransferError> {
        self.transfer(actor, &request).await
    }
}
