//! Intent Publisher
//!
//! Record first, then publish: every published intent has a QUEUED record
//! before a consumer can see it. All records of a request are written
//! before any intent is published, so a record-store failure leaves nothing
//! on the queue. If the broker rejects an intent its record is closed as
//! FAILED so nothing is left dangling in QUEUED.

use std::sync::Arc;

use tracing::{error, info};

use super::error::TransferError;
use super::queue::IntentQueue;
use super::records::TransactionRecordStore;
use super::state::TransactionStatus;
use super::types::{
    CorrelationId, NOT_QUEUED_REMARK, PUBLISH_FAILED_REMARK, PublishReceipt, QUEUED_REMARK,
    TransactionRecord, TransferIntent, ValidatedTransfer,
};

pub struct IntentPublisher {
    records: Arc<dyn TransactionRecordStore>,
    queue: Arc<dyn IntentQueue>,
}

impl IntentPublisher {
    pub fn new(records: Arc<dyn TransactionRecordStore>, queue: Arc<dyn IntentQueue>) -> Self {
        Self { records, queue }
    }

    /// Publish validated transfers, one receipt per transfer in input order.
    ///
    /// A `Queued` receipt means the intent is durably enqueued, not applied.
    /// A record-store failure fails the whole call with nothing published,
    /// so the request can be retried; a broker failure only fails that one
    /// receipt.
    pub async fn publish(
        &self,
        transfers: &[ValidatedTransfer],
    ) -> Result<Vec<PublishReceipt>, TransferError> {
        let intents: Vec<TransferIntent> =
            transfers.iter().map(TransferIntent::from_validated).collect();

        for (index, (intent, transfer)) in intents.iter().zip(transfers).enumerate() {
            if let Err(e) = self
                .records
                .insert(TransactionRecord::queued(intent, transfer))
                .await
            {
                error!(
                    correlation_id = %intent.correlation_id,
                    written = index,
                    error = %e,
                    "Record write failed, batch not published"
                );
                self.abandon(&intents[..index]).await;
                return Err(e);
            }
        }

        let mut receipts = Vec::with_capacity(intents.len());
        for intent in intents {
            let correlation_id = intent.correlation_id;
            let (status, remark) = match self.queue.publish(&intent).await {
                Ok(()) => {
                    info!(
                        correlation_id = %correlation_id,
                        source = %intent.source_account_number,
                        destination = %intent.destination_account_number,
                        amount = %intent.amount,
                        "Transfer queued"
                    );
                    (TransactionStatus::Queued, QUEUED_REMARK)
                }
                Err(e) => {
                    error!(correlation_id = %correlation_id, error = %e, "Intent publish failed");
                    self.close(&correlation_id, PUBLISH_FAILED_REMARK).await;
                    (TransactionStatus::Failed, PUBLISH_FAILED_REMARK)
                }
            };

            receipts.push(PublishReceipt {
                correlation_id,
                destination_account_number: intent.destination_account_number,
                amount: intent.amount,
                status,
                remark: remark.to_string(),
            });
        }

        Ok(receipts)
    }

    /// Close records written for a batch that will not be published
    async fn abandon(&self, intents: &[TransferIntent]) {
        for intent in intents {
            self.close(&intent.correlation_id, NOT_QUEUED_REMARK).await;
        }
    }

    /// QUEUED → FAILED for an intent that never reached the queue
    async fn close(&self, correlation_id: &CorrelationId, remark: &str) {
        let closed = self
            .records
            .update_status_if(
                correlation_id,
                TransactionStatus::Queued,
                TransactionStatus::Failed,
                remark,
            )
            .await;
        if !matches!(closed, Ok(true)) {
            // Never published, so no money moves; the record is stale
            error!(
                alert = "reconciliation_required",
                correlation_id = %correlation_id,
                remark,
                result = ?closed,
                "Unpublished record left QUEUED"
            );
        }
    }
}
