//! Intent queue
//!
//! At-least-once delivery of `TransferIntent`s from the publisher to the
//! consumers. Intents are partitioned by source account number so one
//! account's intents are consumed by one worker in publish order.
//!
//! `MemoryQueue::durable` backs the queue with a journal: a published intent
//! is fsynced before `publish` returns and is redelivered after a restart
//! until it has been acked. Nacks are journaled too, so a replayed intent
//! keeps its attempt count.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use super::error::TransferError;
use super::types::{CorrelationId, TransferIntent};
use crate::journal::{Journal, JournalEntryType, crc32_checksum};

/// One delivery of an intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub intent: TransferIntent,
    /// 1 on first delivery, +1 on each redelivery after nack
    pub attempt: u32,
    pub partition: usize,
}

#[async_trait]
pub trait IntentQueue: Send + Sync {
    fn partitions(&self) -> usize;

    /// Enqueue durably. On `Ok`, the intent will be delivered at least once.
    async fn publish(&self, intent: &TransferIntent) -> Result<(), TransferError>;

    /// Wait for the next delivery on `partition`
    async fn recv(&self, partition: usize) -> Result<Delivery, TransferError>;

    /// Processing finished; never redeliver
    async fn ack(&self, delivery: &Delivery) -> Result<(), TransferError>;

    /// Redeliver after `delay`
    async fn nack(&self, delivery: Delivery, delay: Duration) -> Result<(), TransferError>;
}

/// Partition for a source account number
pub fn partition_for(source_account_number: &str, partitions: usize) -> usize {
    crc32_checksum(source_account_number.as_bytes()) as usize % partitions.max(1)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckRecord {
    correlation_id: CorrelationId,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetryRecord {
    correlation_id: CorrelationId,
    attempt: u32,
}

struct Partition {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Mutex<mpsc::UnboundedReceiver<Delivery>>,
}

/// In-process partitioned queue with optional journal
pub struct MemoryQueue {
    partitions: Vec<Arc<Partition>>,
    journal: Option<Journal>,
    /// Published and not yet acked
    unacked: DashMap<CorrelationId, u32>,
}

impl MemoryQueue {
    pub fn new(partitions: usize) -> Self {
        let partitions = (0..partitions.max(1))
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                Arc::new(Partition {
                    tx,
                    rx: Mutex::new(rx),
                })
            })
            .collect();
        Self {
            partitions,
            journal: None,
            unacked: DashMap::new(),
        }
    }

    /// Journal-backed queue. Un-acked intents found in the journal are
    /// enqueued again in publish order.
    pub fn durable(path: impl AsRef<Path>, partitions: usize) -> Result<Self, TransferError> {
        let (journal, entries) = Journal::open(path)?;
        let mut queue = Self::new(partitions);

        let mut order: Vec<CorrelationId> = Vec::new();
        let mut pending: HashMap<CorrelationId, (TransferIntent, u32)> = HashMap::new();
        for entry in &entries {
            match entry.entry_type()? {
                JournalEntryType::IntentPublished => {
                    let intent: TransferIntent = entry.decode()?;
                    order.push(intent.correlation_id);
                    pending.insert(intent.correlation_id, (intent, 1));
                }
                JournalEntryType::IntentRetried => {
                    let retry: RetryRecord = entry.decode()?;
                    if let Some((_, attempt)) = pending.get_mut(&retry.correlation_id) {
                        *attempt = retry.attempt;
                    }
                }
                JournalEntryType::IntentAcked => {
                    let ack: AckRecord = entry.decode()?;
                    pending.remove(&ack.correlation_id);
                }
                other => {
                    warn!(entry_type = ?other, "Foreign entry in queue journal ignored");
                }
            }
        }

        let mut replayed = 0usize;
        for correlation_id in order {
            if let Some((intent, attempt)) = pending.remove(&correlation_id) {
                queue.enqueue(intent, attempt)?;
                replayed += 1;
            }
        }
        if replayed > 0 {
            info!(replayed, "Queue journal replay: un-acked intents redelivered");
        }

        queue.journal = Some(journal);
        Ok(queue)
    }

    /// Intents published and not yet acked
    pub fn unacked(&self) -> usize {
        self.unacked.len()
    }

    fn enqueue(&self, intent: TransferIntent, attempt: u32) -> Result<(), TransferError> {
        let partition = partition_for(&intent.source_account_number, self.partitions.len());
        self.unacked.insert(intent.correlation_id, attempt);
        self.partitions[partition]
            .tx
            .send(Delivery {
                intent,
                attempt,
                partition,
            })
            .map_err(|_| TransferError::QueueError("partition closed".to_string()))
    }

    fn partition(&self, partition: usize) -> Result<&Arc<Partition>, TransferError> {
        self.partitions
            .get(partition)
            .ok_or_else(|| TransferError::QueueError(format!("no partition {}", partition)))
    }
}

#[async_trait]
impl IntentQueue for MemoryQueue {
    fn partitions(&self) -> usize {
        self.partitions.len()
    }

    async fn publish(&self, intent: &TransferIntent) -> Result<(), TransferError> {
        if let Some(journal) = &self.journal {
            journal.append_json(JournalEntryType::IntentPublished, intent)?;
        }
        self.enqueue(intent.clone(), 1)?;
        debug!(correlation_id = %intent.correlation_id, "Intent published");
        Ok(())
    }

    async fn recv(&self, partition: usize) -> Result<Delivery, TransferError> {
        let mut rx = self.partition(partition)?.rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| TransferError::QueueError("partition closed".to_string()))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransferError> {
        if let Some(journal) = &self.journal {
            journal.append_json(
                JournalEntryType::IntentAcked,
                &AckRecord {
                    correlation_id: delivery.intent.correlation_id,
                },
            )?;
        }
        self.unacked.remove(&delivery.intent.correlation_id);
        Ok(())
    }

    async fn nack(&self, delivery: Delivery, delay: Duration) -> Result<(), TransferError> {
        let partition = Arc::clone(self.partition(delivery.partition)?);
        let redelivery = Delivery {
            attempt: delivery.attempt + 1,
            ..delivery
        };
        if let Some(journal) = &self.journal {
            journal.append_json(
                JournalEntryType::IntentRetried,
                &RetryRecord {
                    correlation_id: redelivery.intent.correlation_id,
                    attempt: redelivery.attempt,
                },
            )?;
        }
        self.unacked
            .insert(redelivery.intent.correlation_id, redelivery.attempt);
        debug!(
            correlation_id = %redelivery.intent.correlation_id,
            attempt = redelivery.attempt,
            delay_ms = delay.as_millis() as u64,
            "Intent redelivery scheduled"
        );

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if partition.tx.send(redelivery).is_err() {
                warn!("Redelivery dropped: partition closed");
            }
        });
        Ok(())
    }
}
