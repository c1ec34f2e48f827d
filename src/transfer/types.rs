//! Transfer Core Types
//!
//! Requests, intents (the queue payload), records and receipts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::state::TransactionStatus;
use crate::core_types::AccountId;

/// Correlation ID - ULID-based unique identifier
///
/// Assigned at publish time. Binds every redelivery of one intent to one
/// outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(ulid::Ulid);

impl CorrelationId {
    /// Generate a new unique CorrelationId
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CorrelationId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// One `{destinationAccountNumber, amount}` pair of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferLine {
    pub destination_account_number: String,
    pub amount: Decimal,
}

impl TransferLine {
    pub fn new(destination_account_number: impl Into<String>, amount: Decimal) -> Self {
        Self {
            destination_account_number: destination_account_number.into(),
            amount,
        }
    }
}

/// Transfer request from the caller
///
/// `source_account_number` is the account the caller *claims*; the
/// validator checks it against the authenticated actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub source_account_number: String,
    pub transfers: Vec<TransferLine>,
}

impl TransferRequest {
    pub fn new(source_account_number: impl Into<String>, transfers: Vec<TransferLine>) -> Self {
        Self {
            source_account_number: source_account_number.into(),
            transfers,
        }
    }

    /// Single-line request
    pub fn single(source_account_number: impl Into<String>, line: TransferLine) -> Self {
        Self::new(source_account_number, vec![line])
    }

    pub fn total_amount(&self) -> Decimal {
        self.transfers.iter().map(|line| line.amount).sum()
    }
}

/// Output of the validator: an authorized transfer not yet published
///
/// Carries the ids resolved during validation so the publisher can write
/// the record without another directory round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTransfer {
    pub source_account_id: AccountId,
    pub source_account_number: String,
    pub destination_account_id: AccountId,
    pub destination_account_number: String,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Intent message (queue payload)
///
/// Immutable once published; identifies exactly one attempted mutation.
///
/// ```json
/// { "correlationId": "01J...", "sourceAccountNumber": "ACC-1",
///   "destinationAccountNumber": "ACC-2", "amount": "300",
///   "timestamp": "2026-10-16T08:00:00Z" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferIntent {
    pub correlation_id: CorrelationId,
    pub source_account_number: String,
    pub destination_account_number: String,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl TransferIntent {
    /// Stamp a validated transfer with a fresh correlation id
    pub fn from_validated(transfer: &ValidatedTransfer) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            source_account_number: transfer.source_account_number.clone(),
            destination_account_number: transfer.destination_account_number.clone(),
            amount: transfer.amount,
            timestamp: transfer.created_at,
        }
    }
}

impl fmt::Display for TransferIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Intent[{}] {} -> {} amount={}",
            self.correlation_id,
            self.source_account_number,
            self.destination_account_number,
            self.amount
        )
    }
}

/// Durable history of one transfer's lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    /// Store-assigned sequence id
    pub id: u64,
    pub correlation_id: CorrelationId,
    pub source_account_id: AccountId,
    pub destination_account_id: AccountId,
    pub amount: Decimal,
    /// Intent creation time
    pub timestamp: DateTime<Utc>,
    pub status: TransactionStatus,
    pub remark: String,
    /// Deliveries observed by consumers
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// New record in QUEUED state; `id` is assigned by the store
    pub fn queued(intent: &TransferIntent, transfer: &ValidatedTransfer) -> Self {
        Self {
            id: 0,
            correlation_id: intent.correlation_id,
            source_account_id: transfer.source_account_id,
            destination_account_id: transfer.destination_account_id,
            amount: intent.amount,
            timestamp: intent.timestamp,
            status: TransactionStatus::Queued,
            remark: QUEUED_REMARK.to_string(),
            attempts: 0,
            updated_at: Utc::now(),
        }
    }

    /// Whether `account_id` is sender or receiver
    pub fn involves(&self, account_id: AccountId) -> bool {
        self.source_account_id == account_id || self.destination_account_id == account_id
    }
}

impl fmt::Display for TransactionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transaction[{}] {} -> {} amount={} status={} remark={}",
            self.correlation_id,
            self.source_account_id,
            self.destination_account_id,
            self.amount,
            self.status,
            self.remark
        )
    }
}

pub const QUEUED_REMARK: &str = "Transaction queued for processing";
pub const SUCCESS_REMARK: &str = "Success";
pub const INVALID_ACCOUNT_REMARK: &str = "Invalid account";
pub const INSUFFICIENT_BALANCE_REMARK: &str = "Insufficient balance";
pub const DAILY_LIMIT_REMARK: &str = "Daily transfer limit reached";
pub const PUBLISH_FAILED_REMARK: &str = "Queue unavailable";
pub const NOT_QUEUED_REMARK: &str = "Batch not queued: record store unavailable";
pub const INFRA_FAILURE_REMARK: &str = "infra failure — needs reconciliation";

/// Per-intent result returned to the caller of a transfer
///
/// `Queued` means *not yet applied*; the final outcome is only observable
/// by querying the transaction record later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReceipt {
    pub correlation_id: CorrelationId,
    pub destination_account_number: String,
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub remark: String,
}

/// 1-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page_number: usize,
    pub page_size: usize,
}

impl PageRequest {
    pub const MAX_PAGE_SIZE: usize = 100;

    pub fn new(page_number: usize, page_size: usize) -> Self {
        Self {
            page_number: page_number.max(1),
            page_size: page_size.clamp(1, Self::MAX_PAGE_SIZE),
        }
    }

    #[inline]
    pub fn offset(&self) -> usize {
        (self.page_number - 1) * self.page_size
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

/// One page of results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page_number: usize,
    pub page_size: usize,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> usize {
        self.total.div_ceil(self.page_size.max(1))
    }
}
