//! Transfer Error Types
//!
//! Every error maps onto one of the pipeline's failure categories, which
//! decides whether it is rejected synchronously, retried, or absorbed.

use rust_decimal::Decimal;
use thiserror::Error;

/// Failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad shape, limit breach, insufficient funds at submission time.
    /// Rejected synchronously, never retried.
    Validation,
    /// Actor/account mismatch. Rejected synchronously.
    Authorization,
    /// Queue, ledger or directory unavailable or timed out.
    /// Retried with bounded exponential backoff inside the consumer.
    TransientInfra,
    /// Discovered only at apply time. Recorded Failed, never retried.
    PermanentApply,
    /// Same correlation id redelivered after a terminal outcome. Absorbed,
    /// and reported as `ConsumeOutcome::Duplicate` rather than an error.
    DuplicateDelivery,
}

/// Transfer error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Transfer batch is empty")]
    EmptyBatch,

    #[error("Transfer batch too large: {0} lines")]
    BatchTooLarge(usize),

    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Source and destination account cannot be the same")]
    SameAccount,

    #[error("Daily transfer limit exceeded: {applied} applied today, limit {limit}")]
    LimitExceeded { applied: u32, limit: u32 },

    #[error("Insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds {
        requested: Decimal,
        available: Decimal,
    },

    // === Authorization Errors ===
    #[error("Actor does not own the source account")]
    Unauthorized,

    // === Account Errors ===
    #[error("Account not found: {0}")]
    InvalidAccount(String),

    // === Idempotency Errors ===
    #[error("Duplicate correlation id: {0}")]
    DuplicateRequest(String),

    // === System Errors ===
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Call timed out: {0}")]
    Timeout(String),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("Internal system error: {0}")]
    SystemError(String),

    #[error("Transaction record not found: {0}")]
    RecordNotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
}

impl TransferError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::EmptyBatch => "EMPTY_BATCH",
            TransferError::BatchTooLarge(_) => "BATCH_TOO_LARGE",
            TransferError::InvalidAmount => "INVALID_AMOUNT",
            TransferError::SameAccount => "SAME_ACCOUNT",
            TransferError::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            TransferError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            TransferError::Unauthorized => "UNAUTHORIZED",
            TransferError::InvalidAccount(_) => "INVALID_ACCOUNT",
            TransferError::DuplicateRequest(_) => "DUPLICATE_REQUEST",
            TransferError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            TransferError::Timeout(_) => "TIMEOUT",
            TransferError::QueueError(_) => "QUEUE_ERROR",
            TransferError::SystemError(_) => "SYSTEM_ERROR",
            TransferError::RecordNotFound(_) => "RECORD_NOT_FOUND",
            TransferError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            TransferError::Unauthorized => 401,
            TransferError::EmptyBatch
            | TransferError::BatchTooLarge(_)
            | TransferError::InvalidAmount
            | TransferError::SameAccount
            | TransferError::DuplicateRequest(_) => 400,
            TransferError::InvalidAccount(_)
            | TransferError::LimitExceeded { .. }
            | TransferError::InsufficientFunds { .. } => 422,
            TransferError::RecordNotFound(_) => 404,
            TransferError::SystemError(_) | TransferError::InvalidStateTransition(_) => 500,
            TransferError::ServiceUnavailable(_)
            | TransferError::QueueError(_)
            | TransferError::Timeout(_) => 503,
        }
    }

    /// Failure category of this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransferError::EmptyBatch
            | TransferError::BatchTooLarge(_)
            | TransferError::InvalidAmount
            | TransferError::SameAccount
            | TransferError::LimitExceeded { .. }
            | TransferError::InsufficientFunds { .. }
            | TransferError::InvalidAccount(_)
            | TransferError::DuplicateRequest(_) => ErrorCategory::Validation,
            TransferError::Unauthorized => ErrorCategory::Authorization,
            TransferError::ServiceUnavailable(_)
            | TransferError::Timeout(_)
            | TransferError::QueueError(_) => ErrorCategory::TransientInfra,
            TransferError::SystemError(_)
            | TransferError::RecordNotFound(_)
            | TransferError::InvalidStateTransition(_) => ErrorCategory::PermanentApply,
        }
    }

    /// Retry predicate used by the consumer
    #[inline]
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::TransientInfra
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::SystemError(e.to_string())
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        TransferError::SystemError(e.to_string())
    }
}

impl From<anyhow::Error> for TransferError {
    fn from(e: anyhow::Error) -> Self {
        TransferError::SystemError(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TransferError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        TransferError::Timeout(e.to_string())
    }
}
