//! Transfer Pipeline
//!
//! Validation, queued propagation and idempotent consumption of
//! account-to-account transfers.
//!
//! # Architecture
//!
//! The ledger and the transaction records live in separate services that
//! share no data store. A transfer is accepted synchronously and applied
//! asynchronously:
//!
//! 1. [`TransferValidator`] authorizes the batch and runs the advisory limit
//!    and balance checks.
//! 2. [`IntentPublisher`] writes a QUEUED [`TransactionRecord`] per line and
//!    publishes a [`TransferIntent`] to the [`IntentQueue`].
//! 3. [`IntentConsumer`] workers apply each intent to the ledger and close
//!    the record as SUCCESS or FAILED.
//!
//! # State Machine
//!
//! ```text
//! QUEUED → PENDING → SUCCESS
//!    │         │
//!    └─────────┴────▶ FAILED
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Record-before-publish**: no consumer sees an intent without a record
//! 2. **Apply-at-most-once**: the ledger mutation is keyed by correlation id
//! 3. **Monotone status**: record status changes only through CAS on legal edges
//! 4. **Bounded retries**: transient failures are retried with exponential
//!    backoff, then escalated for reconciliation

pub mod consumer;
pub mod error;
pub mod publisher;
pub mod queue;
pub mod records;
pub mod service;
pub mod state;
pub mod types;
pub mod validator;


// Re-exports for convenience
pub use consumer::{ConsumeOutcome, ConsumerConfig, ConsumerStatsSnapshot, IntentConsumer};
pub use error::{ErrorCategory, TransferError};
pub use publisher::IntentPublisher;
pub use queue::{Delivery, IntentQueue, MemoryQueue};
pub use records::{InMemoryRecordStore, TransactionRecordStore};
pub use service::TransferService;
pub use state::TransactionStatus;
pub use types::{
    CorrelationId, Page, PageRequest, PublishReceipt, TransactionRecord, TransferIntent,
    TransferLine, TransferRequest, ValidatedTransfer,
};
pub use validator::{MAX_BATCH_SIZE, TransferValidator};
