//! Transfer Pipeline - asynchronous account-to-account transfers
//!
//! Moves money between accounts owned by a ledger service that shares no
//! data store with the transaction-recording side. The two are bridged by a
//! durable, at-least-once intent queue.
//!
//! ```text
//! caller ─▶ TransferValidator ─▶ IntentPublisher ─▶ queue ─▶ IntentConsumer
//!                                      │                          │
//!                                      ▼                          ▼
//!                             TransactionRecordStore ◀──── LedgerService
//! ```
//!
//! # Modules
//!
//! - [`core_types`] - Account identifiers and roles
//! - [`account`] - Account model and the account directory seam
//! - [`ledger`] - Sole authority over balances (atomic debit/credit)
//! - [`transfer`] - Validator, publisher, queue, consumer, record store
//! - [`scheduler`] - Staggered, durable, cancellable bulk submission
//! - [`bulk`] - Bulk transfer sources (CSV)
//! - [`journal`] - CRC32-framed append-only journal
//! - [`config`] / [`logging`] - Ambient configuration and tracing set-up

// Core types - must be first!
pub mod core_types;

pub mod account;
pub mod bulk;
pub mod config;
pub mod journal;
pub mod ledger;
pub mod logging;
pub mod scheduler;
pub mod transfer;

// Convenient re-exports at crate root
pub use account::{Account, AccountDirectory, InMemoryAccountDirectory};
pub use core_types::{AccountId, Role};
pub use ledger::{ApplyOutcome, InMemoryLedger, LedgerService, LimitPolicy};
pub use scheduler::{BulkTransferScheduler, ScheduleId, ScheduleStore, TransferSubmitter};
pub use transfer::{
    ConsumerConfig, CorrelationId, IntentConsumer, IntentPublisher, IntentQueue, MemoryQueue,
    TransactionRecord, TransactionRecordStore, TransactionStatus, TransferError, TransferIntent,
    TransferLine, TransferRequest, TransferService, TransferValidator,
};
