//! Transaction Record Status
//!
//! ```text
//! QUEUED → PENDING → SUCCESS
//!    │         │
//!    └─────────┴────▶ FAILED
//! ```
//!
//! Terminal states: SUCCESS (40), FAILED (-10). No transition leaves a
//! terminal state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Record written and intent published; not yet applied
    Queued,

    /// A consumer has claimed the intent and is applying it
    Pending,

    /// Terminal: ledger mutation applied
    Success,

    /// Terminal: rejected or abandoned, no ledger mutation
    Failed,
}

impl TransactionStatus {
    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Success | TransactionStatus::Failed)
    }

    /// Whether `self → next` is a legal (monotone) transition
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Queued, Pending) | (Queued, Failed) | (Pending, Success) | (Pending, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Queued => "QUEUED",
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Success => "SUCCESS",
            TransactionStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
