//! Ledger - sole authority over account balances
//!
//! # Safety Invariants
//!
//! 1. **Check-and-apply**: `source.balance >= amount` is verified in the same
//!    indivisible unit that debits the source and credits the destination.
//! 2. **Non-negativity**: no operation ever leaves a negative balance.
//! 3. **Idempotency**: repeating `transfer` with the same correlation id
//!    returns the original outcome without mutating again.
//! 4. **No global lock**: mutations on overlapping accounts serialize; mutations
//!    on disjoint account pairs proceed independently.

pub mod memory;

pub use memory::InMemoryLedger;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::account::Account;
use crate::core_types::AccountId;
use crate::transfer::error::TransferError;
use crate::transfer::types::CorrelationId;

/// Daily transfer count policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitPolicy {
    /// Applied transfers a `User`-role source may send per UTC day
    pub user_daily_limit: u32,
}

impl Default for LimitPolicy {
    fn default() -> Self {
        Self {
            user_daily_limit: 3,
        }
    }
}

/// Outcome of one atomic transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Both legs applied
    Applied {
        source_balance: Decimal,
        destination_balance: Decimal,
    },
    /// Source balance below amount; nothing applied
    InsufficientFunds { available: Decimal },
    /// Source already sent its daily quota; nothing applied
    DailyLimitReached { applied: u32, limit: u32 },
    /// Source or destination not held by this ledger
    AccountNotFound(AccountId),
}

impl ApplyOutcome {
    #[inline]
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

/// Balance-affecting operation recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerOp {
    Debit,
    Credit,
}

/// Ledger audit entry; every applied transfer writes one debit and one credit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub correlation_id: CorrelationId,
    pub account_id: AccountId,
    pub op: LedgerOp,
    pub delta: Decimal,
    pub balance_after: Decimal,
}

/// Ledger service seam
///
/// A remote ledger reports unreachability as `ServiceUnavailable` or
/// `Timeout`; the consumer retries those.
#[async_trait]
pub trait LedgerService: Send + Sync {
    /// Point-in-time view of one account
    async fn account(&self, id: AccountId) -> Result<Option<Account>, TransferError>;

    /// Atomic, idempotent debit/credit keyed by correlation id.
    ///
    /// On `Applied`, the source's daily counter has been incremented in the
    /// same unit.
    async fn transfer(
        &self,
        correlation_id: CorrelationId,
        source: AccountId,
        destination: AccountId,
        amount: Decimal,
    ) -> Result<ApplyOutcome, TransferError>;
}

/// Fault-injecting ledger wrapper for tests
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    pub struct FlakyLedger {
        inner: Arc<InMemoryLedger>,
        remaining_failures: AtomicUsize,
        always_fail: AtomicBool,
        transfer_calls: AtomicUsize,
        remaining_stalls: AtomicUsize,
        stall: Duration,
    }

    impl FlakyLedger {
        /// Fail the first `failures` transfer calls
        pub fn new(inner: Arc<InMemoryLedger>, failures: usize) -> Self {
            Self {
                inner,
                remaining_failures: AtomicUsize::new(failures),
                always_fail: AtomicBool::new(false),
                transfer_calls: AtomicUsize::new(0),
                remaining_stalls: AtomicUsize::new(0),
                stall: Duration::ZERO,
            }
        }

        /// The first `calls` transfers are applied, then the reply is held
        /// back for `stall` (a lost or late response).
        pub fn stall_after_apply(mut self, calls: usize, stall: Duration) -> Self {
            self.remaining_stalls = AtomicUsize::new(calls);
            self.stall = stall;
            self
        }

        pub fn set_always_fail(&self, fail: bool) {
            self.always_fail.store(fail, Ordering::SeqCst);
        }

        pub fn transfer_calls(&self) -> usize {
            self.transfer_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LedgerService for FlakyLedger {
        async fn account(&self, id: AccountId) -> Result<Option<Account>, TransferError> {
            self.inner.account(id).await
        }

        async fn transfer(
            &self,
            correlation_id: CorrelationId,
            source: AccountId,
            destination: AccountId,
            amount: Decimal,
        ) -> Result<ApplyOutcome, TransferError> {
            self.transfer_calls.fetch_add(1, Ordering::SeqCst);
            let tripped = self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if tripped || self.always_fail.load(Ordering::SeqCst) {
                return Err(TransferError::ServiceUnavailable(
                    "ledger unreachable".to_string(),
                ));
            }
            let outcome = self
                .inner
                .transfer(correlation_id, source, destination, amount)
                .await?;
            let stalled = self
                .remaining_stalls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if stalled {
                tokio::time::sleep(self.stall).await;
            }
            Ok(outcome)
        }
    }
}
