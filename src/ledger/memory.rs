//! In-memory ledger
//!
//! Each account sits behind its own `Mutex` stripe. A transfer locks the
//! two stripes in ascending `AccountId` order, so overlapping transfers
//! serialize without deadlock and disjoint pairs never contend.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::{ApplyOutcome, LedgerEntry, LedgerOp, LedgerService, LimitPolicy};
use crate::account::Account;
use crate::core_types::AccountId;
use crate::transfer::error::TransferError;
use crate::transfer::types::CorrelationId;

fn lock_account(stripe: &Mutex<Account>) -> Result<MutexGuard<'_, Account>, TransferError> {
    stripe
        .lock()
        .map_err(|_| TransferError::SystemError("account lock poisoned".to_string()))
}

/// Lock-striped in-memory ledger
pub struct InMemoryLedger {
    accounts: DashMap<AccountId, Arc<Mutex<Account>>>,
    /// Decided outcomes keyed by correlation id
    outcomes: DashMap<CorrelationId, ApplyOutcome>,
    entries: Mutex<Vec<LedgerEntry>>,
    policy: LimitPolicy,
}

impl InMemoryLedger {
    pub fn new(policy: LimitPolicy) -> Self {
        Self {
            accounts: DashMap::new(),
            outcomes: DashMap::new(),
            entries: Mutex::new(Vec::new()),
            policy,
        }
    }

    pub fn policy(&self) -> LimitPolicy {
        self.policy
    }

    /// Open an account. Fails if the id is already taken or the opening
    /// balance is negative.
    pub fn open_account(&self, account: Account) -> Result<(), TransferError> {
        let id = account.id;
        if account.balance() < Decimal::ZERO {
            return Err(TransferError::SystemError(format!(
                "Account {} opening balance {} is negative",
                id,
                account.balance()
            )));
        }
        match self.accounts.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(TransferError::SystemError(
                format!("Account {} already exists", id),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(
                    account_id = id,
                    account_number = %account.account_number,
                    balance = %account.balance(),
                    role = %account.role,
                    "Account opened"
                );
                slot.insert(Arc::new(Mutex::new(account)));
                Ok(())
            }
        }
    }

    /// Close an account, returning its final state
    pub fn close_account(&self, id: AccountId) -> Option<Account> {
        let (_, stripe) = self.accounts.remove(&id)?;
        let account = lock_account(&stripe).ok()?.clone();
        Some(account)
    }

    pub fn balance(&self, id: AccountId) -> Option<Decimal> {
        let stripe = self.stripe(id)?;
        let guard = lock_account(&stripe).ok()?;
        Some(guard.balance())
    }

    /// Sum of all balances (conservation checks)
    pub fn total_balance(&self) -> Decimal {
        self.stripes()
            .iter()
            .filter_map(|stripe| lock_account(stripe).ok().map(|a| a.balance()))
            .sum()
    }

    /// Copy of the audit trail
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Number of correlation ids that actually moved money
    pub fn applied_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|entry| entry.value().is_applied())
            .count()
    }

    fn stripe(&self, id: AccountId) -> Option<Arc<Mutex<Account>>> {
        self.accounts.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    fn stripes(&self) -> Vec<Arc<Mutex<Account>>> {
        self.accounts
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    fn decided(&self, correlation_id: &CorrelationId) -> Option<ApplyOutcome> {
        self.outcomes
            .get(correlation_id)
            .map(|entry| entry.value().clone())
    }

    /// The indivisible check-and-apply unit. Never awaits.
    fn apply_locked(
        &self,
        correlation_id: CorrelationId,
        source: AccountId,
        destination: AccountId,
        amount: Decimal,
        today: NaiveDate,
    ) -> Result<ApplyOutcome, TransferError> {
        if amount <= Decimal::ZERO {
            return Err(TransferError::InvalidAmount);
        }
        if source == destination {
            return Err(TransferError::SameAccount);
        }
        if let Some(previous) = self.decided(&correlation_id) {
            debug!(correlation_id = %correlation_id, "Ledger replay: returning original outcome");
            return Ok(previous);
        }

        let Some(source_stripe) = self.stripe(source) else {
            return Ok(ApplyOutcome::AccountNotFound(source));
        };
        let Some(destination_stripe) = self.stripe(destination) else {
            return Ok(ApplyOutcome::AccountNotFound(destination));
        };

        // Ascending id order
        let (mut low, mut high) = if source < destination {
            (
                lock_account(&source_stripe)?,
                lock_account(&destination_stripe)?,
            )
        } else {
            let high = lock_account(&destination_stripe)?;
            let low = lock_account(&source_stripe)?;
            (high, low)
        };
        let (source_account, destination_account) = if source < destination {
            (&mut *low, &mut *high)
        } else {
            (&mut *high, &mut *low)
        };

        // A concurrent duplicate may have decided while we waited
        if let Some(previous) = self.decided(&correlation_id) {
            return Ok(previous);
        }

        let applied_today = source_account.transfers_on(today);
        let outcome = if source_account.role.is_rate_limited()
            && applied_today >= self.policy.user_daily_limit
        {
            ApplyOutcome::DailyLimitReached {
                applied: applied_today,
                limit: self.policy.user_daily_limit,
            }
        } else if source_account.balance() < amount {
            ApplyOutcome::InsufficientFunds {
                available: source_account.balance(),
            }
        } else {
            let source_balance = source_account
                .debit(amount)
                .map_err(|e| TransferError::SystemError(e.to_string()))?;
            let destination_balance = match destination_account.credit(amount) {
                Ok(balance) => balance,
                Err(e) => {
                    // Undo the debit; both legs or neither
                    source_account
                        .credit(amount)
                        .map_err(|e| TransferError::SystemError(e.to_string()))?;
                    return Err(TransferError::SystemError(e.to_string()));
                }
            };
            source_account.record_transfer(today);

            if let Ok(mut entries) = self.entries.lock() {
                entries.push(LedgerEntry {
                    correlation_id,
                    account_id: source,
                    op: LedgerOp::Debit,
                    delta: amount,
                    balance_after: source_balance,
                });
                entries.push(LedgerEntry {
                    correlation_id,
                    account_id: destination,
                    op: LedgerOp::Credit,
                    delta: amount,
                    balance_after: destination_balance,
                });
            }

            ApplyOutcome::Applied {
                source_balance,
                destination_balance,
            }
        };

        self.outcomes.insert(correlation_id, outcome.clone());
        Ok(outcome)
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new(LimitPolicy::default())
    }
}

#[async_trait]
impl LedgerService for InMemoryLedger {
    async fn account(&self, id: AccountId) -> Result<Option<Account>, TransferError> {
        match self.stripe(id) {
            Some(stripe) => Ok(Some(lock_account(&stripe)?.clone())),
            None => Ok(None),
        }
    }

    async fn transfer(
        &self,
        correlation_id: CorrelationId,
        source: AccountId,
        destination: AccountId,
        amount: Decimal,
    ) -> Result<ApplyOutcome, TransferError> {
        let outcome = self.apply_locked(
            correlation_id,
            source,
            destination,
            amount,
            Utc::now().date_naive(),
        )?;
        debug!(
            correlation_id = %correlation_id,
            source = source,
            destination = destination,
            amount = %amount,
            outcome = ?outcome,
            "Ledger transfer"
        );
        Ok(outcome)
    }
}
