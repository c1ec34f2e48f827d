//! Ledger account model

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{AccountId, Role};

/// Ledger account
///
/// # Invariants:
/// - `balance` is never negative
/// - `transfers_today` counts transfers *applied* (not queued) on
///   `counter_date` (UTC) with this account as source
///
/// Owned by the ledger; mutated only through its debit/credit operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub account_number: String,
    balance: Decimal,
    pub role: Role,
    transfers_today: u32,
    counter_date: NaiveDate,
}

impl Account {
    /// Account with an initial balance. The ledger refuses to open one
    /// whose balance is negative.
    pub fn new(id: AccountId, account_number: impl Into<String>, balance: Decimal, role: Role) -> Self {
        Self {
            id,
            account_number: account_number.into(),
            balance,
            role,
            transfers_today: 0,
            counter_date: Utc::now().date_naive(),
        }
    }

    #[inline]
    pub fn balance(&self) -> Decimal {
        self.balance
    }

    /// Applied transfers sent on `today`; a counter from an earlier date reads as zero.
    pub fn transfers_on(&self, today: NaiveDate) -> u32 {
        if self.counter_date == today {
            self.transfers_today
        } else {
            0
        }
    }

    pub(crate) fn debit(&mut self, amount: Decimal) -> Result<Decimal, &'static str> {
        if self.balance < amount {
            return Err("Insufficient funds");
        }
        self.balance = self.balance.checked_sub(amount).ok_or("Debit underflow")?;
        Ok(self.balance)
    }

    pub(crate) fn credit(&mut self, amount: Decimal) -> Result<Decimal, &'static str> {
        self.balance = self.balance.checked_add(amount).ok_or("Credit overflow")?;
        Ok(self.balance)
    }

    /// Count one applied transfer against `today`, rolling the counter over
    /// when the date changed.
    pub(crate) fn record_transfer(&mut self, today: NaiveDate) {
        if self.counter_date != today {
            self.counter_date = today;
            self.transfers_today = 0;
        }
        self.transfers_today = self.transfers_today.saturating_add(1);
    }
}
