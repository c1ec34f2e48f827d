//! Account Directory
//!
//! Resolves account numbers to account ids. The directory belongs to the
//! account service; the pipeline only consumes it through this trait.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::core_types::AccountId;
use crate::transfer::error::TransferError;

/// Account-number lookup seam
///
/// Implementations report infrastructure trouble as
/// `ServiceUnavailable` / `Timeout` so callers can tell it apart from a
/// genuinely unknown account (`Ok(None)`).
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Resolve one account number
    async fn resolve(&self, account_number: &str) -> Result<Option<AccountId>, TransferError>;

    /// Resolve many account numbers at once.
    ///
    /// Unknown numbers are simply absent from the result.
    async fn bulk_resolve(
        &self,
        account_numbers: &[String],
    ) -> Result<Vec<(String, AccountId)>, TransferError>;
}

/// In-memory directory
#[derive(Default)]
pub struct InMemoryAccountDirectory {
    entries: DashMap<String, AccountId>,
}

impl InMemoryAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, account_number: impl Into<String>, id: AccountId) {
        self.entries.insert(account_number.into(), id);
    }

    /// Remove an account number (account closed). Returns the removed id.
    pub fn remove(&self, account_number: &str) -> Option<AccountId> {
        self.entries.remove(account_number).map(|(_, id)| id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AccountDirectory for InMemoryAccountDirectory {
    async fn resolve(&self, account_number: &str) -> Result<Option<AccountId>, TransferError> {
        Ok(self.entries.get(account_number).map(|entry| *entry.value()))
    }

    async fn bulk_resolve(
        &self,
        account_numbers: &[String],
    ) -> Result<Vec<(String, AccountId)>, TransferError> {
        Ok(account_numbers
            .iter()
            .filter_map(|number| {
                self.entries
                    .get(number)
                    .map(|entry| (number.clone(), *entry.value()))
            })
            .collect())
    }
}
