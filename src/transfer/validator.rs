//! Transfer Validator
//!
//! Authorizes a request and runs the advisory limit and balance checks
//! before anything is queued. Never mutates a balance.
//!
//! # Check order
//!
//! ```text
//! shape ─▶ Unauthorized ─▶ InvalidAccount ─▶ LimitExceeded ─▶ InsufficientFunds
//! ```
//!
//! The first failing check decides the error. The limit and balance checks
//! are point-in-time; the ledger enforces both again at apply time.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::error::TransferError;
use super::types::{TransferRequest, ValidatedTransfer};
use crate::account::{Account, AccountDirectory};
use crate::core_types::{AccountId, Role};
use crate::ledger::{LedgerService, LimitPolicy};

/// Maximum lines in one transfer batch
pub const MAX_BATCH_SIZE: usize = 500;

pub struct TransferValidator {
    directory: Arc<dyn AccountDirectory>,
    ledger: Arc<dyn LedgerService>,
    policy: LimitPolicy,
    call_timeout: Duration,
}

impl TransferValidator {
    pub fn new(
        directory: Arc<dyn AccountDirectory>,
        ledger: Arc<dyn LedgerService>,
        policy: LimitPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            ledger,
            policy,
            call_timeout,
        }
    }

    pub fn policy(&self) -> LimitPolicy {
        self.policy
    }

    /// Validate a batch on behalf of `actor`.
    ///
    /// Returns one `ValidatedTransfer` per line, in input order.
    pub async fn validate(
        &self,
        actor: AccountId,
        request: &TransferRequest,
    ) -> Result<Vec<ValidatedTransfer>, TransferError> {
        Self::check_shape(request)?;

        let source = self.authorize(actor, &request.source_account_number).await?;
        let destinations = self.resolve_destinations(request).await?;

        let mut validated = Vec::with_capacity(request.transfers.len());
        let created_at = Utc::now();
        for line in &request.transfers {
            let destination_account_id = *destinations
                .get(&line.destination_account_number)
                .ok_or_else(|| {
                    TransferError::InvalidAccount(line.destination_account_number.clone())
                })?;
            if destination_account_id == source.id {
                return Err(TransferError::SameAccount);
            }
            validated.push(ValidatedTransfer {
                source_account_id: source.id,
                source_account_number: source.account_number.clone(),
                destination_account_id,
                destination_account_number: line.destination_account_number.clone(),
                amount: line.amount,
                created_at,
            });
        }

        if source.role.is_rate_limited() {
            let applied = source.transfers_on(created_at.date_naive());
            let requested = u32::try_from(request.transfers.len()).unwrap_or(u32::MAX);
            if applied.saturating_add(requested) > self.policy.user_daily_limit {
                debug!(
                    actor = actor,
                    applied,
                    requested,
                    limit = self.policy.user_daily_limit,
                    "Daily limit would be exceeded"
                );
                return Err(TransferError::LimitExceeded {
                    applied,
                    limit: self.policy.user_daily_limit,
                });
            }
        }

        let requested = request.total_amount();
        if requested > source.balance() {
            return Err(TransferError::InsufficientFunds {
                requested,
                available: source.balance(),
            });
        }

        debug!(
            actor = actor,
            lines = validated.len(),
            total = %requested,
            "Transfer batch validated"
        );
        Ok(validated)
    }

    fn check_shape(request: &TransferRequest) -> Result<(), TransferError> {
        if request.transfers.is_empty() {
            return Err(TransferError::EmptyBatch);
        }
        if request.transfers.len() > MAX_BATCH_SIZE {
            return Err(TransferError::BatchTooLarge(request.transfers.len()));
        }
        for line in &request.transfers {
            if line.amount <= Decimal::ZERO {
                return Err(TransferError::InvalidAmount);
            }
            if line.destination_account_number == request.source_account_number {
                return Err(TransferError::SameAccount);
            }
        }
        Ok(())
    }

    /// Actor must own the claimed source account. Any lookup failure on
    /// this path is reported as `Unauthorized`.
    async fn authorize(
        &self,
        actor: AccountId,
        source_account_number: &str,
    ) -> Result<Account, TransferError> {
        let resolved = self
            .bounded(self.directory.resolve(source_account_number))
            .await
            .map_err(|e| {
                warn!(actor = actor, error = %e, "Source lookup failed");
                TransferError::Unauthorized
            })?;

        match resolved {
            Some(id) if id == actor => {}
            _ => return Err(TransferError::Unauthorized),
        }

        let snapshot = self
            .bounded(self.ledger.account(actor))
            .await
            .map_err(|e| {
                warn!(actor = actor, error = %e, "Source snapshot failed");
                TransferError::Unauthorized
            })?;
        snapshot.ok_or(TransferError::Unauthorized)
    }

    /// Require `actor` to hold an open `Admin` account
    pub async fn require_admin(&self, actor: AccountId) -> Result<(), TransferError> {
        let snapshot = self.bounded(self.ledger.account(actor)).await?;
        match snapshot {
            Some(account) if account.role == Role::Admin => Ok(()),
            _ => {
                warn!(actor = actor, "Admin access refused");
                Err(TransferError::Unauthorized)
            }
        }
    }

    async fn resolve_destinations(
        &self,
        request: &TransferRequest,
    ) -> Result<HashMap<String, AccountId>, TransferError> {
        let mut numbers: Vec<String> = request
            .transfers
            .iter()
            .map(|line| line.destination_account_number.clone())
            .collect();
        numbers.sort();
        numbers.dedup();

        let resolved = self
            .bounded(self.directory.bulk_resolve(&numbers))
            .await
            .map_err(|e| {
                warn!(error = %e, "Destination lookup failed");
                TransferError::InvalidAccount(numbers.join(","))
            })?;
        let resolved: HashMap<String, AccountId> = resolved.into_iter().collect();

        // Report the first unknown destination in input order
        if let Some(line) = request
            .transfers
            .iter()
            .find(|line| !resolved.contains_key(&line.destination_account_number))
        {
            return Err(TransferError::InvalidAccount(
                line.destination_account_number.clone(),
            ));
        }
        Ok(resolved)
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, TransferError>>,
    ) -> Result<T, TransferError> {
        tokio::time::timeout(self.call_timeout, call).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::InMemoryAccountDirectory;
    use crate::account::directory::mock::FlakyDirectory;
    use crate::ledger::InMemoryLedger;
    use crate::transfer::types::{CorrelationId, TransferLine};

    fn dec(v: i64) -> Decimal {
        Decimal::from(v)
    }

    struct Fixture {
        directory: Arc<InMemoryAccountDirectory>,
        ledger: Arc<InMemoryLedger>,
    }

    impl Fixture {
        fn new() -> Self {
            let directory = Arc::new(InMemoryAccountDirectory::new());
            let ledger = Arc::new(InMemoryLedger::default());
            for (id, balance, role) in [
                (1, 1000, Role::User),
                (2, 0, Role::User),
                (3, 0, Role::User),
                (4, 5000, Role::Merchant),
            ] {
                let number = format!("ACC-{}", id);
                directory.register(number.clone(), id);
                ledger
                    .open_account(Account::new(id, number, dec(balance), role))
                    .unwrap();
            }
            Self { directory, ledger }
        }

        fn validator(&self) -> TransferValidator {
            TransferValidator::new(
                self.directory.clone(),
                self.ledger.clone(),
                LimitPolicy::default(),
                Duration::from_secs(1),
            )
        }
    }

    fn batch(source: &str, lines: &[(&str, i64)]) -> TransferRequest {
        TransferRequest::new(
            source,
            lines
                .iter()
                .map(|(to, amount)| TransferLine::new(*to, dec(*amount)))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_valid_batch_keeps_order() {
        let fx = Fixture::new();
        let validated = fx
            .validator()
            .validate(1, &batch("ACC-1", &[("ACC-2", 100), ("ACC-3", 200)]))
            .await
            .unwrap();

        assert_eq!(validated.len(), 2);
        assert_eq!(validated[0].destination_account_id, 2);
        assert_eq!(validated[1].destination_account_id, 3);
        assert_eq!(validated[1].amount, dec(200));
        // Nothing moved
        assert_eq!(fx.ledger.balance(1), Some(dec(1000)));
    }

    #[tokio::test]
    async fn test_shape_errors() {
        let fx = Fixture::new();
        let v = fx.validator();
        assert_eq!(
            v.validate(1, &batch("ACC-1", &[])).await,
            Err(TransferError::EmptyBatch)
        );
        assert_eq!(
            v.validate(1, &batch("ACC-1", &[("ACC-2", 0)])).await,
            Err(TransferError::InvalidAmount)
        );
        assert_eq!(
            v.validate(1, &batch("ACC-1", &[("ACC-1", 5)])).await,
            Err(TransferError::SameAccount)
        );
        let too_many: Vec<(&str, i64)> = vec![("ACC-2", 1); MAX_BATCH_SIZE + 1];
        assert_eq!(
            v.validate(1, &batch("ACC-1", &too_many)).await,
            Err(TransferError::BatchTooLarge(MAX_BATCH_SIZE + 1))
        );
    }

    #[tokio::test]
    async fn test_actor_must_own_source() {
        let fx = Fixture::new();
        let result = fx
            .validator()
            .validate(2, &batch("ACC-1", &[("ACC-3", 10)]))
            .await;
        assert_eq!(result, Err(TransferError::Unauthorized));

        let unknown = fx
            .validator()
            .validate(1, &batch("ACC-404", &[("ACC-3", 10)]))
            .await;
        assert_eq!(unknown, Err(TransferError::Unauthorized));
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let fx = Fixture::new();
        let result = fx
            .validator()
            .validate(1, &batch("ACC-1", &[("ACC-2", 10), ("ACC-9", 10)]))
            .await;
        assert_eq!(result, Err(TransferError::InvalidAccount("ACC-9".into())));
    }

    #[tokio::test]
    async fn test_limit_counts_applied_transfers_only() {
        let fx = Fixture::new();
        for _ in 0..2 {
            fx.ledger
                .transfer(CorrelationId::new(), 1, 2, dec(10))
                .await
                .unwrap();
        }

        // 2 applied + 1 requested = 3: allowed
        fx.validator()
            .validate(1, &batch("ACC-1", &[("ACC-2", 10)]))
            .await
            .unwrap();

        // 2 applied + 2 requested = 4: rejected
        let result = fx
            .validator()
            .validate(1, &batch("ACC-1", &[("ACC-2", 10), ("ACC-3", 10)]))
            .await;
        assert_eq!(
            result,
            Err(TransferError::LimitExceeded {
                applied: 2,
                limit: 3
            })
        );
    }

    #[tokio::test]
    async fn test_limit_precedes_insufficient_funds() {
        let fx = Fixture::new();
        let result = fx
            .validator()
            .validate(
                1,
                &batch(
                    "ACC-1",
                    &[("ACC-2", 300), ("ACC-2", 300), ("ACC-3", 300), ("ACC-3", 300)],
                ),
            )
            .await;
        assert!(matches!(result, Err(TransferError::LimitExceeded { .. })));
    }

    #[tokio::test]
    async fn test_insufficient_funds_on_batch_total() {
        let fx = Fixture::new();
        let result = fx
            .validator()
            .validate(1, &batch("ACC-1", &[("ACC-2", 600), ("ACC-3", 600)]))
            .await;
        assert_eq!(
            result,
            Err(TransferError::InsufficientFunds {
                requested: dec(1200),
                available: dec(1000)
            })
        );
    }

    #[tokio::test]
    async fn test_merchant_has_no_count_limit() {
        let fx = Fixture::new();
        let lines: Vec<(&str, i64)> = vec![("ACC-2", 10); 10];
        let validated = fx
            .validator()
            .validate(4, &batch("ACC-4", &lines))
            .await
            .unwrap();
        assert_eq!(validated.len(), 10);
    }

    #[tokio::test]
    async fn test_directory_outage_surfaces_as_unauthorized() {
        let fx = Fixture::new();
        let flaky = Arc::new(FlakyDirectory::new(fx.directory.clone(), 1));
        let validator = TransferValidator::new(
            flaky,
            fx.ledger.clone(),
            LimitPolicy::default(),
            Duration::from_secs(1),
        );
        let result = validator
            .validate(1, &batch("ACC-1", &[("ACC-2", 10)]))
            .await;
        assert_eq!(result, Err(TransferError::Unauthorized));
    }
}
