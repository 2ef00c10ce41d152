//! Transfer service.
//!
//! The caller layer in front of the transfer engine: resolves public account
//! identifiers, authorizes the principal, runs the request-level checks and
//! retries storage conflicts.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use ledgerflow_common::{
    fits_minor_units, is_valid_amount, Currency, LedgerError, Result, TransactionId,
    TransferParams,
};
use ledgerflow_ledger::{Account, JournalBatch, Ledger, TransferEngine};

use crate::metrics::SharedMetrics;
use crate::retry::RetryPolicy;

/// Bookkeeping tag for customer-initiated transfers.
pub const TRANSFER_TYPE: &str = "transfer";

/// Role of an authenticated principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Admin,
}

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub owner: String,
    pub role: Role,
}

impl Principal {
    pub fn customer(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            role: Role::Customer,
        }
    }

    pub fn admin(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            role: Role::Admin,
        }
    }

    /// Whether this principal may move funds out of, or inspect, `account`.
    pub fn may_access(&self, account: &Account) -> bool {
        self.role == Role::Admin || account.is_owned_by(&self.owner)
    }
}

/// Transfer request as received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from_account: Uuid,
    pub to_account: Uuid,
    pub amount: Decimal,
    pub currency: Currency,
}

/// What the client gets back for a committed transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transaction_id: Uuid,
    pub from_account: Uuid,
    pub to_account: Uuid,
    pub amount: Decimal,
    pub currency: Currency,
    /// Payer balance after the transfer.
    pub latest_balance: Decimal,
    pub transfer_type: String,
}

/// Front door to the transfer engine.
pub struct TransferService {
    engine: Arc<TransferEngine>,
    retry: RetryPolicy,
    metrics: SharedMetrics,
}

impl TransferService {
    /// Create a new transfer service.
    pub fn new(engine: Arc<TransferEngine>, retry: RetryPolicy, metrics: SharedMetrics) -> Self {
        Self {
            engine,
            retry,
            metrics,
        }
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    fn ledger(&self) -> &Arc<dyn Ledger> {
        self.engine.ledger()
    }

    /// Move funds on behalf of `principal`.
    #[instrument(
        skip(self, principal, request),
        fields(
            owner = %principal.owner,
            from = %request.from_account,
            to = %request.to_account,
            amount = %request.amount
        )
    )]
    pub async fn transfer(
        &self,
        principal: &Principal,
        request: TransferRequest,
    ) -> Result<TransferReceipt> {
        let in_flight = self.metrics.transfer_started();

        let outcome = self.execute(principal, request).await;
        match &outcome {
            Ok(receipt) => {
                in_flight.succeeded();
                info!(transaction_id = %receipt.transaction_id, "Transfer completed");
            }
            Err(err) if err.is_client_error() => in_flight.rejected(),
            Err(err) => {
                if err.is_retryable() {
                    self.metrics.conflict();
                }
                if matches!(err, LedgerError::RollbackFailed { .. }) {
                    self.metrics.rollback_failure();
                }
                in_flight.failed();
            }
        }

        outcome
    }

    async fn execute(
        &self,
        principal: &Principal,
        request: TransferRequest,
    ) -> Result<TransferReceipt> {
        if !is_valid_amount(request.amount) {
            return Err(LedgerError::InvalidAmount {
                amount: request.amount,
            });
        }

        let from = self
            .ledger()
            .get_account_by_public_id(request.from_account)
            .await?;
        if !principal.may_access(&from) {
            return Err(LedgerError::Unauthorized(format!(
                "account {} does not belong to {}",
                request.from_account, principal.owner
            )));
        }

        let to = self
            .ledger()
            .get_account_by_public_id(request.to_account)
            .await?;
        if from.id == to.id {
            return Err(LedgerError::SameAccount);
        }

        if from.currency != request.currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: from.currency.clone(),
                actual: request.currency,
            });
        }
        if to.currency != request.currency {
            return Err(LedgerError::CurrencyMismatch {
                expected: to.currency.clone(),
                actual: request.currency,
            });
        }
        if !fits_minor_units(request.amount, &request.currency) {
            return Err(LedgerError::InvalidRequest(format!(
                "{} allows at most {} decimal places",
                request.currency,
                request.currency.decimal_places()
            )));
        }

        // Early check against the committed balance; the engine checks
        // again under the row lock.
        if !from.has_sufficient_funds(request.amount) {
            return Err(LedgerError::InsufficientFunds {
                account_id: from.id,
                available: from.balance,
                required: request.amount,
            });
        }

        let params =
            TransferParams::new(from.id, to.id, request.amount).with_type(TRANSFER_TYPE);
        let retries = AtomicU32::new(0);
        let result = self
            .retry
            .run(
                || self.engine.transfer(params.clone()),
                |_, _| {
                    retries.fetch_add(1, Ordering::Relaxed);
                    self.metrics.conflict();
                    self.metrics.retry();
                },
            )
            .await?;

        let retries = retries.load(Ordering::Relaxed);
        if retries > 0 {
            info!(retries, "Transfer committed after retry");
        }

        Ok(TransferReceipt {
            transaction_id: result.transaction.public_id,
            from_account: result.from_account.public_id,
            to_account: result.to_account.public_id,
            amount: result.transaction.amount,
            currency: from.currency,
            latest_balance: result.from_account.balance,
            transfer_type: result.transaction.transfer_type,
        })
    }

    /// Read an account the principal may access.
    pub async fn account(&self, principal: &Principal, public_id: Uuid) -> Result<Account> {
        let account = self.ledger().get_account_by_public_id(public_id).await?;
        if !principal.may_access(&account) {
            return Err(LedgerError::Unauthorized(format!(
                "account {public_id} does not belong to {}",
                principal.owner
            )));
        }
        Ok(account)
    }

    /// Audit a committed transfer. Admin only.
    pub async fn verify(&self, principal: &Principal, id: TransactionId) -> Result<JournalBatch> {
        if principal.role != Role::Admin {
            return Err(LedgerError::Unauthorized(
                "journal audit requires the admin role".to_string(),
            ));
        }
        self.engine.verify_transaction(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerflow_ledger::{MemoryLedger, NewAccount};

    #[test]
    fn test_principal_access() {
        let ledger = MemoryLedger::new();
        let account = ledger
            .open_account(NewAccount::new("alice", Currency::usd(), Decimal::ZERO))
            .unwrap();

        assert!(Principal::customer("alice").may_access(&account));
        assert!(!Principal::customer("mallory").may_access(&account));
        assert!(Principal::admin("ops").may_access(&account));
    }

    #[test]
    fn test_request_deserializes() {
        let json = r#"{
            "from_account": "018f6b2e-3c4d-7a8b-9c0d-1e2f3a4b5c6d",
            "to_account": "018f6b2e-3c4d-7a8b-9c0d-1e2f3a4b5c6e",
            "amount": "12.50",
            "currency": "USD"
        }"#;
        let request: TransferRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.amount, Decimal::new(1250, 2));
        assert_eq!(request.currency, Currency::usd());
    }
}
