//! Account definitions for ledger.

use chrono::{DateTime, Utc};
use ledgerflow_common::{AccountId, Currency};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A ledger account row.
///
/// `balance` always equals the opening balance plus the signed sum of every
/// entry posted against the account. It is only ever changed through
/// `LedgerStore::add_account_balance` inside a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Stable numeric key; also the lock-ordering key.
    pub id: AccountId,
    /// Opaque identifier handed to clients.
    pub public_id: Uuid,
    /// Owner name.
    pub owner: String,
    /// Account currency.
    pub currency: Currency,
    /// Current balance.
    pub balance: Decimal,
    /// When the account was created.
    pub created_at: DateTime<Utc>,
    /// When the balance last changed.
    pub updated_at: Option<DateTime<Utc>>,
    /// Set when the account is soft-deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Account {
    /// Check the account has not been soft-deleted.
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Check if account has sufficient funds for a debit.
    pub fn has_sufficient_funds(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }

    /// Check the account is owned by `owner`.
    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner == owner
    }
}

/// Parameters for opening an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAccount {
    pub owner: String,
    pub currency: Currency,
    pub balance: Decimal,
}

impl NewAccount {
    /// Open an account with an initial balance.
    pub fn new(owner: impl Into<String>, currency: Currency, balance: Decimal) -> Self {
        Self {
            owner: owner.into(),
            currency,
            balance,
        }
    }
}
