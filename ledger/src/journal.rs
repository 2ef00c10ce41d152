//! Journal types for double-entry bookkeeping.
//!
//! Entries and transactions are append-only: once written they are never
//! updated or deleted.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ledgerflow_common::{AccountId, EntryId, LedgerError, Result, TransactionId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::account::Account;

/// Side of a ledger entry, from the account holder's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Money leaves the account.
    Debit,
    /// Money enters the account.
    Credit,
}

impl EntryKind {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Debit => "debit",
            EntryKind::Credit => "credit",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "debit" => Ok(EntryKind::Debit),
            "credit" => Ok(EntryKind::Credit),
            other => Err(LedgerError::DatabaseError(format!(
                "unknown entry kind '{other}'"
            ))),
        }
    }
}

/// A single immutable ledger line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Unique entry ID.
    pub id: EntryId,
    /// Transfer this entry belongs to.
    pub transaction_id: TransactionId,
    /// Account affected.
    pub account_id: AccountId,
    /// Debit or credit.
    pub kind: EntryKind,
    /// Unsigned amount.
    pub amount: Decimal,
    /// When this entry was created.
    pub created_at: DateTime<Utc>,
}

impl Entry {
    /// Effect on the account balance: negative for debits.
    pub fn signed_amount(&self) -> Decimal {
        match self.kind {
            EntryKind::Debit => -self.amount,
            EntryKind::Credit => self.amount,
        }
    }
}

/// Entry to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    pub kind: EntryKind,
    pub amount: Decimal,
}

impl NewEntry {
    /// Create a debit entry.
    pub fn debit(transaction_id: TransactionId, account_id: AccountId, amount: Decimal) -> Self {
        Self {
            transaction_id,
            account_id,
            kind: EntryKind::Debit,
            amount,
        }
    }

    /// Create a credit entry.
    pub fn credit(transaction_id: TransactionId, account_id: AccountId, amount: Decimal) -> Self {
        Self {
            transaction_id,
            account_id,
            kind: EntryKind::Credit,
            amount,
        }
    }
}

/// Record of one transfer event. Not to be confused with the database
/// transaction that writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub public_id: Uuid,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: Decimal,
    pub transfer_type: String,
    pub created_at: DateTime<Utc>,
}

/// Transaction record to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: Decimal,
    pub transfer_type: String,
}

/// Everything a committed transfer produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub transaction: Transaction,
    /// Payer after the debit.
    pub from_account: Account,
    /// Payee after the credit.
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

/// The entries of one transaction, checked together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalBatch {
    /// Transaction ID for the batch.
    pub transaction_id: TransactionId,
    /// Entries in the batch.
    pub entries: Vec<Entry>,
}

impl JournalBatch {
    /// Create a new batch.
    pub fn new(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            entries: Vec::new(),
        }
    }

    /// Build a batch from entries already loaded for `transaction_id`.
    pub fn from_entries(transaction_id: TransactionId, entries: Vec<Entry>) -> Self {
        Self {
            transaction_id,
            entries,
        }
    }

    /// Add an entry to the batch.
    pub fn add_entry(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    /// Verify the batch is balanced (signed amounts sum to zero).
    pub fn is_balanced(&self) -> bool {
        self.entries
            .iter()
            .map(Entry::signed_amount)
            .sum::<Decimal>()
            .is_zero()
    }

    /// Get total debits.
    pub fn total_debits(&self) -> Decimal {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::Debit)
            .map(|e| e.amount)
            .sum()
    }

    /// Get total credits.
    pub fn total_credits(&self) -> Decimal {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::Credit)
            .map(|e| e.amount)
            .sum()
    }

    /// Check the batch is exactly the debit/credit pair `transaction` requires.
    pub fn verify(&self, transaction: &Transaction) -> Result<()> {
        let fail = |reason: String| {
            Err(LedgerError::IntegrityViolation(format!(
                "transaction {}: {reason}",
                transaction.id
            )))
        };

        if self.transaction_id != transaction.id {
            return fail(format!("batch belongs to transaction {}", self.transaction_id));
        }
        if self.entries.len() != 2 {
            return fail(format!("expected 2 entries, found {}", self.entries.len()));
        }
        if self.entries.iter().any(|e| e.transaction_id != transaction.id) {
            return fail("entry linked to another transaction".to_string());
        }

        let debit = self.entries.iter().find(|e| e.kind == EntryKind::Debit);
        let credit = self.entries.iter().find(|e| e.kind == EntryKind::Credit);
        let (Some(debit), Some(credit)) = (debit, credit) else {
            return fail("expected one debit and one credit".to_string());
        };

        if debit.account_id != transaction.from_account_id {
            return fail(format!("debit posted to account {}", debit.account_id));
        }
        if credit.account_id != transaction.to_account_id {
            return fail(format!("credit posted to account {}", credit.account_id));
        }
        if debit.amount != transaction.amount || credit.amount != transaction.amount {
            return fail("entry amount differs from transaction amount".to_string());
        }
        if !self.is_balanced() {
            return fail("entries do not sum to zero".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transaction(amount: i64) -> Transaction {
        Transaction {
            id: TransactionId::new(1),
            public_id: Uuid::now_v7(),
            from_account_id: AccountId::new(10),
            to_account_id: AccountId::new(20),
            amount: Decimal::from(amount),
            transfer_type: "transfer".to_string(),
            created_at: Utc::now(),
        }
    }

    fn entry(id: i64, account: i64, kind: EntryKind, amount: i64) -> Entry {
        Entry {
            id: EntryId::new(id),
            transaction_id: TransactionId::new(1),
            account_id: AccountId::new(account),
            kind,
            amount: Decimal::from(amount),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_balanced_batch() {
        let mut batch = JournalBatch::new(TransactionId::new(1));
        batch.add_entry(entry(1, 10, EntryKind::Debit, 1000));
        batch.add_entry(entry(2, 20, EntryKind::Credit, 1000));

        assert!(batch.is_balanced());
        assert_eq!(batch.total_debits(), Decimal::from(1000));
        assert_eq!(batch.total_credits(), Decimal::from(1000));
        assert!(batch.verify(&transaction(1000)).is_ok());
    }

    #[test]
    fn test_unbalanced_batch() {
        let mut batch = JournalBatch::new(TransactionId::new(1));
        batch.add_entry(entry(1, 10, EntryKind::Debit, 1000));

        assert!(!batch.is_balanced());
        assert!(matches!(
            batch.verify(&transaction(1000)),
            Err(LedgerError::IntegrityViolation(_))
        ));
    }

    #[test]
    fn test_entries_on_swapped_accounts_fail_verification() {
        let mut batch = JournalBatch::new(TransactionId::new(1));
        batch.add_entry(entry(1, 20, EntryKind::Debit, 1000));
        batch.add_entry(entry(2, 10, EntryKind::Credit, 1000));

        // Balanced, but posted against the wrong sides.
        assert!(batch.is_balanced());
        assert!(batch.verify(&transaction(1000)).is_err());
    }

    #[test]
    fn test_signed_amount() {
        assert_eq!(entry(1, 10, EntryKind::Debit, 7).signed_amount(), Decimal::from(-7));
        assert_eq!(entry(2, 20, EntryKind::Credit, 7).signed_amount(), Decimal::from(7));
    }

    #[test]
    fn test_entry_kind_round_trip() {
        assert_eq!("debit".parse::<EntryKind>().unwrap(), EntryKind::Debit);
        assert_eq!(EntryKind::Credit.to_string(), "credit");
        assert!("refund".parse::<EntryKind>().is_err());
        assert_eq!(serde_json::to_string(&EntryKind::Debit).unwrap(), "\"debit\"");
    }

    #[test]
    fn test_batch_from_entries() {
        let batch = JournalBatch::from_entries(
            TransactionId::new(1),
            vec![
                entry(1, 10, EntryKind::Debit, 5),
                entry(2, 20, EntryKind::Credit, 5),
            ],
        );
        assert!(batch.verify(&transaction(5)).is_ok());
        assert!(batch.verify(&transaction(6)).is_err());
    }
}
