//! Ledger store seams.
//!
//! [`LedgerStore`] is the set of primitives the transfer engine composes; an
//! implementation is always bound to one open unit of work. [`Ledger`] is the
//! backing storage that opens those units of work and serves read-only
//! lookups outside of one.

use async_trait::async_trait;
use ledgerflow_common::{AccountId, EntryId, Result, TransactionId};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::account::Account;
use crate::journal::{Entry, NewEntry, NewTransaction, Transaction};

/// Store operations executed inside the currently open unit of work.
#[async_trait]
pub trait LedgerStore: Send {
    /// Read an account row and hold its write lock until the unit of work ends.
    ///
    /// Blocks while another unit of work holds the lock. Fails with
    /// `AccountNotFound` for a missing or soft-deleted account.
    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account>;

    /// Atomically add `delta` to the stored balance and return the updated row.
    ///
    /// Fails with `InsufficientFunds` if the result would be negative.
    async fn add_account_balance(&mut self, id: AccountId, delta: Decimal) -> Result<Account>;

    /// Append an immutable entry.
    async fn create_entry(&mut self, entry: NewEntry) -> Result<Entry>;

    /// Append an immutable transaction record.
    async fn create_transaction(&mut self, transaction: NewTransaction) -> Result<Transaction>;

    /// Point lookup of a transaction, including ones written by this unit of work.
    async fn get_transaction(&mut self, id: TransactionId) -> Result<Transaction>;

    /// Point lookup of an entry, including ones written by this unit of work.
    async fn get_entry(&mut self, id: EntryId) -> Result<Entry>;
}

/// An open unit of work.
///
/// Dropping it without calling [`commit`](LedgerTx::commit) rolls it back.
#[async_trait]
pub trait LedgerTx: LedgerStore {
    /// View this unit of work as a plain store handle.
    fn store(&mut self) -> &mut dyn LedgerStore;

    /// Make every write visible and release all row locks.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every write and release all row locks.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Pagination window for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self {
            limit: limit.max(0),
            offset: offset.max(0),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(50, 0)
    }
}

/// Backing storage for accounts, entries and transactions.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Open a new unit of work.
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;

    /// Read a committed account.
    async fn get_account(&self, id: AccountId) -> Result<Account>;

    /// Resolve an account by its public identifier.
    async fn get_account_by_public_id(&self, public_id: Uuid) -> Result<Account>;

    /// Read a committed transaction.
    async fn get_transaction(&self, id: TransactionId) -> Result<Transaction>;

    /// Read a committed entry.
    async fn get_entry(&self, id: EntryId) -> Result<Entry>;

    /// Entries posted against an account, oldest first.
    async fn list_entries(&self, account_id: AccountId, page: Page) -> Result<Vec<Entry>>;

    /// The entries written by one transaction, oldest first.
    async fn list_transaction_entries(&self, transaction_id: TransactionId) -> Result<Vec<Entry>>;

    /// Transactions where the account is payer or payee, oldest first.
    async fn list_transactions(&self, account_id: AccountId, page: Page) -> Result<Vec<Transaction>>;
}
