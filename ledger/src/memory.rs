//! In-memory ledger.
//!
//! Mirrors the row-locking behaviour of the PostgreSQL adapter closely enough
//! for the engine's concurrency tests and the simulator: a locked fetch holds
//! a per-account lock until the unit of work ends, lock waits are bounded,
//! and writes stay private to the unit of work until it commits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use ledgerflow_common::{AccountId, EntryId, LedgerError, Result, TransactionId};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::account::{Account, NewAccount};
use crate::journal::{Entry, NewEntry, NewTransaction, Transaction};
use crate::store::{Ledger, LedgerStore, LedgerTx, Page};

/// Memory ledger configuration.
#[derive(Debug, Clone)]
pub struct MemoryLedgerConfig {
    /// How long a locked fetch waits before giving up with `Conflict`.
    pub lock_wait_timeout: Duration,
}

impl Default for MemoryLedgerConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout: Duration::from_secs(5),
        }
    }
}

struct AccountSlot {
    row_lock: Arc<Mutex<()>>,
    committed: RwLock<Account>,
}

struct Shared {
    config: MemoryLedgerConfig,
    accounts: DashMap<AccountId, Arc<AccountSlot>>,
    public_ids: DashMap<Uuid, AccountId>,
    transactions: DashMap<TransactionId, Transaction>,
    entries: DashMap<EntryId, Entry>,
    next_account_id: AtomicI64,
    next_transaction_id: AtomicI64,
    next_entry_id: AtomicI64,
    offline: AtomicBool,
    fail_next_commit: AtomicBool,
    fail_next_rollback: AtomicBool,
}

impl Shared {
    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LedgerError::ConnectionError(
                "ledger storage is unreachable".to_string(),
            ));
        }
        Ok(())
    }

    fn slot(&self, id: AccountId) -> Option<Arc<AccountSlot>> {
        self.accounts.get(&id).map(|slot| Arc::clone(slot.value()))
    }

    async fn lock_row(&self, id: AccountId) -> Result<(Arc<AccountSlot>, OwnedMutexGuard<()>)> {
        let slot = self
            .slot(id)
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))?;

        let guard = tokio::time::timeout(
            self.config.lock_wait_timeout,
            Arc::clone(&slot.row_lock).lock_owned(),
        )
        .await
        .map_err(|_| {
            LedgerError::Conflict(format!(
                "lock wait timeout on account {id} after {} ms",
                self.config.lock_wait_timeout.as_millis()
            ))
        })?;

        Ok((slot, guard))
    }

    fn committed_account(&self, id: AccountId) -> Result<Account> {
        let account = self
            .slot(id)
            .map(|slot| slot.committed.read().clone())
            .filter(Account::is_active);
        account.ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))
    }
}

/// In-process [`Ledger`] backed by concurrent maps.
///
/// Cloning is cheap; clones share the same storage.
#[derive(Clone)]
pub struct MemoryLedger {
    shared: Arc<Shared>,
}

impl MemoryLedger {
    /// Create an empty ledger with default settings.
    pub fn new() -> Self {
        Self::with_config(MemoryLedgerConfig::default())
    }

    /// Create an empty ledger.
    pub fn with_config(config: MemoryLedgerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                accounts: DashMap::new(),
                public_ids: DashMap::new(),
                transactions: DashMap::new(),
                entries: DashMap::new(),
                next_account_id: AtomicI64::new(1),
                next_transaction_id: AtomicI64::new(1),
                next_entry_id: AtomicI64::new(1),
                offline: AtomicBool::new(false),
                fail_next_commit: AtomicBool::new(false),
                fail_next_rollback: AtomicBool::new(false),
            }),
        }
    }

    /// Open an account. Committed immediately.
    pub fn open_account(&self, new: NewAccount) -> Result<Account> {
        self.shared.ensure_online()?;
        if !new.currency.is_valid() {
            return Err(LedgerError::InvalidRequest(format!(
                "invalid currency code '{}'",
                new.currency
            )));
        }
        if new.balance < Decimal::ZERO {
            return Err(LedgerError::ConstraintViolation(
                "accounts_balance_check".to_string(),
            ));
        }

        let id = AccountId::new(self.shared.next_account_id.fetch_add(1, Ordering::SeqCst));
        let account = Account {
            id,
            public_id: Uuid::now_v7(),
            owner: new.owner,
            currency: new.currency,
            balance: new.balance,
            created_at: Utc::now(),
            updated_at: None,
            deleted_at: None,
        };

        self.shared.public_ids.insert(account.public_id, id);
        self.shared.accounts.insert(
            id,
            Arc::new(AccountSlot {
                row_lock: Arc::new(Mutex::new(())),
                committed: RwLock::new(account.clone()),
            }),
        );

        debug!(account_id = %id, owner = %account.owner, "Opened account");
        Ok(account)
    }

    /// Mark an account deleted. Waits for its row lock like any writer.
    pub async fn soft_delete_account(&self, id: AccountId) -> Result<()> {
        self.shared.ensure_online()?;
        let (slot, _guard) = self.shared.lock_row(id).await?;

        let mut account = slot.committed.write();
        if !account.is_active() {
            return Err(LedgerError::AccountNotFound(id.to_string()));
        }
        account.deleted_at = Some(Utc::now());
        Ok(())
    }

    /// Simulate losing (or regaining) the storage connection.
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, Ordering::SeqCst);
    }

    /// Make the next commit fail with `ConnectionError`.
    pub fn fail_next_commit(&self) {
        self.shared.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Make the next rollback fail with `ConnectionError`.
    pub fn fail_next_rollback(&self) {
        self.shared.fail_next_rollback.store(true, Ordering::SeqCst);
    }

    /// Committed, active accounts ordered by id.
    pub fn accounts(&self) -> Vec<Account> {
        let mut accounts: Vec<Account> = self
            .shared
            .accounts
            .iter()
            .map(|slot| slot.committed.read().clone())
            .filter(Account::is_active)
            .collect();
        accounts.sort_by_key(|a| a.id);
        accounts
    }

    /// Number of committed transaction records.
    pub fn transaction_count(&self) -> usize {
        self.shared.transactions.len()
    }

    /// Number of committed entries.
    pub fn entry_count(&self) -> usize {
        self.shared.entries.len()
    }

    /// Committed transactions ordered by id.
    pub fn transactions(&self) -> Vec<Transaction> {
        let mut transactions: Vec<Transaction> = self
            .shared
            .transactions
            .iter()
            .map(|t| t.value().clone())
            .collect();
        transactions.sort_by_key(|t| t.id);
        transactions
    }

    fn collect_entries(&self, keep: impl Fn(&Entry) -> bool) -> Vec<Entry> {
        let mut entries: Vec<Entry> = self
            .shared
            .entries
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by_key(|e| e.id);
        entries
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn paginate<T>(items: Vec<T>, page: Page) -> Vec<T> {
    items
        .into_iter()
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .collect()
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        self.shared.ensure_online()?;
        Ok(Box::new(MemoryLedgerTx {
            shared: Arc::clone(&self.shared),
            locked: HashMap::new(),
            transactions: Vec::new(),
            entries: Vec::new(),
        }))
    }

    async fn get_account(&self, id: AccountId) -> Result<Account> {
        self.shared.ensure_online()?;
        self.shared.committed_account(id)
    }

    async fn get_account_by_public_id(&self, public_id: Uuid) -> Result<Account> {
        self.shared.ensure_online()?;
        let id = self
            .shared
            .public_ids
            .get(&public_id)
            .map(|id| *id.value())
            .ok_or_else(|| LedgerError::AccountNotFound(public_id.to_string()))?;
        self.shared.committed_account(id)
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Transaction> {
        self.shared.ensure_online()?;
        self.shared
            .transactions
            .get(&id)
            .map(|t| t.value().clone())
            .ok_or(LedgerError::TransactionNotFound(id))
    }

    async fn get_entry(&self, id: EntryId) -> Result<Entry> {
        self.shared.ensure_online()?;
        self.shared
            .entries
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(LedgerError::EntryNotFound(id))
    }

    async fn list_entries(&self, account_id: AccountId, page: Page) -> Result<Vec<Entry>> {
        self.shared.ensure_online()?;
        Ok(paginate(
            self.collect_entries(|e| e.account_id == account_id),
            page,
        ))
    }

    async fn list_transaction_entries(&self, transaction_id: TransactionId) -> Result<Vec<Entry>> {
        self.shared.ensure_online()?;
        Ok(self.collect_entries(|e| e.transaction_id == transaction_id))
    }

    async fn list_transactions(&self, account_id: AccountId, page: Page) -> Result<Vec<Transaction>> {
        self.shared.ensure_online()?;
        let involved = self
            .transactions()
            .into_iter()
            .filter(|t| t.from_account_id == account_id || t.to_account_id == account_id)
            .collect();
        Ok(paginate(involved, page))
    }
}

struct LockedRow {
    _guard: OwnedMutexGuard<()>,
    slot: Arc<AccountSlot>,
    working: Account,
}

/// Open unit of work on a [`MemoryLedger`].
///
/// Holds the row lock of every account it has fetched for update. Dropping it
/// releases the locks and discards staged writes.
pub struct MemoryLedgerTx {
    shared: Arc<Shared>,
    locked: HashMap<AccountId, LockedRow>,
    transactions: Vec<Transaction>,
    entries: Vec<Entry>,
}

impl MemoryLedgerTx {
    fn account_exists(&self, id: AccountId) -> bool {
        self.locked.contains_key(&id) || self.shared.accounts.contains_key(&id)
    }

    fn transaction_exists(&self, id: TransactionId) -> bool {
        self.transactions.iter().any(|t| t.id == id) || self.shared.transactions.contains_key(&id)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerTx {
    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account> {
        self.shared.ensure_online()?;

        // Row locks are re-entrant within one unit of work.
        if let Some(row) = self.locked.get(&id) {
            return Ok(row.working.clone());
        }

        let (slot, guard) = self.shared.lock_row(id).await?;
        let account = slot.committed.read().clone();
        if !account.is_active() {
            return Err(LedgerError::AccountNotFound(id.to_string()));
        }

        trace!(account_id = %id, "Row lock acquired");
        self.locked.insert(
            id,
            LockedRow {
                _guard: guard,
                slot,
                working: account.clone(),
            },
        );
        Ok(account)
    }

    async fn add_account_balance(&mut self, id: AccountId, delta: Decimal) -> Result<Account> {
        self.shared.ensure_online()?;

        // An UPDATE takes the row lock implicitly.
        if !self.locked.contains_key(&id) {
            self.get_account_for_update(id).await?;
        }
        let row = self
            .locked
            .get_mut(&id)
            .ok_or_else(|| LedgerError::InternalError(format!("row lock on {id} lost")))?;

        let balance = row.working.balance + delta;
        if balance < Decimal::ZERO {
            return Err(LedgerError::InsufficientFunds {
                account_id: id,
                available: row.working.balance,
                required: delta.abs(),
            });
        }

        row.working.balance = balance;
        row.working.updated_at = Some(Utc::now());
        Ok(row.working.clone())
    }

    async fn create_entry(&mut self, entry: NewEntry) -> Result<Entry> {
        self.shared.ensure_online()?;
        if !self.account_exists(entry.account_id) {
            return Err(LedgerError::ConstraintViolation(
                "entries_account_id_fkey".to_string(),
            ));
        }
        if !self.transaction_exists(entry.transaction_id) {
            return Err(LedgerError::ConstraintViolation(
                "entries_transaction_id_fkey".to_string(),
            ));
        }
        if entry.amount <= Decimal::ZERO {
            return Err(LedgerError::ConstraintViolation(
                "entries_amount_check".to_string(),
            ));
        }

        let entry = Entry {
            id: EntryId::new(self.shared.next_entry_id.fetch_add(1, Ordering::SeqCst)),
            transaction_id: entry.transaction_id,
            account_id: entry.account_id,
            kind: entry.kind,
            amount: entry.amount,
            created_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    async fn create_transaction(&mut self, transaction: NewTransaction) -> Result<Transaction> {
        self.shared.ensure_online()?;
        if !self.account_exists(transaction.from_account_id) {
            return Err(LedgerError::ConstraintViolation(
                "transactions_from_account_id_fkey".to_string(),
            ));
        }
        if !self.account_exists(transaction.to_account_id) {
            return Err(LedgerError::ConstraintViolation(
                "transactions_to_account_id_fkey".to_string(),
            ));
        }
        if transaction.amount <= Decimal::ZERO {
            return Err(LedgerError::ConstraintViolation(
                "transactions_amount_check".to_string(),
            ));
        }

        let transaction = Transaction {
            id: TransactionId::new(self.shared.next_transaction_id.fetch_add(1, Ordering::SeqCst)),
            public_id: Uuid::now_v7(),
            from_account_id: transaction.from_account_id,
            to_account_id: transaction.to_account_id,
            amount: transaction.amount,
            transfer_type: transaction.transfer_type,
            created_at: Utc::now(),
        };
        self.transactions.push(transaction.clone());
        Ok(transaction)
    }

    async fn get_transaction(&mut self, id: TransactionId) -> Result<Transaction> {
        self.shared.ensure_online()?;
        if let Some(transaction) = self.transactions.iter().find(|t| t.id == id) {
            return Ok(transaction.clone());
        }
        self.shared
            .transactions
            .get(&id)
            .map(|t| t.value().clone())
            .ok_or(LedgerError::TransactionNotFound(id))
    }

    async fn get_entry(&mut self, id: EntryId) -> Result<Entry> {
        self.shared.ensure_online()?;
        if let Some(entry) = self.entries.iter().find(|e| e.id == id) {
            return Ok(entry.clone());
        }
        self.shared
            .entries
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(LedgerError::EntryNotFound(id))
    }
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    fn store(&mut self) -> &mut dyn LedgerStore {
        self
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.shared.ensure_online()?;
        if self.shared.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::ConnectionError(
                "connection reset during commit".to_string(),
            ));
        }

        let MemoryLedgerTx {
            shared,
            locked,
            transactions,
            entries,
        } = *self;

        // Publish under the row locks; guards drop with `locked` afterwards.
        for row in locked.values() {
            *row.slot.committed.write() = row.working.clone();
        }
        for transaction in transactions {
            shared.transactions.insert(transaction.id, transaction);
        }
        for entry in entries {
            shared.entries.insert(entry.id, entry);
        }

        trace!(rows = locked.len(), "Memory unit of work committed");
        drop(locked);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.shared.ensure_online()?;
        if self.shared.fail_next_rollback.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::ConnectionError(
                "connection reset during rollback".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::EntryKind;
    use ledgerflow_common::Currency;

    fn open(ledger: &MemoryLedger, owner: &str, balance: i64) -> Account {
        ledger
            .open_account(NewAccount::new(owner, Currency::usd(), Decimal::from(balance)))
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_and_lookup() {
        let ledger = MemoryLedger::new();
        let account = open(&ledger, "alice", 100);

        assert_eq!(ledger.get_account(account.id).await.unwrap(), account);
        assert_eq!(
            ledger.get_account_by_public_id(account.public_id).await.unwrap().id,
            account.id
        );
        assert!(ledger
            .get_account(AccountId::new(999))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_open_rejects_negative_balance() {
        let ledger = MemoryLedger::new();
        let err = ledger
            .open_account(NewAccount::new("bob", Currency::usd(), Decimal::from(-1)))
            .unwrap_err();
        assert!(matches!(err, LedgerError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn test_staged_writes_invisible_until_commit() {
        let ledger = MemoryLedger::new();
        let account = open(&ledger, "alice", 100);

        let mut tx = ledger.begin().await.unwrap();
        let updated = tx.add_account_balance(account.id, Decimal::from(-40)).await.unwrap();
        assert_eq!(updated.balance, Decimal::from(60));
        assert_eq!(
            ledger.get_account(account.id).await.unwrap().balance,
            Decimal::from(100)
        );

        tx.commit().await.unwrap();
        assert_eq!(
            ledger.get_account(account.id).await.unwrap().balance,
            Decimal::from(60)
        );
    }

    #[tokio::test]
    async fn test_dropped_tx_discards_writes_and_releases_lock() {
        let ledger = MemoryLedger::new();
        let account = open(&ledger, "alice", 100);

        {
            let mut tx = ledger.begin().await.unwrap();
            let transaction = tx
                .create_transaction(NewTransaction {
                    from_account_id: account.id,
                    to_account_id: account.id,
                    amount: Decimal::ONE,
                    transfer_type: "transfer".to_string(),
                })
                .await
                .unwrap();
            tx.create_entry(NewEntry::debit(transaction.id, account.id, Decimal::ONE))
                .await
                .unwrap();
            tx.add_account_balance(account.id, Decimal::from(-1)).await.unwrap();
        }

        assert_eq!(ledger.transaction_count(), 0);
        assert_eq!(ledger.entry_count(), 0);

        let mut tx = ledger.begin().await.unwrap();
        let locked = tx.get_account_for_update(account.id).await.unwrap();
        assert_eq!(locked.balance, Decimal::from(100));
    }

    #[tokio::test]
    async fn test_negative_balance_rejected_by_store() {
        let ledger = MemoryLedger::new();
        let account = open(&ledger, "alice", 10);

        let mut tx = ledger.begin().await.unwrap();
        let err = tx
            .add_account_balance(account.id, Decimal::from(-11))
            .await
            .unwrap_err();
        match err {
            LedgerError::InsufficientFunds {
                available, required, ..
            } => {
                assert_eq!(available, Decimal::from(10));
                assert_eq!(required, Decimal::from(11));
            }
            other => panic!("expected InsufficientFunds, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_foreign_keys_enforced() {
        let ledger = MemoryLedger::new();
        let account = open(&ledger, "alice", 10);

        let mut tx = ledger.begin().await.unwrap();
        let err = tx
            .create_entry(NewEntry::credit(TransactionId::new(42), account.id, Decimal::ONE))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ConstraintViolation(_)));

        let err = tx
            .create_transaction(NewTransaction {
                from_account_id: account.id,
                to_account_id: AccountId::new(77),
                amount: Decimal::ONE,
                transfer_type: "transfer".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn test_reads_inside_tx_see_own_writes() {
        let ledger = MemoryLedger::new();
        let a = open(&ledger, "alice", 10);
        let b = open(&ledger, "bob", 10);

        let mut tx = ledger.begin().await.unwrap();
        let transaction = tx
            .create_transaction(NewTransaction {
                from_account_id: a.id,
                to_account_id: b.id,
                amount: Decimal::ONE,
                transfer_type: "transfer".to_string(),
            })
            .await
            .unwrap();
        let entry = tx
            .create_entry(NewEntry::credit(transaction.id, b.id, Decimal::ONE))
            .await
            .unwrap();

        assert_eq!(tx.get_transaction(transaction.id).await.unwrap(), transaction);
        assert_eq!(tx.get_entry(entry.id).await.unwrap().kind, EntryKind::Credit);
        assert!(ledger.get_transaction(transaction.id).await.is_err());
    }

    #[tokio::test]
    async fn test_lock_wait_timeout_is_a_conflict() {
        let ledger = MemoryLedger::with_config(MemoryLedgerConfig {
            lock_wait_timeout: Duration::from_millis(20),
        });
        let account = open(&ledger, "alice", 10);

        let mut holder = ledger.begin().await.unwrap();
        holder.get_account_for_update(account.id).await.unwrap();

        let mut waiter = ledger.begin().await.unwrap();
        let err = waiter.get_account_for_update(account.id).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_soft_deleted_account_is_not_found() {
        let ledger = MemoryLedger::new();
        let account = open(&ledger, "alice", 10);
        ledger.soft_delete_account(account.id).await.unwrap();

        assert!(ledger.get_account(account.id).await.unwrap_err().is_not_found());
        assert!(ledger.accounts().is_empty());

        let mut tx = ledger.begin().await.unwrap();
        assert!(tx
            .get_account_for_update(account.id)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_offline_storage() {
        let ledger = MemoryLedger::new();
        let account = open(&ledger, "alice", 10);
        let mut tx = ledger.begin().await.unwrap();

        ledger.set_offline(true);
        assert!(matches!(
            tx.get_account_for_update(account.id).await,
            Err(LedgerError::ConnectionError(_))
        ));
        assert!(matches!(
            ledger.get_account(account.id).await,
            Err(LedgerError::ConnectionError(_))
        ));

        ledger.set_offline(false);
        assert!(ledger.get_account(account.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_pagination() {
        let ledger = MemoryLedger::new();
        let a = open(&ledger, "alice", 100);
        let b = open(&ledger, "bob", 0);

        for _ in 0..3 {
            let mut tx = ledger.begin().await.unwrap();
            let t = tx
                .create_transaction(NewTransaction {
                    from_account_id: a.id,
                    to_account_id: b.id,
                    amount: Decimal::ONE,
                    transfer_type: "transfer".to_string(),
                })
                .await
                .unwrap();
            tx.create_entry(NewEntry::debit(t.id, a.id, Decimal::ONE)).await.unwrap();
            tx.create_entry(NewEntry::credit(t.id, b.id, Decimal::ONE)).await.unwrap();
            tx.commit().await.unwrap();
        }

        let page = ledger.list_entries(a.id, Page::new(2, 1)).await.unwrap();
        assert_eq!(page.len(), 2);
        assert!(page.iter().all(|e| e.kind == EntryKind::Debit));
        assert_eq!(ledger.list_transactions(b.id, Page::default()).await.unwrap().len(), 3);

        let first = ledger.transactions()[0].id;
        assert_eq!(ledger.list_transaction_entries(first).await.unwrap().len(), 2);
    }
}
