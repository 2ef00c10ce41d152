//! PostgreSQL ledger adapter.
//!
//! Row locks come from `SELECT ... FOR UPDATE`; balance changes are a single
//! conditional `balance = balance + $delta` statement so the database, not
//! the application, performs the read-modify-write. Every transaction sets
//! `statement_timeout` and `lock_timeout` locally so a stalled unit of work
//! is always aborted by the server.

use std::time::Duration;

use async_trait::async_trait;
use ledgerflow_common::{AccountId, Currency, EntryId, LedgerError, Result, TransactionId};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::account::{Account, NewAccount};
use crate::journal::{Entry, EntryKind, NewEntry, NewTransaction, Transaction};
use crate::store::{Ledger, LedgerStore, LedgerTx, Page};

/// Reference DDL for the three ledger tables.
pub const SCHEMA: &str = include_str!("../sql/schema.sql");

const ACCOUNT_COLUMNS: &str =
    "id, public_id, owner, currency, balance, created_at, updated_at, deleted_at";
const TRANSACTION_COLUMNS: &str =
    "id, public_id, from_account_id, to_account_id, amount, transfer_type, created_at";
const ENTRY_COLUMNS: &str = "id, transaction_id, account_id, kind, amount, created_at";

/// PostgreSQL adapter configuration.
#[derive(Debug, Clone)]
pub struct PgLedgerConfig {
    /// Pool size.
    pub max_connections: u32,
    /// How long to wait for a pooled connection.
    pub acquire_timeout: Duration,
    /// Server-side bound on any single statement.
    pub statement_timeout: Duration,
    /// Server-side bound on waiting for a row lock.
    pub lock_timeout: Duration,
}

impl Default for PgLedgerConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            statement_timeout: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/// Milliseconds for a `SET LOCAL ..._timeout`. PostgreSQL reads 0 as no
/// timeout, so anything shorter than a millisecond rounds up to 1.
pub fn timeout_millis(timeout: Duration) -> u128 {
    timeout.as_millis().max(1)
}

/// Map a SQLSTATE code onto the ledger error taxonomy.
pub fn classify_sqlstate(code: Option<&str>, message: &str) -> LedgerError {
    let message = message.to_string();
    match code {
        // deadlock_detected, serialization_failure, lock_not_available
        Some("40P01") | Some("40001") | Some("55P03") => LedgerError::Conflict(message),
        // query_canceled, raised by statement_timeout
        Some("57014") => LedgerError::Timeout(message),
        Some(code) if code.starts_with("23") => LedgerError::ConstraintViolation(message),
        Some(code) if code.starts_with("08") => LedgerError::ConnectionError(message),
        _ => LedgerError::DatabaseError(message),
    }
}

/// Convert a sqlx error into a [`LedgerError`].
pub fn map_sqlx_error(err: sqlx::Error) -> LedgerError {
    match &err {
        sqlx::Error::Database(db) => classify_sqlstate(db.code().as_deref(), db.message()),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => LedgerError::ConnectionError(err.to_string()),
        _ => LedgerError::DatabaseError(err.to_string()),
    }
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name).map_err(map_sqlx_error)
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    Ok(Account {
        id: AccountId::new(column(row, "id")?),
        public_id: column(row, "public_id")?,
        owner: column(row, "owner")?,
        currency: Currency::new(column::<String>(row, "currency")?),
        balance: column(row, "balance")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
        deleted_at: column(row, "deleted_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    Ok(Transaction {
        id: TransactionId::new(column(row, "id")?),
        public_id: column(row, "public_id")?,
        from_account_id: AccountId::new(column(row, "from_account_id")?),
        to_account_id: AccountId::new(column(row, "to_account_id")?),
        amount: column(row, "amount")?,
        transfer_type: column(row, "transfer_type")?,
        created_at: column(row, "created_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<Entry> {
    Ok(Entry {
        id: EntryId::new(column(row, "id")?),
        transaction_id: TransactionId::new(column(row, "transaction_id")?),
        account_id: AccountId::new(column(row, "account_id")?),
        kind: column::<String>(row, "kind")?.parse::<EntryKind>()?,
        amount: column(row, "amount")?,
        created_at: column(row, "created_at")?,
    })
}

async fn fetch_account<'c, E>(executor: E, id: AccountId) -> Result<Account>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 AND deleted_at IS NULL");
    let row = sqlx::query(&sql)
        .bind(id.get())
        .fetch_optional(executor)
        .await
        .map_err(map_sqlx_error)?
        .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))?;
    account_from_row(&row)
}

async fn fetch_transaction<'c, E>(executor: E, id: TransactionId) -> Result<Transaction>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1");
    let row = sqlx::query(&sql)
        .bind(id.get())
        .fetch_optional(executor)
        .await
        .map_err(map_sqlx_error)?
        .ok_or(LedgerError::TransactionNotFound(id))?;
    transaction_from_row(&row)
}

async fn fetch_entry<'c, E>(executor: E, id: EntryId) -> Result<Entry>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = $1");
    let row = sqlx::query(&sql)
        .bind(id.get())
        .fetch_optional(executor)
        .await
        .map_err(map_sqlx_error)?
        .ok_or(LedgerError::EntryNotFound(id))?;
    entry_from_row(&row)
}

/// [`Ledger`] backed by a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
    config: PgLedgerConfig,
}

impl PgLedger {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool, config: PgLedgerConfig) -> Self {
        Self { pool, config }
    }

    /// Open a connection pool.
    pub async fn connect(database_url: &str, config: PgLedgerConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(database_url)
            .await
            .map_err(map_sqlx_error)?;

        info!(
            max_connections = config.max_connections,
            "PostgreSQL connection pool established"
        );
        Ok(Self::new(pool, config))
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open an account. Committed immediately.
    pub async fn create_account(&self, new: NewAccount) -> Result<Account> {
        if !new.currency.is_valid() {
            return Err(LedgerError::InvalidRequest(format!(
                "invalid currency code '{}'",
                new.currency
            )));
        }

        let sql = format!(
            "INSERT INTO accounts (public_id, owner, currency, balance) \
             VALUES ($1, $2, $3, $4) RETURNING {ACCOUNT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::now_v7())
            .bind(&new.owner)
            .bind(new.currency.code())
            .bind(new.balance)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        account_from_row(&row)
    }

    /// Mark an account deleted.
    pub async fn soft_delete_account(&self, id: AccountId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE accounts SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id.get())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::AccountNotFound(id.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        // SET does not take bind parameters.
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            timeout_millis(self.config.statement_timeout)
        ))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = {}",
            timeout_millis(self.config.lock_timeout)
        ))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        debug!("PostgreSQL transaction opened");
        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn get_account(&self, id: AccountId) -> Result<Account> {
        fetch_account(&self.pool, id).await
    }

    async fn get_account_by_public_id(&self, public_id: Uuid) -> Result<Account> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE public_id = $1 AND deleted_at IS NULL"
        );
        let row = sqlx::query(&sql)
            .bind(public_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| LedgerError::AccountNotFound(public_id.to_string()))?;
        account_from_row(&row)
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Transaction> {
        fetch_transaction(&self.pool, id).await
    }

    async fn get_entry(&self, id: EntryId) -> Result<Entry> {
        fetch_entry(&self.pool, id).await
    }

    async fn list_entries(&self, account_id: AccountId, page: Page) -> Result<Vec<Entry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE account_id = $1 \
             ORDER BY id LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(account_id.get())
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn list_transaction_entries(&self, transaction_id: TransactionId) -> Result<Vec<Entry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE transaction_id = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(transaction_id.get())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn list_transactions(&self, account_id: AccountId, page: Page) -> Result<Vec<Transaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE from_account_id = $1 OR to_account_id = $1 \
             ORDER BY id LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(account_id.get())
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(transaction_from_row).collect()
    }
}

/// Open PostgreSQL transaction.
///
/// sqlx issues `ROLLBACK` when this is dropped without a commit.
pub struct PgLedgerTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerStore for PgLedgerTx {
    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts \
             WHERE id = $1 AND deleted_at IS NULL FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| LedgerError::AccountNotFound(id.to_string()))?;
        account_from_row(&row)
    }

    async fn add_account_balance(&mut self, id: AccountId, delta: Decimal) -> Result<Account> {
        let sql = format!(
            "UPDATE accounts SET balance = balance + $2, updated_at = now() \
             WHERE id = $1 AND deleted_at IS NULL AND balance + $2 >= 0 \
             RETURNING {ACCOUNT_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.get())
            .bind(delta)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => account_from_row(&row),
            None => {
                // Either the row is gone or the guard rejected the delta.
                let current = fetch_account(&mut *self.tx, id).await?;
                Err(LedgerError::InsufficientFunds {
                    account_id: id,
                    available: current.balance,
                    required: delta.abs(),
                })
            }
        }
    }

    async fn create_entry(&mut self, entry: NewEntry) -> Result<Entry> {
        let sql = format!(
            "INSERT INTO entries (transaction_id, account_id, kind, amount) \
             VALUES ($1, $2, $3, $4) RETURNING {ENTRY_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(entry.transaction_id.get())
            .bind(entry.account_id.get())
            .bind(entry.kind.as_str())
            .bind(entry.amount)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        entry_from_row(&row)
    }

    async fn create_transaction(&mut self, transaction: NewTransaction) -> Result<Transaction> {
        let sql = format!(
            "INSERT INTO transactions (public_id, from_account_id, to_account_id, amount, transfer_type) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {TRANSACTION_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::now_v7())
            .bind(transaction.from_account_id.get())
            .bind(transaction.to_account_id.get())
            .bind(transaction.amount)
            .bind(&transaction.transfer_type)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        transaction_from_row(&row)
    }

    async fn get_transaction(&mut self, id: TransactionId) -> Result<Transaction> {
        fetch_transaction(&mut *self.tx, id).await
    }

    async fn get_entry(&mut self, id: EntryId) -> Result<Entry> {
        fetch_entry(&mut *self.tx, id).await
    }
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    fn store(&mut self) -> &mut dyn LedgerStore {
        self
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_millisecond_timeouts_never_disable() {
        assert_eq!(timeout_millis(Duration::from_micros(300)), 1);
        assert_eq!(timeout_millis(Duration::ZERO), 1);
        assert_eq!(timeout_millis(Duration::from_millis(1500)), 1500);
    }

    #[test]
    fn test_lock_errors_are_conflicts() {
        for code in ["40P01", "40001", "55P03"] {
            let err = classify_sqlstate(Some(code), "deadlock detected");
            assert!(err.is_retryable(), "{code} should be retryable");
        }
    }

    #[test]
    fn test_constraint_errors() {
        for code in ["23505", "23503", "23514"] {
            assert!(matches!(
                classify_sqlstate(Some(code), "violates constraint"),
                LedgerError::ConstraintViolation(_)
            ));
        }
    }

    #[test]
    fn test_other_sqlstates() {
        assert!(matches!(
            classify_sqlstate(Some("57014"), "canceling statement due to statement timeout"),
            LedgerError::Timeout(_)
        ));
        assert!(matches!(
            classify_sqlstate(Some("08006"), "connection failure"),
            LedgerError::ConnectionError(_)
        ));
        assert!(matches!(
            classify_sqlstate(Some("42P01"), "relation does not exist"),
            LedgerError::DatabaseError(_)
        ));
        assert!(matches!(
            classify_sqlstate(None, "unknown"),
            LedgerError::DatabaseError(_)
        ));
    }

    #[test]
    fn test_pool_errors_are_connection_errors() {
        assert!(matches!(
            map_sqlx_error(sqlx::Error::PoolTimedOut),
            LedgerError::ConnectionError(_)
        ));
        assert!(matches!(
            map_sqlx_error(sqlx::Error::RowNotFound),
            LedgerError::DatabaseError(_)
        ));
    }

    #[test]
    fn test_schema_defines_all_tables() {
        for table in ["accounts", "transactions", "entries"] {
            assert!(SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")));
        }
    }
}
