//! Transfer engine.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, instrument, warn};

use ledgerflow_common::{
    LedgerError, Result, TransactionId, TransferParams, TransferProgress, TransferState,
};

use crate::journal::{EntryKind, JournalBatch, NewEntry, NewTransaction, TransferResult};
use crate::ordering::{lock_order, ordered_legs};
use crate::store::{Ledger, LedgerStore};
use crate::unit_of_work::UnitOfWork;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline for one transfer's unit of work, lock waits included.
    pub transfer_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transfer_timeout: Duration::from_secs(10),
        }
    }
}

/// Moves funds between two accounts with double-entry bookkeeping.
///
/// Every transfer writes one transaction record, a debit entry on the payer,
/// a credit entry on the payee and both balance adjustments inside a single
/// unit of work. Account rows are always locked in ascending id order, so
/// concurrent transfers over the same pair cannot deadlock. The engine never
/// retries; a storage conflict is returned to the caller as is.
pub struct TransferEngine {
    uow: UnitOfWork,
}

impl TransferEngine {
    /// Create a new transfer engine.
    pub fn new(ledger: Arc<dyn Ledger>, config: EngineConfig) -> Self {
        Self {
            uow: UnitOfWork::new(ledger, config.transfer_timeout),
        }
    }

    /// Backing storage.
    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        self.uow.ledger()
    }

    /// Execute a transfer.
    #[instrument(
        skip(self, params),
        fields(
            from = %params.from_account_id,
            to = %params.to_account_id,
            amount = %params.amount
        )
    )]
    pub async fn transfer(&self, params: TransferParams) -> Result<TransferResult> {
        params.validate()?;

        let progress = Arc::new(Mutex::new(TransferProgress::new()));
        let tracker = Arc::clone(&progress);

        let outcome = self
            .uow
            .run(move |store| Box::pin(execute_transfer(store, params, tracker)))
            .await;

        let mut progress = progress.lock();
        match &outcome {
            Ok(result) => {
                if let Err(e) = progress.transition_to(TransferState::Committed) {
                    error!(error = %e, "Transfer committed from unexpected state");
                }
                info!(
                    transaction_id = %result.transaction.id,
                    lock_wait_ms = progress.lock_wait_ms().unwrap_or_default(),
                    duration_ms = progress.total_duration_ms().unwrap_or_default(),
                    "Transfer committed"
                );
            }
            Err(err) => {
                let stage = progress.state();
                if let Err(e) = progress.transition_to(TransferState::RolledBack) {
                    error!(error = %e, "Transfer rolled back from unexpected state");
                }
                if err.is_severe() {
                    error!(stage = ?stage, code = err.error_code(), error = %err, "Transfer rolled back");
                } else if err.is_client_error() {
                    info!(stage = ?stage, code = err.error_code(), error = %err, "Transfer rejected");
                } else {
                    warn!(stage = ?stage, code = err.error_code(), error = %err, "Transfer rolled back");
                }
            }
        }

        outcome
    }

    /// Audit a committed transfer against its journal entries.
    #[instrument(skip(self))]
    pub async fn verify_transaction(&self, id: TransactionId) -> Result<JournalBatch> {
        let ledger = self.ledger();
        let transaction = ledger.get_transaction(id).await?;
        let entries = ledger.list_transaction_entries(id).await?;

        let batch = JournalBatch::from_entries(id, entries);
        if let Err(e) = batch.verify(&transaction) {
            error!(error = %e, "Journal integrity check failed");
            return Err(e);
        }
        Ok(batch)
    }
}

fn advance(progress: &Mutex<TransferProgress>, next: TransferState) -> Result<()> {
    progress
        .lock()
        .transition_to(next)
        .map_err(|e| LedgerError::InternalError(e.to_string()))
}

async fn execute_transfer(
    store: &mut dyn LedgerStore,
    params: TransferParams,
    progress: Arc<Mutex<TransferProgress>>,
) -> Result<TransferResult> {
    let TransferParams {
        from_account_id: from,
        to_account_id: to,
        amount,
        transfer_type,
    } = params;

    // Lock both rows, smaller id first. Nothing has been written yet, so a
    // missing account leaves no trace.
    let (first, second) = lock_order(from, to);
    let first_account = store.get_account_for_update(first).await?;
    let second_account = if first == second {
        first_account.clone()
    } else {
        store.get_account_for_update(second).await?
    };
    advance(&progress, TransferState::AccountsLocked)?;

    let (payer, payee) = if first == from {
        (&first_account, &second_account)
    } else {
        (&second_account, &first_account)
    };
    if payer.currency != payee.currency {
        return Err(LedgerError::CurrencyMismatch {
            expected: payer.currency.clone(),
            actual: payee.currency.clone(),
        });
    }
    if !payer.has_sufficient_funds(amount) {
        return Err(LedgerError::InsufficientFunds {
            account_id: from,
            available: payer.balance,
            required: amount,
        });
    }

    let transaction = store
        .create_transaction(NewTransaction {
            from_account_id: from,
            to_account_id: to,
            amount,
            transfer_type,
        })
        .await?;
    let from_entry = store
        .create_entry(NewEntry::debit(transaction.id, from, amount))
        .await?;
    let to_entry = store
        .create_entry(NewEntry::credit(transaction.id, to, amount))
        .await?;
    advance(&progress, TransferState::LedgerWritten)?;

    let mut from_account = None;
    let mut to_account = None;
    for leg in ordered_legs(from, to, amount) {
        let updated = store.add_account_balance(leg.account_id, leg.delta).await?;
        match leg.kind {
            EntryKind::Debit => from_account = Some(updated),
            EntryKind::Credit => to_account = Some(updated),
        }
    }
    let (Some(from_account), Some(mut to_account)) = (from_account, to_account) else {
        return Err(LedgerError::InternalError(
            "balance legs incomplete".to_string(),
        ));
    };
    // A self-transfer debits last; both snapshots show the final row.
    if from == to {
        to_account = from_account.clone();
    }
    advance(&progress, TransferState::BalancesAdjusted)?;

    Ok(TransferResult {
        transaction,
        from_account,
        to_account,
        from_entry,
        to_entry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, NewAccount};
    use crate::memory::MemoryLedger;
    use ledgerflow_common::Currency;
    use rust_decimal::Decimal;

    fn setup(balances: &[(i64, &str)]) -> (MemoryLedger, TransferEngine, Vec<Account>) {
        let ledger = MemoryLedger::new();
        let accounts = balances
            .iter()
            .enumerate()
            .map(|(i, (balance, currency))| {
                ledger
                    .open_account(NewAccount::new(
                        format!("owner-{i}"),
                        Currency::new(*currency),
                        Decimal::from(*balance),
                    ))
                    .unwrap()
            })
            .collect();
        let engine = TransferEngine::new(Arc::new(ledger.clone()), EngineConfig::default());
        (ledger, engine, accounts)
    }

    #[tokio::test]
    async fn test_transfer_writes_full_result() {
        let (_, engine, accounts) = setup(&[(100, "USD"), (50, "USD")]);
        let (a, b) = (&accounts[0], &accounts[1]);

        let result = engine
            .transfer(TransferParams::new(a.id, b.id, Decimal::from(10)))
            .await
            .unwrap();

        assert_eq!(result.from_account.balance, Decimal::from(90));
        assert_eq!(result.to_account.balance, Decimal::from(60));
        assert_eq!(result.from_entry.kind, EntryKind::Debit);
        assert_eq!(result.from_entry.account_id, a.id);
        assert_eq!(result.to_entry.kind, EntryKind::Credit);
        assert_eq!(result.to_entry.account_id, b.id);
        assert_eq!(result.transaction.transfer_type, "transfer");

        let batch = engine.verify_transaction(result.transaction.id).await.unwrap();
        assert_eq!(batch.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_transfer_from_larger_id() {
        let (_, engine, accounts) = setup(&[(100, "USD"), (50, "USD")]);
        let (a, b) = (&accounts[0], &accounts[1]);

        let result = engine
            .transfer(TransferParams::new(b.id, a.id, Decimal::from(50)))
            .await
            .unwrap();

        assert_eq!(result.from_account.id, b.id);
        assert_eq!(result.from_account.balance, Decimal::ZERO);
        assert_eq!(result.to_account.balance, Decimal::from(150));
    }

    #[tokio::test]
    async fn test_self_transfer_keeps_balance() {
        let (ledger, engine, accounts) = setup(&[(30, "USD")]);
        let a = &accounts[0];

        let result = engine
            .transfer(TransferParams::new(a.id, a.id, Decimal::from(30)))
            .await
            .unwrap();

        assert_eq!(result.from_account.balance, Decimal::from(30));
        assert_eq!(result.to_account, result.from_account);
        assert_eq!(ledger.entry_count(), 2);
    }

    #[tokio::test]
    async fn test_currency_mismatch_rejected() {
        let (ledger, engine, accounts) = setup(&[(100, "USD"), (100, "EUR")]);

        let err = engine
            .transfer(TransferParams::new(accounts[0].id, accounts[1].id, Decimal::ONE))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::CurrencyMismatch { .. }));
        assert_eq!(ledger.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_amount_rejected_before_begin() {
        let (ledger, engine, accounts) = setup(&[(100, "USD"), (100, "USD")]);
        // Offline storage would fail `begin`; validation must come first.
        ledger.set_offline(true);

        let err = engine
            .transfer(TransferParams::new(accounts[0].id, accounts[1].id, Decimal::ZERO))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::InvalidAmount { .. }));
    }

    #[tokio::test]
    async fn test_verify_detects_missing_entries() {
        let (ledger, engine, accounts) = setup(&[(100, "USD"), (100, "USD")]);
        let (a, b) = (accounts[0].id, accounts[1].id);

        // A transaction record written without its entries.
        let mut tx = ledger.begin().await.unwrap();
        let transaction = tx
            .create_transaction(NewTransaction {
                from_account_id: a,
                to_account_id: b,
                amount: Decimal::ONE,
                transfer_type: "transfer".to_string(),
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let err = engine.verify_transaction(transaction.id).await.unwrap_err();
        assert!(matches!(err, LedgerError::IntegrityViolation(_)));
        assert!(engine
            .verify_transaction(TransactionId::new(999))
            .await
            .unwrap_err()
            .is_not_found());
    }
}
