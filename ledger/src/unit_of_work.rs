//! Unit-of-work executor.
//!
//! Delimits atomicity: every store call made by the work closure runs inside
//! one storage transaction that is either committed as a whole or rolled back.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use ledgerflow_common::{LedgerError, Result};
use tracing::{debug, error};

use crate::store::{Ledger, LedgerStore};

/// Runs closures inside a single storage transaction.
pub struct UnitOfWork {
    ledger: Arc<dyn Ledger>,
    timeout: Duration,
}

impl UnitOfWork {
    /// Create an executor whose units of work are bounded by `timeout`.
    pub fn new(ledger: Arc<dyn Ledger>, timeout: Duration) -> Self {
        Self { ledger, timeout }
    }

    /// Backing storage.
    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Deadline applied to each unit of work.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `work` against a store handle bound to a fresh transaction.
    ///
    /// On success the transaction is committed and a commit failure is
    /// returned as the result. On failure, or when the deadline passes, the
    /// transaction is rolled back. If that rollback fails too, both errors are
    /// returned together as [`LedgerError::RollbackFailed`].
    ///
    /// Dropping the returned future drops the open transaction, which the
    /// adapters roll back.
    pub async fn run<T, F>(&self, work: F) -> Result<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut dyn LedgerStore) -> BoxFuture<'t, Result<T>> + Send,
    {
        let mut tx = self.ledger.begin().await?;

        let outcome = tokio::time::timeout(self.timeout, work(tx.store())).await;
        let outcome = match outcome {
            Ok(result) => result,
            Err(_) => Err(LedgerError::Timeout(format!(
                "unit of work exceeded {} ms",
                self.timeout.as_millis()
            ))),
        };

        match outcome {
            Ok(value) => {
                tx.commit().await?;
                debug!("Unit of work committed");
                Ok(value)
            }
            Err(cause) => match tx.rollback().await {
                Ok(()) => {
                    debug!(error = %cause, "Unit of work rolled back");
                    Err(cause)
                }
                Err(rollback) => {
                    error!(
                        cause = %cause,
                        rollback_error = %rollback,
                        "Rollback failed after unit of work error"
                    );
                    Err(LedgerError::RollbackFailed {
                        cause: Box::new(cause),
                        rollback: Box::new(rollback),
                    })
                }
            },
        }
    }
}
