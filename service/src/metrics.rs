//! Metrics collection for transfer monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Transfer service metrics.
pub struct Metrics {
    /// Total transfers requested.
    pub transfers_total: AtomicU64,
    /// Committed transfers.
    pub transfers_succeeded: AtomicU64,
    /// Transfers refused for a client-correctable reason.
    pub transfers_rejected: AtomicU64,
    /// Transfers that failed on a storage or internal error.
    pub transfers_failed: AtomicU64,
    /// Transfers in progress.
    pub transfers_active: AtomicU64,
    /// Storage conflicts (deadlock, serialization failure, lock timeout).
    pub conflicts: AtomicU64,
    /// Retried attempts.
    pub retries: AtomicU64,
    /// Rollbacks that failed after a transfer error.
    pub rollback_failures: AtomicU64,
    /// Transfers dropped by their caller before an outcome was known.
    pub transfers_cancelled: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            transfers_total: AtomicU64::new(0),
            transfers_succeeded: AtomicU64::new(0),
            transfers_rejected: AtomicU64::new(0),
            transfers_failed: AtomicU64::new(0),
            transfers_active: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            rollback_failures: AtomicU64::new(0),
            transfers_cancelled: AtomicU64::new(0),
        }
    }

    /// Count a transfer as started and in flight.
    ///
    /// The returned guard settles the outcome. If it is dropped unsettled,
    /// the transfer is counted as cancelled. Either way the in-flight gauge
    /// is released.
    pub fn transfer_started(&self) -> InFlightTransfer<'_> {
        self.transfers_total.fetch_add(1, Ordering::Relaxed);
        self.transfers_active.fetch_add(1, Ordering::Relaxed);
        InFlightTransfer {
            metrics: self,
            settled: false,
        }
    }

    /// Record a storage conflict.
    pub fn conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a retried attempt.
    pub fn retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed rollback.
    pub fn rollback_failure(&self) {
        self.rollback_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transfers_total: self.transfers_total.load(Ordering::Relaxed),
            transfers_succeeded: self.transfers_succeeded.load(Ordering::Relaxed),
            transfers_rejected: self.transfers_rejected.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            transfers_active: self.transfers_active.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            rollback_failures: self.rollback_failures.load(Ordering::Relaxed),
            transfers_cancelled: self.transfers_cancelled.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            r#"# HELP ledgerflow_transfers_total Total number of transfers
# TYPE ledgerflow_transfers_total counter
ledgerflow_transfers_total {}

# HELP ledgerflow_transfers_succeeded Total committed transfers
# TYPE ledgerflow_transfers_succeeded counter
ledgerflow_transfers_succeeded {}

# HELP ledgerflow_transfers_rejected Total transfers rejected by a business rule
# TYPE ledgerflow_transfers_rejected counter
ledgerflow_transfers_rejected {}

# HELP ledgerflow_transfers_failed Total transfers failed on storage or internal errors
# TYPE ledgerflow_transfers_failed counter
ledgerflow_transfers_failed {}

# HELP ledgerflow_transfers_cancelled Total transfers dropped by the caller
# TYPE ledgerflow_transfers_cancelled counter
ledgerflow_transfers_cancelled {}

# HELP ledgerflow_transfers_active Current transfers in progress
# TYPE ledgerflow_transfers_active gauge
ledgerflow_transfers_active {}

# HELP ledgerflow_storage_conflicts Total storage conflicts
# TYPE ledgerflow_storage_conflicts counter
ledgerflow_storage_conflicts {}

# HELP ledgerflow_transfer_retries Total retried transfer attempts
# TYPE ledgerflow_transfer_retries counter
ledgerflow_transfer_retries {}

# HELP ledgerflow_rollback_failures Total failed rollbacks
# TYPE ledgerflow_rollback_failures counter
ledgerflow_rollback_failures {}
"#,
            snapshot.transfers_total,
            snapshot.transfers_succeeded,
            snapshot.transfers_rejected,
            snapshot.transfers_failed,
            snapshot.transfers_cancelled,
            snapshot.transfers_active,
            snapshot.conflicts,
            snapshot.retries,
            snapshot.rollback_failures,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub transfers_total: u64,
    pub transfers_succeeded: u64,
    pub transfers_rejected: u64,
    pub transfers_failed: u64,
    pub transfers_active: u64,
    pub conflicts: u64,
    pub retries: u64,
    pub rollback_failures: u64,
    pub transfers_cancelled: u64,
}

/// One transfer in flight. Holds the active gauge until dropped.
#[must_use = "dropping the guard immediately counts the transfer as cancelled"]
pub struct InFlightTransfer<'a> {
    metrics: &'a Metrics,
    settled: bool,
}

impl InFlightTransfer<'_> {
    /// Record transfer success.
    pub fn succeeded(self) {
        let metrics = self.metrics;
        self.settle(&metrics.transfers_succeeded);
    }

    /// Record transfer rejection.
    pub fn rejected(self) {
        let metrics = self.metrics;
        self.settle(&metrics.transfers_rejected);
    }

    /// Record transfer failure.
    pub fn failed(self) {
        let metrics = self.metrics;
        self.settle(&metrics.transfers_failed);
    }

    fn settle(mut self, outcome: &AtomicU64) {
        outcome.fetch_add(1, Ordering::Relaxed);
        self.settled = true;
    }
}

impl Drop for InFlightTransfer<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.metrics.transfers_cancelled.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.transfers_active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;
