//! Ledgerflow Service
//!
//! The caller layer around the transfer engine: configuration, request
//! checks and authorization, bounded retry of storage conflicts, and metrics.

pub mod config;
pub mod metrics;
pub mod retry;
pub mod transfer_service;

pub use config::{RetryConfig, ServiceConfig};
pub use metrics::{InFlightTransfer, Metrics, MetricsSnapshot, SharedMetrics};
pub use retry::RetryPolicy;
pub use transfer_service::{
    Principal, Role, TransferReceipt, TransferRequest, TransferService, TRANSFER_TYPE,
};
