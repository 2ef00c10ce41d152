//! Error types for ledger operations.

use crate::{AccountId, Currency, EntryId, TransactionId};
use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for ledger and transfer operations.
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    /// Transfer amount is zero or negative.
    #[error("Invalid amount: {amount} (must be greater than zero)")]
    InvalidAmount { amount: Decimal },

    /// Request is malformed in some other way.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Referenced account does not exist (or is soft-deleted).
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Transaction record not found.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// Entry not found.
    #[error("Entry not found: {0}")]
    EntryNotFound(EntryId),

    /// Balance would go negative.
    #[error("Insufficient funds in account {account_id}: available {available}, required {required}")]
    InsufficientFunds {
        account_id: AccountId,
        available: Decimal,
        required: Decimal,
    },

    /// Accounts (or request) disagree on currency.
    #[error("Currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: Currency, actual: Currency },

    /// Source and destination are the same account.
    #[error("Cannot transfer to the same account")]
    SameAccount,

    /// Principal may not move funds out of the account.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Storage detected a deadlock, serialization failure or lock wait timeout.
    #[error("Storage conflict: {0}")]
    Conflict(String),

    /// Uniqueness, foreign key or check constraint violated.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Storage is unreachable.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Unit of work exceeded its deadline.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Any other storage error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Work failed and the rollback failed as well.
    #[error("Transfer failed ({cause}) and rollback failed ({rollback})")]
    RollbackFailed {
        cause: Box<LedgerError>,
        rollback: Box<LedgerError>,
    },

    /// A committed transfer does not satisfy double-entry invariants.
    #[error("Ledger integrity violation: {0}")]
    IntegrityViolation(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl LedgerError {
    /// Check if the caller may retry the whole unit of work.
    ///
    /// Only storage-detected conflicts qualify; business-rule failures such as
    /// insufficient funds are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }

    /// Check if this is any of the not-found kinds.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            LedgerError::AccountNotFound(_)
                | LedgerError::TransactionNotFound(_)
                | LedgerError::EntryNotFound(_)
        )
    }

    /// Check if the client can correct the request and try again.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidAmount { .. }
                | LedgerError::InvalidRequest(_)
                | LedgerError::AccountNotFound(_)
                | LedgerError::TransactionNotFound(_)
                | LedgerError::EntryNotFound(_)
                | LedgerError::InsufficientFunds { .. }
                | LedgerError::CurrencyMismatch { .. }
                | LedgerError::SameAccount
                | LedgerError::Unauthorized(_)
        )
    }

    /// Errors that point at storage-layer trouble rather than a clean failure.
    pub fn is_severe(&self) -> bool {
        matches!(
            self,
            LedgerError::RollbackFailed { .. } | LedgerError::IntegrityViolation(_)
        )
    }

    /// Message safe to show to an end user.
    pub fn public_message(&self) -> String {
        match self {
            LedgerError::InsufficientFunds { .. } => "balance not enough".to_string(),
            e if e.is_client_error() => e.to_string(),
            _ => "internal error".to_string(),
        }
    }

    /// Get error code for responses and logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount { .. } => "INVALID_AMOUNT",
            LedgerError::InvalidRequest(_) => "INVALID_REQUEST",
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            LedgerError::EntryNotFound(_) => "ENTRY_NOT_FOUND",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            LedgerError::SameAccount => "SAME_ACCOUNT",
            LedgerError::Unauthorized(_) => "UNAUTHORIZED",
            LedgerError::Conflict(_) => "STORAGE_CONFLICT",
            LedgerError::ConstraintViolation(_) => "CONSTRAINT_VIOLATION",
            LedgerError::ConnectionError(_) => "CONNECTION_ERROR",
            LedgerError::Timeout(_) => "TIMEOUT",
            LedgerError::DatabaseError(_) => "DATABASE_ERROR",
            LedgerError::RollbackFailed { .. } => "ROLLBACK_FAILED",
            LedgerError::IntegrityViolation(_) => "INTEGRITY_VIOLATION",
            LedgerError::ConfigurationError(_) => "CONFIGURATION_ERROR",
            LedgerError::InternalError(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_conflicts_are_retryable() {
        assert!(LedgerError::Conflict("deadlock detected".into()).is_retryable());
        assert!(!LedgerError::SameAccount.is_retryable());
        assert!(!LedgerError::AccountNotFound("7".into()).is_retryable());
        assert!(!LedgerError::InsufficientFunds {
            account_id: AccountId::new(1),
            available: Decimal::ZERO,
            required: Decimal::ONE,
        }
        .is_retryable());
        assert!(!LedgerError::ConnectionError("refused".into()).is_retryable());
    }

    #[test]
    fn test_public_message_hides_internal_detail() {
        let err = LedgerError::DatabaseError("relation \"accounts\" does not exist".into());
        assert_eq!(err.public_message(), "internal error");

        let err = LedgerError::InsufficientFunds {
            account_id: AccountId::new(1),
            available: Decimal::from(5),
            required: Decimal::from(10),
        };
        assert!(err.is_client_error());
        assert_eq!(err.public_message(), "balance not enough");
    }

    #[test]
    fn test_rollback_failure_keeps_both_causes() {
        let err = LedgerError::RollbackFailed {
            cause: Box::new(LedgerError::Conflict("deadlock detected".into())),
            rollback: Box::new(LedgerError::ConnectionError("broken pipe".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("deadlock detected"));
        assert!(msg.contains("broken pipe"));
        assert!(err.is_severe());
        assert_eq!(err.error_code(), "ROLLBACK_FAILED");
        assert!(!err.is_retryable());
    }
}
