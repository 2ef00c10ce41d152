//! Transfer request types and the transfer state machine.

use crate::{is_valid_amount, AccountId, LedgerError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Input to the transfer engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferParams {
    /// Payer account.
    pub from_account_id: AccountId,
    /// Payee account.
    pub to_account_id: AccountId,
    /// Amount in the accounts' currency; must be strictly positive.
    pub amount: Decimal,
    /// Bookkeeping tag stored on the transaction record.
    pub transfer_type: String,
}

impl TransferParams {
    /// Create transfer parameters tagged as a plain transfer.
    pub fn new(from_account_id: AccountId, to_account_id: AccountId, amount: Decimal) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
            transfer_type: "transfer".to_string(),
        }
    }

    /// Override the bookkeeping tag.
    pub fn with_type(mut self, transfer_type: impl Into<String>) -> Self {
        self.transfer_type = transfer_type.into();
        self
    }

    /// Check preconditions that must hold before any write.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if !is_valid_amount(self.amount) {
            return Err(LedgerError::InvalidAmount {
                amount: self.amount,
            });
        }
        if self.transfer_type.trim().is_empty() {
            return Err(LedgerError::InvalidRequest(
                "transfer type must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a single transfer inside its unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    /// Unit of work opened.
    Started,
    /// Both account rows are locked.
    AccountsLocked,
    /// Transaction row and both entries written.
    LedgerWritten,
    /// Both balances adjusted.
    BalancesAdjusted,
    /// Unit of work committed.
    Committed,
    /// Unit of work rolled back; nothing is visible.
    RolledBack,
}

impl TransferState {
    /// Check if this is a final state.
    pub fn is_final(&self) -> bool {
        matches!(self, TransferState::Committed | TransferState::RolledBack)
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[TransferState] {
        match self {
            TransferState::Started => &[TransferState::AccountsLocked, TransferState::RolledBack],
            TransferState::AccountsLocked => {
                &[TransferState::LedgerWritten, TransferState::RolledBack]
            }
            TransferState::LedgerWritten => {
                &[TransferState::BalancesAdjusted, TransferState::RolledBack]
            }
            TransferState::BalancesAdjusted => {
                &[TransferState::Committed, TransferState::RolledBack]
            }
            TransferState::Committed => &[],
            TransferState::RolledBack => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: TransferState) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// Error returned for an illegal state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: TransferState,
    pub to: TransferState,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Invalid transition from {:?} to {:?}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// Tracks where a transfer is in its lifecycle and when it got there.
#[derive(Debug, Clone)]
pub struct TransferProgress {
    state: TransferState,
    started_at: DateTime<Utc>,
    locked_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TransferProgress {
    /// Start tracking a new transfer.
    pub fn new() -> Self {
        Self {
            state: TransferState::Started,
            started_at: Utc::now(),
            locked_at: None,
            finished_at: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Transition to a new state.
    pub fn transition_to(&mut self, next: TransferState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        self.state = next;

        let now = Utc::now();
        match next {
            TransferState::AccountsLocked => self.locked_at = Some(now),
            TransferState::Committed | TransferState::RolledBack => self.finished_at = Some(now),
            _ => {}
        }

        Ok(())
    }

    /// Milliseconds spent waiting for both row locks.
    pub fn lock_wait_ms(&self) -> Option<i64> {
        self.locked_at
            .map(|locked| (locked - self.started_at).num_milliseconds())
    }

    /// Total duration in milliseconds, once final.
    pub fn total_duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|finished| (finished - self.started_at).num_milliseconds())
    }
}

impl Default for TransferProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut progress = TransferProgress::new();
        for next in [
            TransferState::AccountsLocked,
            TransferState::LedgerWritten,
            TransferState::BalancesAdjusted,
            TransferState::Committed,
        ] {
            progress.transition_to(next).unwrap();
        }
        assert!(progress.state().is_final());
        assert!(progress.lock_wait_ms().is_some());
        assert!(progress.total_duration_ms().is_some());
    }

    #[test]
    fn test_no_partial_commit() {
        // Committed is reachable only after both balances are adjusted.
        assert!(!TransferState::LedgerWritten.can_transition_to(TransferState::Committed));
        assert!(!TransferState::AccountsLocked.can_transition_to(TransferState::Committed));
        assert!(!TransferState::Started.can_transition_to(TransferState::Committed));
    }

    #[test]
    fn test_every_open_state_can_roll_back() {
        for state in [
            TransferState::Started,
            TransferState::AccountsLocked,
            TransferState::LedgerWritten,
            TransferState::BalancesAdjusted,
        ] {
            assert!(state.can_transition_to(TransferState::RolledBack));
        }
        assert!(TransferState::Committed.valid_transitions().is_empty());
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut progress = TransferProgress::new();
        let err = progress
            .transition_to(TransferState::BalancesAdjusted)
            .unwrap_err();
        assert_eq!(err.from, TransferState::Started);
        assert_eq!(progress.state(), TransferState::Started);
    }

    #[test]
    fn test_params_validation() {
        let from = AccountId::new(1);
        let to = AccountId::new(2);

        assert!(TransferParams::new(from, to, Decimal::from(10)).validate().is_ok());
        assert!(matches!(
            TransferParams::new(from, to, Decimal::ZERO).validate(),
            Err(LedgerError::InvalidAmount { .. })
        ));
        assert!(matches!(
            TransferParams::new(from, to, Decimal::from(-3)).validate(),
            Err(LedgerError::InvalidAmount { .. })
        ));
        assert!(matches!(
            TransferParams::new(from, to, Decimal::ONE).with_type("  ").validate(),
            Err(LedgerError::InvalidRequest(_))
        ));
    }
}
