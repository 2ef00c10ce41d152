//! Deterministic lock ordering.
//!
//! Every unit of work that touches two accounts locks the numerically smaller
//! account id first. Two concurrent transfers over the same pair, in either
//! direction, therefore request row locks in the same global order and can
//! never wait on each other in a cycle.

use ledgerflow_common::AccountId;
use rust_decimal::Decimal;

use crate::journal::EntryKind;

/// Return the two ids in lock acquisition order (ascending).
pub fn lock_order(a: AccountId, b: AccountId) -> (AccountId, AccountId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// One balance adjustment of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceLeg {
    pub account_id: AccountId,
    pub kind: EntryKind,
    /// Signed change applied to the balance.
    pub delta: Decimal,
}

/// Both balance adjustments of a transfer, in lock order.
///
/// When payer and payee are the same account the credit leg goes first, so
/// the balance never dips below zero in between.
pub fn ordered_legs(from: AccountId, to: AccountId, amount: Decimal) -> [BalanceLeg; 2] {
    let debit = BalanceLeg {
        account_id: from,
        kind: EntryKind::Debit,
        delta: -amount,
    };
    let credit = BalanceLeg {
        account_id: to,
        kind: EntryKind::Credit,
        delta: amount,
    };

    let (first, _) = lock_order(from, to);
    if from != to && first == from {
        [debit, credit]
    } else {
        [credit, debit]
    }
}
