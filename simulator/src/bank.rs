//! Simulated customers and their ledger accounts.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use ledgerflow_common::{Currency, Result};
use ledgerflow_ledger::{Account, MemoryLedger, NewAccount};
use ledgerflow_service::Principal;

/// Opening position of one simulated customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpeningPosition {
    pub name: String,
    pub currency: Currency,
    pub opening_balance: Decimal,
}

impl OpeningPosition {
    pub fn usd(name: impl Into<String>, opening_balance: Decimal) -> Self {
        Self {
            name: name.into(),
            currency: Currency::usd(),
            opening_balance,
        }
    }
}

/// A simulated customer holding one account.
#[derive(Debug, Clone)]
pub struct SimulatedCustomer {
    pub name: String,
    pub account: Account,
}

impl SimulatedCustomer {
    /// Principal that may move funds out of this customer's account.
    pub fn principal(&self) -> Principal {
        Principal::customer(self.name.clone())
    }
}

/// Factory for simulated customers.
pub struct CustomerFactory;

impl CustomerFactory {
    /// Opening positions for `count` USD customers with the same opening balance.
    pub fn uniform(count: usize, opening_balance: Decimal) -> Vec<OpeningPosition> {
        let names = [
            "alice", "bob", "carol", "dave", "erin", "frank", "grace", "heidi", "ivan", "judy",
        ];

        (0..count)
            .map(|i| {
                let name = match names.get(i) {
                    Some(name) => name.to_string(),
                    None => format!("customer-{}", i + 1),
                };
                OpeningPosition::usd(name, opening_balance)
            })
            .collect()
    }

    /// Open one account per opening position.
    pub fn open(
        ledger: &MemoryLedger,
        positions: &[OpeningPosition],
    ) -> Result<Vec<SimulatedCustomer>> {
        positions
            .iter()
            .map(|position| {
                let account = ledger.open_account(NewAccount::new(
                    position.name.clone(),
                    position.currency.clone(),
                    position.opening_balance,
                ))?;
                Ok(SimulatedCustomer {
                    name: position.name.clone(),
                    account,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_names_are_distinct() {
        let positions = CustomerFactory::uniform(12, Decimal::from(100));
        assert_eq!(positions.len(), 12);
        assert_eq!(positions[0].name, "alice");
        assert_eq!(positions[11].name, "customer-12");

        let mut names: Vec<_> = positions.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 12);
    }

    #[test]
    fn test_open_creates_accounts() {
        let ledger = MemoryLedger::new();
        let customers =
            CustomerFactory::open(&ledger, &CustomerFactory::uniform(3, Decimal::from(50)))
                .unwrap();

        assert_eq!(ledger.accounts().len(), 3);
        assert!(customers.iter().all(|c| c.account.balance == Decimal::from(50)));
        assert!(customers[0].principal().may_access(&customers[0].account));
        assert!(!customers[0].principal().may_access(&customers[1].account));
    }
}
