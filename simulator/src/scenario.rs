//! Simulation scenarios.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::bank::OpeningPosition;

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Accounts opened before the first step.
    pub customers: Vec<OpeningPosition>,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// A step in a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    /// Wait for a duration.
    Wait { millis: u64 },
    /// Fire `count` transfers from one customer to another at once.
    ConcurrentTransfers {
        from: String,
        to: String,
        amount: Decimal,
        count: usize,
    },
    /// Fire `count` transfers at once, alternating direction between two customers.
    AlternatingTransfers {
        a: String,
        b: String,
        amount: Decimal,
        count: usize,
    },
    /// Random transfers between all customers, `concurrency` in flight.
    RandomTransfers {
        count: usize,
        concurrency: usize,
        max_amount: Decimal,
    },
    /// Inject a storage fault.
    InjectFault { fault: FaultType },
    /// Clear the storage outage.
    ClearFault,
    /// Assert a condition.
    Assert { condition: AssertCondition },
}

/// Storage faults that can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultType {
    /// Storage unreachable until cleared.
    StorageOffline,
    /// The next commit fails.
    CommitFailure,
    /// The next rollback fails.
    RollbackFailure,
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AssertCondition {
    /// Customer balance equals.
    BalanceEquals { customer: String, amount: Decimal },
    /// Sum of balances equals the sum of opening balances.
    FundsConserved,
    /// Every committed transfer passes the journal audit.
    JournalsBalanced,
    /// Number of committed transfers.
    CommittedTransfers { count: usize },
}

impl Scenario {
    /// Names accepted by [`Scenario::load`].
    pub const NAMES: [&'static str; 4] = [
        "five-concurrent",
        "alternating",
        "random-load",
        "failure-recovery",
    ];

    /// Load a scenario by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "five-concurrent" => Ok(Self::five_concurrent()),
            "alternating" => Ok(Self::alternating()),
            "random-load" => Ok(Self::random_load()),
            "failure-recovery" => Ok(Self::failure_recovery()),
            _ => Err(anyhow::anyhow!(
                "Unknown scenario: {} (expected one of {})",
                name,
                Self::NAMES.join(", ")
            )),
        }
    }

    /// Five simultaneous transfers of 10 from one account to another.
    fn five_concurrent() -> Self {
        Self {
            name: "five-concurrent".to_string(),
            description: "Five concurrent transfers between two accounts".to_string(),
            customers: vec![
                OpeningPosition::usd("alice", Decimal::from(100)),
                OpeningPosition::usd("bob", Decimal::from(50)),
            ],
            steps: vec![
                ScenarioStep::ConcurrentTransfers {
                    from: "alice".to_string(),
                    to: "bob".to_string(),
                    amount: Decimal::from(10),
                    count: 5,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::BalanceEquals {
                        customer: "alice".to_string(),
                        amount: Decimal::from(50),
                    },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::BalanceEquals {
                        customer: "bob".to_string(),
                        amount: Decimal::from(100),
                    },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::CommittedTransfers { count: 5 },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::JournalsBalanced,
                },
            ],
        }
    }

    /// Opposite-direction transfers on the same pair of accounts.
    fn alternating() -> Self {
        Self {
            name: "alternating".to_string(),
            description: "Concurrent transfers in both directions without deadlock".to_string(),
            customers: vec![
                OpeningPosition::usd("alice", Decimal::from(100)),
                OpeningPosition::usd("bob", Decimal::from(100)),
            ],
            steps: vec![
                ScenarioStep::AlternatingTransfers {
                    a: "alice".to_string(),
                    b: "bob".to_string(),
                    amount: Decimal::from(10),
                    count: 20,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::BalanceEquals {
                        customer: "alice".to_string(),
                        amount: Decimal::from(100),
                    },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::CommittedTransfers { count: 20 },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::FundsConserved,
                },
            ],
        }
    }

    /// Random transfers across a handful of accounts.
    fn random_load() -> Self {
        let customers = ["alice", "bob", "carol", "dave", "erin"]
            .into_iter()
            .map(|name| OpeningPosition::usd(name, Decimal::from(1000)))
            .collect();

        Self {
            name: "random-load".to_string(),
            description: "Random transfers between five accounts".to_string(),
            customers,
            steps: vec![
                ScenarioStep::RandomTransfers {
                    count: 500,
                    concurrency: 16,
                    max_amount: Decimal::from(250),
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::FundsConserved,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::JournalsBalanced,
                },
            ],
        }
    }

    /// Storage faults leave balances untouched and the ledger recovers.
    fn failure_recovery() -> Self {
        Self {
            name: "failure-recovery".to_string(),
            description: "Storage faults roll back cleanly".to_string(),
            customers: vec![
                OpeningPosition::usd("alice", Decimal::from(100)),
                OpeningPosition::usd("bob", Decimal::from(0)),
            ],
            steps: vec![
                ScenarioStep::ConcurrentTransfers {
                    from: "alice".to_string(),
                    to: "bob".to_string(),
                    amount: Decimal::from(10),
                    count: 1,
                },
                // Storage goes away
                ScenarioStep::InjectFault {
                    fault: FaultType::StorageOffline,
                },
                ScenarioStep::ConcurrentTransfers {
                    from: "alice".to_string(),
                    to: "bob".to_string(),
                    amount: Decimal::from(10),
                    count: 1,
                },
                ScenarioStep::ClearFault,
                // Commit fails once
                ScenarioStep::InjectFault {
                    fault: FaultType::CommitFailure,
                },
                ScenarioStep::ConcurrentTransfers {
                    from: "alice".to_string(),
                    to: "bob".to_string(),
                    amount: Decimal::from(10),
                    count: 1,
                },
                ScenarioStep::Wait { millis: 10 },
                // Healthy again
                ScenarioStep::ConcurrentTransfers {
                    from: "alice".to_string(),
                    to: "bob".to_string(),
                    amount: Decimal::from(10),
                    count: 1,
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::BalanceEquals {
                        customer: "alice".to_string(),
                        amount: Decimal::from(80),
                    },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::CommittedTransfers { count: 2 },
                },
                ScenarioStep::Assert {
                    condition: AssertCondition::FundsConserved,
                },
            ],
        }
    }
}
