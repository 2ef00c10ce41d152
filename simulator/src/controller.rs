//! Simulation controller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use ledgerflow_common::LedgerError;
use ledgerflow_ledger::{EngineConfig, Ledger, MemoryLedger, MemoryLedgerConfig, TransferEngine};
use ledgerflow_service::{Metrics, Principal, RetryPolicy, TransferRequest, TransferService};

use crate::bank::{CustomerFactory, OpeningPosition, SimulatedCustomer};
use crate::metrics::SimulationMetrics;
use crate::scenario::{AssertCondition, FaultType, Scenario, ScenarioStep};

/// When a pool of random workers stops.
#[derive(Debug, Clone, Copy)]
enum Budget {
    Transfers(usize),
    Until(Instant),
}

/// Controls the simulation.
pub struct SimulationController {
    /// Backing ledger, kept for fault injection and audits.
    ledger: MemoryLedger,
    /// Transfer service under load.
    service: Arc<TransferService>,
    /// Random number generator.
    rng: StdRng,
    /// Simulated customers.
    customers: Arc<Vec<SimulatedCustomer>>,
    /// Sum of opening balances.
    opening_total: Decimal,
    /// Simulation metrics.
    metrics: Arc<RwLock<SimulationMetrics>>,
}

impl SimulationController {
    /// Create a new simulation controller.
    pub fn new(seed: Option<u64>, lock_wait_timeout: Duration, retry: RetryPolicy) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        let ledger = MemoryLedger::with_config(MemoryLedgerConfig { lock_wait_timeout });
        let engine = TransferEngine::new(Arc::new(ledger.clone()), EngineConfig::default());
        let service = TransferService::new(Arc::new(engine), retry, Arc::new(Metrics::new()));

        Self {
            ledger,
            service: Arc::new(service),
            rng,
            customers: Arc::new(Vec::new()),
            opening_total: Decimal::ZERO,
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
        }
    }

    /// Open the customer accounts.
    pub fn initialize(&mut self, positions: &[OpeningPosition]) -> anyhow::Result<()> {
        info!(customers = positions.len(), "Initializing simulation");

        let customers = CustomerFactory::open(&self.ledger, positions)?;
        for customer in &customers {
            info!(
                customer = %customer.name,
                account_id = %customer.account.id,
                balance = %customer.account.balance,
                "Opened account"
            );
        }

        self.opening_total = customers.iter().map(|c| c.account.balance).sum();
        self.customers = Arc::new(customers);

        Ok(())
    }

    /// Run a scenario: open its customers, then execute each step in order.
    pub async fn run_scenario(&mut self, scenario: Scenario) -> anyhow::Result<()> {
        info!("Running scenario: {} - {}", scenario.name, scenario.description);

        self.initialize(&scenario.customers)?;
        for step in &scenario.steps {
            self.execute_step(step).await?;
        }

        Ok(())
    }

    /// Run random transfers until `duration` elapses.
    pub async fn run(&mut self, duration: Duration, concurrency: usize) -> anyhow::Result<()> {
        info!(
            duration_secs = duration.as_secs(),
            concurrency, "Running simulation in continuous mode"
        );

        let max_amount = self.largest_opening_balance() / Decimal::from(4);
        self.random_transfers(Budget::Until(Instant::now() + duration), concurrency, max_amount)
            .await
    }

    /// Execute a single scenario step.
    async fn execute_step(&mut self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::Wait { millis } => {
                debug!("Waiting {} ms", millis);
                tokio::time::sleep(Duration::from_millis(*millis)).await;
            }
            ScenarioStep::ConcurrentTransfers {
                from,
                to,
                amount,
                count,
            } => {
                info!("Sending {} transfers: {} -> {} {}", count, from, to, amount);
                let from = self.customer(from)?;
                let to = self.customer(to)?;
                let transfers = (0..*count).map(|_| (from.clone(), to.clone(), *amount));
                self.fire(transfers).await;
            }
            ScenarioStep::AlternatingTransfers {
                a,
                b,
                amount,
                count,
            } => {
                info!("Sending {} alternating transfers: {} <-> {} {}", count, a, b, amount);
                let a = self.customer(a)?;
                let b = self.customer(b)?;
                let transfers = (0..*count).map(|i| {
                    if i % 2 == 0 {
                        (a.clone(), b.clone(), *amount)
                    } else {
                        (b.clone(), a.clone(), *amount)
                    }
                });
                self.fire(transfers).await;
            }
            ScenarioStep::RandomTransfers {
                count,
                concurrency,
                max_amount,
            } => {
                info!("Sending {} random transfers, {} in flight", count, concurrency);
                self.random_transfers(Budget::Transfers(*count), *concurrency, *max_amount)
                    .await?;
            }
            ScenarioStep::InjectFault { fault } => {
                info!("Injecting fault {:?}", fault);
                match fault {
                    FaultType::StorageOffline => self.ledger.set_offline(true),
                    FaultType::CommitFailure => self.ledger.fail_next_commit(),
                    FaultType::RollbackFailure => self.ledger.fail_next_rollback(),
                }
            }
            ScenarioStep::ClearFault => {
                info!("Clearing storage outage");
                self.ledger.set_offline(false);
            }
            ScenarioStep::Assert { condition } => {
                self.check(condition).await?;
                info!("Assertion held: {:?}", condition);
            }
        }

        Ok(())
    }

    fn customer(&self, name: &str) -> anyhow::Result<SimulatedCustomer> {
        self.customers
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown customer: {}", name))
    }

    fn largest_opening_balance(&self) -> Decimal {
        self.customers
            .iter()
            .map(|c| c.account.balance)
            .max()
            .unwrap_or(Decimal::ZERO)
    }

    /// Start every transfer at once and wait for all of them.
    async fn fire(
        &self,
        transfers: impl Iterator<Item = (SimulatedCustomer, SimulatedCustomer, Decimal)>,
    ) {
        let handles: Vec<_> = transfers
            .map(|(from, to, amount)| {
                let service = Arc::clone(&self.service);
                let metrics = Arc::clone(&self.metrics);
                tokio::spawn(async move {
                    send(&service, &metrics, &from, &to, amount).await;
                })
            })
            .collect();

        for outcome in join_all(handles).await {
            if let Err(e) = outcome {
                warn!(error = %e, "Transfer task panicked");
            }
        }
    }

    /// Random transfers between distinct customers from a pool of workers.
    async fn random_transfers(
        &mut self,
        budget: Budget,
        concurrency: usize,
        max_amount: Decimal,
    ) -> anyhow::Result<()> {
        if self.customers.len() < 2 {
            return Err(anyhow::anyhow!("Random transfers need at least two customers"));
        }
        // Whole cents between 0.01 and max_amount.
        let max_cents = (max_amount * Decimal::from(100)).trunc();
        let max_cents = max_cents
            .to_u64()
            .ok_or_else(|| anyhow::anyhow!("Invalid max amount: {}", max_amount))?
            .max(1);

        let workers = concurrency.max(1);
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let budget = match budget {
                    Budget::Transfers(total) => {
                        Budget::Transfers(total / workers + usize::from(worker < total % workers))
                    }
                    until => until,
                };
                let rng = StdRng::seed_from_u64(self.rng.gen());
                let service = Arc::clone(&self.service);
                let metrics = Arc::clone(&self.metrics);
                let customers = Arc::clone(&self.customers);
                tokio::spawn(random_worker(service, metrics, customers, rng, budget, max_cents))
            })
            .collect();

        for outcome in join_all(handles).await {
            outcome?;
        }

        Ok(())
    }

    /// Check a scenario assertion against the ledger.
    async fn check(&self, condition: &AssertCondition) -> anyhow::Result<()> {
        match condition {
            AssertCondition::BalanceEquals { customer, amount } => {
                let account = self.customer(customer)?.account;
                let balance = self.ledger.get_account(account.id).await?.balance;
                if balance != *amount {
                    return Err(anyhow::anyhow!(
                        "Balance of {} is {}, expected {}",
                        customer,
                        balance,
                        amount
                    ));
                }
            }
            AssertCondition::FundsConserved => self.verify_conservation()?,
            AssertCondition::JournalsBalanced => self.verify_journals().await?,
            AssertCondition::CommittedTransfers { count } => {
                let committed = self.ledger.transaction_count();
                if committed != *count {
                    return Err(anyhow::anyhow!(
                        "{} transfers committed, expected {}",
                        committed,
                        count
                    ));
                }
            }
        }
        Ok(())
    }

    /// Sum of balances still equals the sum of opening balances, and no
    /// balance went negative.
    pub fn verify_conservation(&self) -> anyhow::Result<()> {
        let accounts = self.ledger.accounts();
        if let Some(negative) = accounts.iter().find(|a| a.balance < Decimal::ZERO) {
            return Err(anyhow::anyhow!(
                "Account {} has negative balance {}",
                negative.id,
                negative.balance
            ));
        }

        let total: Decimal = accounts.iter().map(|a| a.balance).sum();
        if total != self.opening_total {
            return Err(anyhow::anyhow!(
                "Funds not conserved: {} now, {} at open",
                total,
                self.opening_total
            ));
        }
        Ok(())
    }

    /// Audit every committed transfer and reconcile balances with entries.
    pub async fn verify_journals(&self) -> anyhow::Result<()> {
        let auditor = Principal::admin("simulator");
        let mut net: HashMap<_, Decimal> = HashMap::new();

        for transaction in self.ledger.transactions() {
            let batch = self.service.verify(&auditor, transaction.id).await?;
            for entry in &batch.entries {
                *net.entry(entry.account_id).or_default() += entry.signed_amount();
            }
        }

        for customer in self.customers.iter() {
            let opened = customer.account.balance;
            let posted = net.get(&customer.account.id).copied().unwrap_or_default();
            let balance = self.ledger.get_account(customer.account.id).await?.balance;
            if opened + posted != balance {
                return Err(anyhow::anyhow!(
                    "Account {} balance {} does not match {} opening plus {} posted",
                    customer.account.id,
                    balance,
                    opened,
                    posted
                ));
            }
        }
        Ok(())
    }

    /// Get simulation metrics.
    pub async fn metrics(&self) -> SimulationMetrics {
        self.metrics.read().await.clone()
    }

    /// Prometheus export of the transfer service counters.
    pub fn service_metrics(&self) -> String {
        self.service.metrics().to_prometheus()
    }
}

async fn random_worker(
    service: Arc<TransferService>,
    metrics: Arc<RwLock<SimulationMetrics>>,
    customers: Arc<Vec<SimulatedCustomer>>,
    mut rng: StdRng,
    budget: Budget,
    max_cents: u64,
) {
    let mut sent = 0;
    loop {
        let done = match budget {
            Budget::Transfers(total) => sent >= total,
            Budget::Until(deadline) => Instant::now() >= deadline,
        };
        if done {
            break;
        }

        let from = rng.gen_range(0..customers.len());
        let mut to = rng.gen_range(0..customers.len());
        while to == from {
            to = rng.gen_range(0..customers.len());
        }
        let amount = Decimal::new(rng.gen_range(1..=max_cents) as i64, 2);

        send(&service, &metrics, &customers[from], &customers[to], amount).await;
        sent += 1;
    }
}

async fn send(
    service: &TransferService,
    metrics: &RwLock<SimulationMetrics>,
    from: &SimulatedCustomer,
    to: &SimulatedCustomer,
    amount: Decimal,
) {
    let request = TransferRequest {
        from_account: from.account.public_id,
        to_account: to.account.public_id,
        amount,
        currency: from.account.currency.clone(),
    };

    let started = Instant::now();
    match service.transfer(&from.principal(), request).await {
        Ok(_) => {
            let latency = started.elapsed().as_micros() as u64;
            metrics.write().await.record_success(latency);
        }
        Err(e) if e.is_client_error() => {
            debug!(from = %from.name, to = %to.name, %amount, error = %e, "Transfer rejected");
            metrics.write().await.record_rejection();
        }
        Err(e) => {
            if let LedgerError::RollbackFailed { .. } = e {
                warn!(error = %e, "Rollback failed during simulation");
            }
            metrics.write().await.record_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> SimulationController {
        SimulationController::new(Some(7), Duration::from_secs(2), RetryPolicy::default())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_five_concurrent_scenario() {
        let mut controller = controller();
        controller
            .run_scenario(Scenario::load("five-concurrent").unwrap())
            .await
            .unwrap();

        let metrics = controller.metrics().await;
        assert_eq!(metrics.successful_transfers, 5);
        assert_eq!(metrics.failed_transfers, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_alternating_scenario() {
        let mut controller = controller();
        controller
            .run_scenario(Scenario::load("alternating").unwrap())
            .await
            .unwrap();
        controller.verify_journals().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_random_load_conserves_funds() {
        let mut controller = controller();
        controller
            .run_scenario(Scenario::load("random-load").unwrap())
            .await
            .unwrap();

        let metrics = controller.metrics().await;
        assert_eq!(metrics.total_transfers, 500);
        assert_eq!(metrics.failed_transfers, 0);
        assert!(metrics.successful_transfers > 0);
    }

    #[tokio::test]
    async fn test_failure_recovery_scenario() {
        let mut controller = controller();
        controller
            .run_scenario(Scenario::load("failure-recovery").unwrap())
            .await
            .unwrap();

        let metrics = controller.metrics().await;
        assert_eq!(metrics.successful_transfers, 2);
        assert_eq!(metrics.failed_transfers, 2);
        controller.verify_journals().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_assertion_is_reported() {
        let mut controller = controller();
        controller
            .initialize(&[
                OpeningPosition::usd("alice", Decimal::from(10)),
                OpeningPosition::usd("bob", Decimal::from(10)),
            ])
            .unwrap();

        let err = controller
            .check(&AssertCondition::BalanceEquals {
                customer: "alice".to_string(),
                amount: Decimal::from(11),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected 11"));
        assert!(controller.customer("mallory").is_err());
    }

    #[tokio::test]
    async fn test_continuous_run_stops_at_deadline() {
        let mut controller = controller();
        controller
            .initialize(&CustomerFactory::uniform(3, Decimal::from(100)))
            .unwrap();

        controller.run(Duration::from_millis(50), 2).await.unwrap();

        assert!(controller.metrics().await.total_transfers > 0);
        controller.verify_conservation().unwrap();
        controller.verify_journals().await.unwrap();
    }
}
