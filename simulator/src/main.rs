//! Ledgerflow Simulator
//!
//! Drives the transfer engine over the in-memory ledger with concurrent
//! load, then checks that funds were conserved and every journal balances.

use std::time::{Duration, Instant};

use clap::Parser;
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ledgerflow_service::{RetryConfig, RetryPolicy};

mod bank;
mod controller;
mod metrics;
mod scenario;

use bank::CustomerFactory;
use controller::SimulationController;
use scenario::Scenario;

/// Ledgerflow Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Concurrent load and scenario driver for the ledgerflow transfer engine")]
struct Args {
    /// Number of simulated customers in continuous mode
    #[arg(short, long, default_value = "4")]
    customers: usize,

    /// Opening balance of each customer in continuous mode
    #[arg(long, default_value = "1000")]
    opening_balance: Decimal,

    /// Scenario to run (five-concurrent, alternating, random-load, failure-recovery)
    #[arg(short, long)]
    scenario: Option<String>,

    /// Transfers in flight in continuous mode
    #[arg(long, default_value = "8")]
    concurrency: usize,

    /// Run duration in seconds in continuous mode
    #[arg(long, default_value = "5")]
    duration: u64,

    /// Lock wait timeout in milliseconds
    #[arg(long, default_value = "2000")]
    lock_wait_ms: u64,

    /// Retries after a storage conflict
    #[arg(long, default_value = "2")]
    max_retries: u32,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Print the transfer service counters in Prometheus format
    #[arg(long)]
    prometheus: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting ledgerflow simulator");

    let retry = RetryPolicy::new(&RetryConfig {
        max_retries: args.max_retries,
        ..RetryConfig::default()
    });
    let mut controller = SimulationController::new(
        args.seed,
        Duration::from_millis(args.lock_wait_ms),
        retry,
    );

    let started = Instant::now();
    if let Some(scenario_name) = &args.scenario {
        let scenario = Scenario::load(scenario_name)?;
        controller.run_scenario(scenario).await?;
    } else {
        controller.initialize(&CustomerFactory::uniform(args.customers, args.opening_balance))?;
        controller
            .run(Duration::from_secs(args.duration), args.concurrency)
            .await?;
    }
    let elapsed = started.elapsed().as_secs_f64();

    controller.verify_conservation()?;
    controller.verify_journals().await?;

    let metrics = controller.metrics().await;
    info!("Simulation complete");
    info!("Total transfers: {}", metrics.total_transfers);
    info!("Committed: {}", metrics.successful_transfers);
    info!("Rejected: {}", metrics.rejected_transfers);
    info!("Failed: {}", metrics.failed_transfers);
    info!("Success rate: {:.2}", metrics.success_rate());
    info!("Throughput: {:.1} transfers/s", metrics.throughput(elapsed));
    info!(
        "Latency avg/p50/p99: {}/{}/{} us",
        metrics.average_latency_us(),
        metrics.p50_latency_us(),
        metrics.p99_latency_us()
    );

    if args.prometheus {
        println!("{}", controller.service_metrics());
    }

    Ok(())
}
