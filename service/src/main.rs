//! Ledgerflow admin CLI
//!
//! Runs single transfers, balance lookups and journal audits against the
//! PostgreSQL ledger named by `DATABASE_URL`.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use ledgerflow_common::{Currency, TransactionId};
use ledgerflow_ledger::{PgLedger, TransferEngine};
use ledgerflow_service::{
    Metrics, Principal, RetryPolicy, ServiceConfig, TransferRequest, TransferService,
};

/// Ledgerflow admin CLI
#[derive(Parser, Debug)]
#[command(name = "ledgerflow")]
#[command(about = "Ledger transfer engine administration")]
struct Args {
    /// Owner name to act as
    #[arg(long = "as", global = true, default_value = "admin")]
    owner: String,

    /// Act with the admin role
    #[arg(long, global = true)]
    admin: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Move funds between two accounts
    Transfer {
        /// Payer account public id
        #[arg(long)]
        from: Uuid,

        /// Payee account public id
        #[arg(long)]
        to: Uuid,

        /// Amount in major units, e.g. 12.50
        #[arg(long)]
        amount: Decimal,

        /// ISO 4217 currency code
        #[arg(long, default_value = "USD")]
        currency: String,
    },

    /// Show an account
    Balance {
        /// Account public id
        account: Uuid,
    },

    /// Audit the journal entries of a committed transfer
    Verify {
        /// Transaction id
        transaction: TransactionId,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let args = Args::parse();
    let principal = if args.admin {
        Principal::admin(args.owner)
    } else {
        Principal::customer(args.owner)
    };

    let ledger = PgLedger::connect(&config.database_url, config.postgres.clone()).await?;
    let engine = Arc::new(TransferEngine::new(Arc::new(ledger), config.engine.clone()));
    let service = TransferService::new(
        engine,
        RetryPolicy::new(&config.retry),
        Arc::new(Metrics::new()),
    );

    let output = match args.command {
        Command::Transfer {
            from,
            to,
            amount,
            currency,
        } => {
            let request = TransferRequest {
                from_account: from,
                to_account: to,
                amount,
                currency: Currency::new(currency),
            };
            match service.transfer(&principal, request).await {
                Ok(receipt) => serde_json::to_string_pretty(&receipt)?,
                Err(e) => {
                    info!(metrics = %service.metrics().to_prometheus(), "Transfer metrics");
                    return Err(anyhow::anyhow!("{} ({})", e.public_message(), e.error_code()));
                }
            }
        }
        Command::Balance { account } => {
            let account = service
                .account(&principal, account)
                .await
                .map_err(|e| anyhow::anyhow!("{} ({})", e.public_message(), e.error_code()))?;
            serde_json::to_string_pretty(&account)?
        }
        Command::Verify { transaction } => {
            let batch = service
                .verify(&principal, transaction)
                .await
                .map_err(|e| anyhow::anyhow!("{} ({})", e, e.error_code()))?;
            serde_json::to_string_pretty(&batch)?
        }
    };

    println!("{output}");
    Ok(())
}
