//! farmd - yield accrual and referral engine
//!
//! Operator interface for running the accrual scheduler, posting ledger
//! entries and checking balances against the ledger.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::ledger::PostKind;
use commands::StoreArgs;

/// farmd: periodic yield accrual with multi-level referral commissions.
#[derive(Parser)]
#[command(name = "farmd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path (JSON)
    #[arg(short, long, global = true, env = "FARM_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the accrual scheduler until interrupted (Ctrl-C)
    Run {
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Run a single accrual tick and print its report
    Tick {
        #[command(flatten)]
        store: StoreArgs,

        /// Evaluate the tick as if it were this instant (RFC 3339)
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Compute the income a position would earn, without touching any store
    Quote {
        /// Deposit amount
        #[arg(short, long)]
        deposit: Decimal,

        /// Daily rate as a fraction (0.01 = 1%/day)
        #[arg(short, long)]
        rate: Decimal,

        /// Seconds since the last accrual
        #[arg(short, long)]
        elapsed: i64,
    },

    /// Post or audit ledger entries
    Ledger {
        #[command(subcommand)]
        action: LedgerCommands,
    },

    /// Validate and print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum LedgerCommands {
    /// Post a deposit, bonus, withdrawal or purchase
    Post {
        #[command(flatten)]
        store: StoreArgs,

        /// Account id
        #[arg(short, long)]
        account: u64,

        /// Entry kind
        #[arg(short, long, value_enum)]
        kind: PostKind,

        /// Positive amount
        #[arg(long)]
        amount: Decimal,

        /// Currency code
        #[arg(long, default_value = "USDT")]
        currency: String,

        /// External event id (e.g. tx hash); a repeated id is not applied twice
        #[arg(long)]
        dedup_key: Option<String>,
    },

    /// Compare cached balances with their ledger sums
    Audit {
        #[command(flatten)]
        store: StoreArgs,

        /// Only audit this account
        #[arg(short, long)]
        account: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    // Initialize logging
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if cli.json_logs || config.logging.json_output {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Run { store } => commands::run::run(config, store),
        Commands::Tick { store, at } => commands::tick::run(config, store, at),
        Commands::Quote {
            deposit,
            rate,
            elapsed,
        } => commands::quote::run(&config, deposit, rate, elapsed),
        Commands::Ledger { action } => match action {
            LedgerCommands::Post {
                store,
                account,
                kind,
                amount,
                currency,
                dedup_key,
            } => commands::ledger::post(config, store, account, kind, amount, currency, dedup_key),
            LedgerCommands::Audit { store, account } => {
                commands::ledger::audit(config, store, account)
            }
        },
        Commands::Config => commands::config::run(&config),
    }
}
