//! CLI command implementations

pub mod config;
pub mod ledger;
pub mod quote;
pub mod run;
pub mod tick;

use anyhow::{bail, Context, Result};
use clap::Args;
use farm_adapters::{FarmSeed, JournalStore};
use farm_core::metrics::EngineMetrics;
use farm_core::store::{AccountStore, LedgerStore, PositionStore, ReferralStore};
use farm_core::{Clock, FarmConfig, LedgerUpdater, ReferralDistributor, Scheduler};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where the engine keeps its state.
#[derive(Args, Clone, Debug)]
pub struct StoreArgs {
    /// JSONL journal to open (created if missing)
    #[arg(short, long, env = "FARM_JOURNAL")]
    pub journal: Option<PathBuf>,

    /// Seed file (JSON) with accounts and positions
    #[arg(short, long)]
    pub seed: Option<PathBuf>,
}

/// Load configuration from a file if given, otherwise from the environment.
pub fn load_config(path: Option<&Path>) -> Result<FarmConfig> {
    let config = match path {
        Some(path) => FarmConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => FarmConfig::from_env().context("loading config from environment")?,
    };
    Ok(config)
}

/// Fully wired engine over one store.
pub struct Engine {
    pub updater: Arc<LedgerUpdater>,
    pub scheduler: Scheduler,
    pub metrics: Arc<EngineMetrics>,
    /// Accounts known at open time, for commands that walk all of them.
    pub account_ids: Vec<farm_core::AccountId>,
}

impl Engine {
    pub fn open(config: &FarmConfig, args: &StoreArgs, clock: Arc<dyn Clock>) -> Result<Self> {
        match (&args.journal, &args.seed) {
            (Some(path), seed) => {
                let journal = JournalStore::open(path)
                    .with_context(|| format!("opening journal {}", path.display()))?;
                if let Some(seed) = seed {
                    FarmSeed::from_file(seed)?.apply_to_journal(&journal)?;
                }
                let ids = journal.snapshot()?.accounts().map(|a| a.id).collect();
                Self::wire(config, Arc::new(journal), clock, ids)
            }
            (None, Some(seed)) => {
                let store = FarmSeed::from_file(seed)?.into_memory_store()?;
                let ids = store.snapshot()?.accounts().map(|a| a.id).collect();
                Self::wire(config, Arc::new(store), clock, ids)
            }
            (None, None) => bail!("either --journal or --seed is required"),
        }
    }

    fn wire<S>(
        config: &FarmConfig,
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        account_ids: Vec<farm_core::AccountId>,
    ) -> Result<Self>
    where
        S: AccountStore + PositionStore + LedgerStore + ReferralStore + 'static,
    {
        let metrics = Arc::new(EngineMetrics::new());
        let updater = Arc::new(LedgerUpdater::new(
            store.clone(),
            store.clone(),
            clock.clone(),
        ));
        let distributor = Arc::new(ReferralDistributor::new(
            &config.referral,
            store.clone(),
            updater.clone(),
        )?);
        let scheduler = Scheduler::new(
            config,
            store,
            updater.clone(),
            distributor,
            clock,
            metrics.clone(),
        );
        Ok(Self {
            updater,
            scheduler,
            metrics,
            account_ids,
        })
    }
}
