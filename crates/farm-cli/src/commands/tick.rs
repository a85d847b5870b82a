//! `farmd tick` command implementation

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use farm_core::{Clock, FarmConfig, ManualClock, SystemClock};
use std::sync::Arc;

use super::{Engine, StoreArgs};

pub fn run(config: FarmConfig, store: StoreArgs, at: Option<DateTime<Utc>>) -> Result<()> {
    let clock: Arc<dyn Clock> = match at {
        Some(at) => Arc::new(ManualClock::new(at)),
        None => Arc::new(SystemClock),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let engine = Engine::open(&config, &store, clock)?;
        let Some(report) = engine.scheduler.run_tick().await else {
            bail!("a tick is already in flight");
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    })
}
