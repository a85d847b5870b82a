//! `farmd run` command implementation

use anyhow::Result;
use farm_core::{FarmConfig, SystemClock};
use std::sync::Arc;
use tracing::info;

use super::{Engine, StoreArgs};

pub fn run(config: FarmConfig, store: StoreArgs) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(serve(config, store))
}

async fn serve(config: FarmConfig, store: StoreArgs) -> Result<()> {
    let engine = Engine::open(&config, &store, Arc::new(SystemClock))?;

    engine.scheduler.start();
    info!(
        period_secs = config.accrual.period_secs,
        batch_size = config.scheduler.batch_size,
        "farmd running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, draining");
    engine.scheduler.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&engine.metrics.to_json())?);
    Ok(())
}
