//! `farmd config` command implementation

use anyhow::Result;
use farm_core::referral::CommissionSchedule;
use farm_core::FarmConfig;

pub fn run(config: &FarmConfig) -> Result<()> {
    // load_config already validated; this only reports.
    let schedule = CommissionSchedule::new(config.referral.level_rates.clone())?;
    let total: rust_decimal::Decimal = config.referral.level_rates.iter().sum();

    println!("{}", serde_json::to_string_pretty(config)?);
    eprintln!(
        "Config OK: {}s period, {} referral levels paying up to {} of each reward",
        config.accrual.period_secs,
        schedule.levels().min(config.referral.max_levels),
        total
    );
    Ok(())
}
