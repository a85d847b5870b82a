//! `farmd quote` command implementation

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use farm_core::{
    AccountId, AccrualCalculator, Currency, FarmConfig, Income, Position, PositionId,
    PositionKind,
};
use rust_decimal::Decimal;

pub fn run(config: &FarmConfig, deposit: Decimal, rate: Decimal, elapsed: i64) -> Result<()> {
    match quote(config, deposit, rate, elapsed)? {
        Some(income) => println!("{}", serde_json::to_string_pretty(&income)?),
        None => println!(
            "Nothing owed: {}s of a {}s period elapsed",
            elapsed, config.accrual.period_secs
        ),
    }
    Ok(())
}

/// Income a fresh position would be credited after `elapsed` seconds.
fn quote(
    config: &FarmConfig,
    deposit: Decimal,
    rate: Decimal,
    elapsed: i64,
) -> Result<Option<Income>> {
    if elapsed < 0 {
        bail!("elapsed must not be negative");
    }

    let last_update = Utc::now();
    let now = Duration::try_seconds(elapsed)
        .and_then(|span| last_update.checked_add_signed(span))
        .with_context(|| format!("elapsed of {elapsed}s is out of range"))?;

    let calculator = AccrualCalculator::new(&config.accrual);
    let position = Position {
        id: PositionId(0),
        owner: AccountId(0),
        kind: PositionKind::Farming,
        currency: Currency::new("QUOTE"),
        deposit,
        daily_rate: rate,
        last_update,
        active: true,
        expires_at: None,
    };

    match calculator.calculate_income(&position, now) {
        Some(income) => {
            calculator.validate(&income)?;
            Ok(Some(income))
        }
        None => Ok(None),
    }
}
