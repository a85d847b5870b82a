//! Accrual calculator: position snapshot + now -> bounded income.
//!
//! The calculator is pure. Two independent caps bound what a single tick can
//! release, no matter how long the position went unprocessed:
//! - `max_periods`: elapsed whole periods beyond this are forfeited
//! - `max_single_amount`: hard ceiling on the credited amount
//!
//! Both caps clamp and log; neither rejects.

use crate::config::AccrualConfig;
use crate::{AccountId, Currency, FarmError, Position, PositionId, Result, LEDGER_SCALE};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const SECONDS_PER_DAY: i64 = 86_400;

/// Result of one accrual computation, including the inputs it was derived from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Income {
    pub position: PositionId,
    pub owner: AccountId,
    pub currency: Currency,
    pub amount: Decimal,
    /// Periods actually paid for (`<= max_periods`).
    pub effective_periods: u32,
    /// Whole periods elapsed since `last_update`, before capping.
    pub elapsed_periods: u64,
    pub deposit: Decimal,
    pub daily_rate: Decimal,
    pub last_update: DateTime<Utc>,
    /// New `last_update` once this income is credited. Covers every elapsed
    /// whole period, so a partial period carries over to the next tick.
    pub accrued_until: DateTime<Utc>,
    pub periods_capped: bool,
    pub amount_capped: bool,
}

#[derive(Clone, Debug)]
pub struct AccrualCalculator {
    period_secs: i64,
    max_periods: u32,
    max_single_amount: Decimal,
}

impl AccrualCalculator {
    pub fn new(config: &AccrualConfig) -> Self {
        Self {
            period_secs: config.period_secs.max(1) as i64,
            max_periods: config.max_periods,
            max_single_amount: config.max_single_amount.normalize(),
        }
    }

    pub fn period(&self) -> Duration {
        Duration::seconds(self.period_secs)
    }

    pub fn max_periods(&self) -> u32 {
        self.max_periods
    }

    pub fn max_single_amount(&self) -> Decimal {
        self.max_single_amount
    }

    pub fn periods_per_day(&self) -> Decimal {
        Decimal::from(SECONDS_PER_DAY) / Decimal::from(self.period_secs)
    }

    /// Compute the income owed to `position` at `now`.
    ///
    /// Returns `None` when there is nothing to credit: non-positive deposit or
    /// rate, less than one full period elapsed, or an amount that truncates to
    /// zero at ledger scale (the position keeps accumulating).
    pub fn calculate_income(&self, position: &Position, now: DateTime<Utc>) -> Option<Income> {
        if position.deposit <= Decimal::ZERO {
            debug!(position = %position.id, deposit = %position.deposit, "Skipping empty position");
            return None;
        }
        if position.daily_rate <= Decimal::ZERO {
            debug!(position = %position.id, rate = %position.daily_rate, "Skipping zero-rate position");
            return None;
        }

        let horizon = match position.expires_at {
            Some(expires_at) if expires_at < now => expires_at,
            _ => now,
        };
        let elapsed_secs = horizon
            .signed_duration_since(position.last_update)
            .num_seconds();
        if elapsed_secs < self.period_secs {
            return None;
        }

        let elapsed_periods = (elapsed_secs / self.period_secs) as u64;
        let periods_capped = elapsed_periods > u64::from(self.max_periods);
        let effective_periods = if periods_capped {
            warn!(
                position = %position.id,
                owner = %position.owner,
                elapsed_periods,
                max_periods = self.max_periods,
                "Clamping accrual periods"
            );
            self.max_periods
        } else {
            elapsed_periods as u32
        };

        let (mut amount, overflowed) = self.raw_amount(position, effective_periods);
        let mut amount_capped = overflowed;
        if amount > self.max_single_amount {
            amount_capped = true;
        }
        if amount_capped {
            warn!(
                position = %position.id,
                owner = %position.owner,
                computed = %amount,
                cap = %self.max_single_amount,
                "Clamping accrual amount"
            );
            amount = self.max_single_amount;
        }

        if amount <= Decimal::ZERO {
            return None;
        }

        let accrued_until =
            position.last_update + Duration::seconds(elapsed_periods as i64 * self.period_secs);

        Some(Income {
            position: position.id,
            owner: position.owner,
            currency: position.currency.clone(),
            amount,
            effective_periods,
            elapsed_periods,
            deposit: position.deposit,
            daily_rate: position.daily_rate,
            last_update: position.last_update,
            accrued_until,
            periods_capped,
            amount_capped,
        })
    }

    /// `deposit * rate * periods / periods_per_day`, truncated to ledger scale.
    /// The flag reports arithmetic overflow, in which case the amount is the
    /// single-credit ceiling.
    fn raw_amount(&self, position: &Position, periods: u32) -> (Decimal, bool) {
        let numerator = position
            .deposit
            .checked_mul(position.daily_rate)
            .and_then(|v| v.checked_mul(Decimal::from(periods)))
            .and_then(|v| v.checked_mul(Decimal::from(self.period_secs)));

        match numerator.and_then(|n| n.checked_div(Decimal::from(SECONDS_PER_DAY))) {
            Some(amount) => (
                amount.round_dp_with_strategy(LEDGER_SCALE, RoundingStrategy::ToZero),
                false,
            ),
            None => (self.max_single_amount, true),
        }
    }

    /// Independent sanity check on a computed income.
    ///
    /// Re-derives the theoretical daily maximum `deposit * rate` (scaled by the
    /// number of days the effective periods span, at least one) and rejects any
    /// amount above it, along with anything outside the configured caps.
    pub fn validate(&self, income: &Income) -> Result<()> {
        if income.amount <= Decimal::ZERO {
            return Err(FarmError::InvalidAmount(income.amount));
        }

        if income.effective_periods > self.max_periods {
            return Err(FarmError::InvalidInput(format!(
                "position {} credited {} periods, max {}",
                income.position, income.effective_periods, self.max_periods
            )));
        }

        if income.amount > self.max_single_amount {
            return Err(FarmError::IncomeBoundExceeded {
                position: income.position,
                amount: income.amount,
                bound: self.max_single_amount,
            });
        }

        let covered_secs = i64::from(income.effective_periods) * self.period_secs;
        let days = ((covered_secs + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY).max(1);
        let bound = income
            .deposit
            .checked_mul(income.daily_rate)
            .and_then(|v| v.checked_mul(Decimal::from(days)))
            .unwrap_or(Decimal::MAX);

        if income.amount > bound {
            return Err(FarmError::IncomeBoundExceeded {
                position: income.position,
                amount: income.amount,
                bound,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PositionKind;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn calculator() -> AccrualCalculator {
        AccrualCalculator::new(&AccrualConfig::default())
    }

    fn position(deposit: Decimal, rate: Decimal) -> Position {
        Position {
            id: PositionId(1),
            owner: AccountId(7),
            kind: PositionKind::Farming,
            currency: Currency::new("USDT"),
            deposit,
            daily_rate: rate,
            last_update: t0(),
            active: true,
            expires_at: None,
        }
    }

    #[test]
    fn one_period_pays_one_288th_of_daily_yield() {
        let calc = calculator();
        let pos = position(Decimal::new(100, 0), Decimal::new(1, 2));

        let income = calc
            .calculate_income(&pos, t0() + Duration::minutes(5))
            .expect("one period elapsed");

        assert_eq!(income.effective_periods, 1);
        assert_eq!(income.amount, Decimal::new(347_222, 8));
        assert_eq!(income.accrued_until, t0() + Duration::minutes(5));
        assert!(calc.validate(&income).is_ok());
    }

    #[test]
    fn catch_up_is_capped_at_max_periods() {
        let calc = calculator();
        let pos = position(Decimal::new(100, 0), Decimal::new(1, 2));

        let income = calc
            .calculate_income(&pos, t0() + Duration::hours(48))
            .expect("periods elapsed");

        assert_eq!(income.elapsed_periods, 576);
        assert_eq!(income.effective_periods, 288);
        assert!(income.periods_capped);
        assert_eq!(income.amount, Decimal::new(1, 0));
        // Forfeited periods are not carried over.
        assert_eq!(income.accrued_until, t0() + Duration::hours(48));
    }

    #[test]
    fn partial_period_carries_over() {
        let calc = calculator();
        let pos = position(Decimal::new(100, 0), Decimal::new(1, 2));

        let income = calc
            .calculate_income(&pos, t0() + Duration::seconds(11 * 60 + 30))
            .unwrap();

        assert_eq!(income.effective_periods, 2);
        assert_eq!(income.accrued_until, t0() + Duration::minutes(10));
    }

    #[test]
    fn empty_or_idle_positions_yield_nothing() {
        let calc = calculator();
        let later = t0() + Duration::hours(1);

        assert!(calc
            .calculate_income(&position(Decimal::ZERO, Decimal::new(1, 2)), later)
            .is_none());
        assert!(calc
            .calculate_income(&position(Decimal::new(-5, 0), Decimal::new(1, 2)), later)
            .is_none());
        assert!(calc
            .calculate_income(&position(Decimal::new(100, 0), Decimal::ZERO), later)
            .is_none());
        assert!(calc
            .calculate_income(
                &position(Decimal::new(100, 0), Decimal::new(1, 2)),
                t0() + Duration::minutes(4)
            )
            .is_none());
    }

    #[test]
    fn clock_skew_backwards_yields_nothing() {
        let calc = calculator();
        let pos = position(Decimal::new(100, 0), Decimal::new(1, 2));
        assert!(calc
            .calculate_income(&pos, t0() - Duration::hours(3))
            .is_none());
    }

    #[test]
    fn boost_accrues_only_until_expiry() {
        let calc = calculator();
        let mut pos = position(Decimal::new(100, 0), Decimal::new(1, 2));
        pos.kind = PositionKind::Boost;
        pos.expires_at = Some(t0() + Duration::minutes(15));

        let income = calc
            .calculate_income(&pos, t0() + Duration::hours(2))
            .unwrap();

        assert_eq!(income.effective_periods, 3);
        assert_eq!(income.accrued_until, t0() + Duration::minutes(15));
    }

    #[test]
    fn single_amount_cap_clamps() {
        let calc = AccrualCalculator::new(&AccrualConfig {
            max_single_amount: Decimal::new(5, 0),
            ..AccrualConfig::default()
        });
        let pos = position(Decimal::new(1_000_000, 0), Decimal::new(1, 2));

        let income = calc
            .calculate_income(&pos, t0() + Duration::minutes(5))
            .unwrap();

        assert!(income.amount_capped);
        assert_eq!(income.amount, Decimal::new(5, 0));
        assert!(calc.validate(&income).is_ok());
    }

    #[test]
    fn clamped_amount_stays_within_ledger_scale() {
        let calc = AccrualCalculator::new(&AccrualConfig {
            max_single_amount: Decimal::new(5_000_000_000_000, 12),
            ..AccrualConfig::default()
        });
        let pos = position(Decimal::new(1_000_000, 0), Decimal::new(1, 2));

        let income = calc
            .calculate_income(&pos, t0() + Duration::minutes(5))
            .unwrap();

        assert!(income.amount_capped);
        assert_eq!(income.amount, Decimal::new(5, 0));
        assert!(income.amount.scale() <= LEDGER_SCALE);
    }

    #[test]
    fn overflow_clamps_to_single_cap() {
        let calc = calculator();
        let pos = position(Decimal::MAX, Decimal::new(5, 0));

        let income = calc
            .calculate_income(&pos, t0() + Duration::minutes(5))
            .unwrap();

        assert!(income.amount_capped);
        assert_eq!(income.amount, calc.max_single_amount());
    }

    #[test]
    fn validate_rejects_amount_above_daily_bound() {
        let calc = calculator();
        let pos = position(Decimal::new(100, 0), Decimal::new(1, 2));
        let mut income = calc
            .calculate_income(&pos, t0() + Duration::minutes(5))
            .unwrap();

        income.amount = Decimal::new(2, 0);

        assert!(matches!(
            calc.validate(&income),
            Err(FarmError::IncomeBoundExceeded { .. })
        ));
    }

    #[test]
    fn validate_rejects_excess_periods() {
        let calc = calculator();
        let pos = position(Decimal::new(100, 0), Decimal::new(1, 2));
        let mut income = calc
            .calculate_income(&pos, t0() + Duration::minutes(5))
            .unwrap();

        income.effective_periods = 289;

        assert!(matches!(
            calc.validate(&income),
            Err(FarmError::InvalidInput(_))
        ));
    }

    proptest! {
        #[test]
        fn income_is_pure_and_bounded(
            deposit_cents in 1i64..1_000_000_000,
            rate_bps in 1i64..10_000,
            elapsed_secs in 0i64..(30 * 86_400),
        ) {
            let calc = calculator();
            let pos = position(Decimal::new(deposit_cents, 2), Decimal::new(rate_bps, 4));
            let now = t0() + Duration::seconds(elapsed_secs);

            let first = calc.calculate_income(&pos, now);
            let second = calc.calculate_income(&pos, now);
            prop_assert_eq!(&first, &second);

            if let Some(income) = first {
                prop_assert!(income.effective_periods <= calc.max_periods());
                prop_assert!(income.amount <= calc.max_single_amount());
                prop_assert!(income.accrued_until <= now);
                prop_assert!(income.accrued_until > pos.last_update);
                prop_assert!(calc.validate(&income).is_ok());
            }
        }
    }
}
