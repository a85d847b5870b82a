//! Configuration management for the farm engine.
//!
//! Configuration can be loaded from:
//! - Environment variables (prefixed with `FARM_`)
//! - JSON configuration files
//! - Programmatic defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use farm_core::config::FarmConfig;
//!
//! let config = FarmConfig::builder()
//!     .period_secs(300)
//!     .max_periods(288)
//!     .build()?;
//! ```

use crate::referral::CommissionSchedule;
use crate::{EntryType, FarmError, Result, LEDGER_SCALE, MAX_LEVELS};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

const SECONDS_PER_DAY: u64 = 86_400;

/// Complete engine configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmConfig {
    pub accrual: AccrualConfig,
    pub referral: ReferralConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
}

impl FarmConfig {
    pub fn builder() -> FarmConfigBuilder {
        FarmConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// Recognised variables:
    /// - `FARM_PERIOD_SECS` - Accrual period and tick interval in seconds
    /// - `FARM_MAX_PERIODS` - Maximum periods credited by a single tick
    /// - `FARM_MAX_SINGLE_AMOUNT` - Hard ceiling on one accrual credit
    /// - `FARM_MAX_LEVELS` - Referral depth walked per reward
    /// - `FARM_BATCH_SIZE` - Positions fetched per page
    /// - `FARM_LOG_LEVEL` - Logging level (trace, debug, info, warn, error)
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file, then apply `FARM_*` overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FarmError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config: FarmConfig = serde_json::from_str(&raw).map_err(|e| {
            FarmError::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_parse::<u64>("FARM_PERIOD_SECS")? {
            self.accrual.period_secs = v;
        }
        if let Some(v) = env_parse::<u32>("FARM_MAX_PERIODS")? {
            self.accrual.max_periods = v;
        }
        if let Some(v) = env_parse::<Decimal>("FARM_MAX_SINGLE_AMOUNT")? {
            self.accrual.max_single_amount = v;
        }
        if let Some(v) = env_parse::<usize>("FARM_MAX_LEVELS")? {
            self.referral.max_levels = v;
        }
        if let Some(v) = env_parse::<usize>("FARM_BATCH_SIZE")? {
            self.scheduler.batch_size = v;
        }
        if let Ok(level) = std::env::var("FARM_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.accrual.period_secs == 0 || self.accrual.period_secs > SECONDS_PER_DAY {
            return Err(FarmError::ConfigError(
                "period_secs must be between 1 and 86400".into(),
            ));
        }

        if self.accrual.max_periods == 0 {
            return Err(FarmError::ConfigError(
                "max_periods must be greater than 0".into(),
            ));
        }

        if self.accrual.max_single_amount <= Decimal::ZERO {
            return Err(FarmError::ConfigError(
                "max_single_amount must be positive".into(),
            ));
        }

        if self.accrual.max_single_amount.normalize().scale() > LEDGER_SCALE {
            return Err(FarmError::ConfigError(format!(
                "max_single_amount must have at most {} decimal places",
                LEDGER_SCALE
            )));
        }

        if self.referral.max_levels > MAX_LEVELS {
            return Err(FarmError::ConfigError(format!(
                "max_levels must be at most {}",
                MAX_LEVELS
            )));
        }

        CommissionSchedule::new(self.referral.level_rates.clone())
            .map_err(|e| FarmError::ConfigError(e.to_string()))?;

        if self.scheduler.batch_size == 0 || self.scheduler.batch_size > 10_000 {
            return Err(FarmError::ConfigError(
                "batch_size must be between 1 and 10000".into(),
            ));
        }

        Ok(())
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| FarmError::ConfigError(format!("Invalid {}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

/// Accrual timing and anti-abuse caps.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AccrualConfig {
    /// Length of one accrual period; also the scheduler tick interval.
    pub period_secs: u64,

    /// Most periods a single tick may credit (catch-up ceiling).
    pub max_periods: u32,

    /// Hard ceiling on one accrual credit.
    pub max_single_amount: Decimal,
}

impl AccrualConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

impl Default for AccrualConfig {
    fn default() -> Self {
        Self {
            period_secs: 300,        // 5 minutes
            max_periods: 288,        // 24h of 5-minute periods
            max_single_amount: Decimal::new(1_000, 0),
        }
    }
}

/// Referral commission settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferralConfig {
    /// Levels walked per reward event (never more than `MAX_LEVELS`).
    pub max_levels: usize,

    /// Fraction of the original reward paid at each level, level 1 first.
    pub level_rates: Vec<Decimal>,

    /// Ledger entry types whose rewards cascade to referrers.
    pub trigger_types: Vec<EntryType>,
}

impl Default for ReferralConfig {
    fn default() -> Self {
        let mut level_rates = vec![
            Decimal::new(10, 2),
            Decimal::new(5, 2),
            Decimal::new(3, 2),
            Decimal::new(2, 2),
            Decimal::new(1, 2),
        ];
        level_rates.resize(MAX_LEVELS, Decimal::new(5, 3));

        Self {
            max_levels: MAX_LEVELS,
            level_rates,
            trigger_types: vec![EntryType::YieldIncome],
        }
    }
}

/// Sweep settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Positions fetched per page.
    pub batch_size: usize,

    /// Fire one tick as soon as the scheduler starts.
    pub run_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            run_on_start: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    /// JSON output format.
    pub json_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json_output: false,
        }
    }
}

#[derive(Default)]
pub struct FarmConfigBuilder {
    config: FarmConfig,
}

impl FarmConfigBuilder {
    pub fn period_secs(mut self, secs: u64) -> Self {
        self.config.accrual.period_secs = secs;
        self
    }

    pub fn max_periods(mut self, max: u32) -> Self {
        self.config.accrual.max_periods = max;
        self
    }

    pub fn max_single_amount(mut self, amount: Decimal) -> Self {
        self.config.accrual.max_single_amount = amount;
        self
    }

    pub fn max_levels(mut self, levels: usize) -> Self {
        self.config.referral.max_levels = levels;
        self
    }

    pub fn level_rates(mut self, rates: Vec<Decimal>) -> Self {
        self.config.referral.level_rates = rates;
        self
    }

    pub fn trigger_types(mut self, types: Vec<EntryType>) -> Self {
        self.config.referral.trigger_types = types;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.scheduler.batch_size = size;
        self
    }

    pub fn run_on_start(mut self, enabled: bool) -> Self {
        self.config.scheduler.run_on_start = enabled;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn json_logs(mut self, enabled: bool) -> Self {
        self.config.logging.json_output = enabled;
        self
    }

    pub fn build(self) -> Result<FarmConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = FarmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.referral.level_rates.len(), MAX_LEVELS);
        assert_eq!(config.accrual.period(), Duration::from_secs(300));
    }

    #[test]
    fn builder_creates_valid_config() {
        let config = FarmConfig::builder()
            .period_secs(60)
            .max_periods(1440)
            .batch_size(10)
            .log_level("debug")
            .build()
            .expect("should build");

        assert_eq!(config.accrual.period_secs, 60);
        assert_eq!(config.accrual.max_periods, 1440);
        assert_eq!(config.scheduler.batch_size, 10);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn zero_period_rejected() {
        assert!(FarmConfig::builder().period_secs(0).build().is_err());
    }

    #[test]
    fn too_many_levels_rejected() {
        let result = FarmConfig::builder().max_levels(MAX_LEVELS + 1).build();
        assert!(matches!(result, Err(FarmError::ConfigError(_))));
    }

    #[test]
    fn increasing_schedule_rejected() {
        let result = FarmConfig::builder()
            .level_rates(vec![Decimal::new(1, 2), Decimal::new(2, 2)])
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn non_positive_single_cap_rejected() {
        let result = FarmConfig::builder()
            .max_single_amount(Decimal::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn single_cap_finer_than_ledger_scale_rejected() {
        let result = FarmConfig::builder()
            .max_single_amount(Decimal::new(1, 9))
            .build();
        assert!(matches!(result, Err(FarmError::ConfigError(_))));

        // Trailing zeros beyond the ledger scale are harmless.
        assert!(FarmConfig::builder()
            .max_single_amount(Decimal::new(1_000_000_000, 9))
            .build()
            .is_ok());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: FarmConfig =
            serde_json::from_str(r#"{"accrual": {"max_periods": 12}}"#).unwrap();
        assert_eq!(config.accrual.max_periods, 12);
        assert_eq!(config.accrual.period_secs, 300);
        assert_eq!(config.referral.trigger_types, vec![EntryType::YieldIncome]);
    }
}
