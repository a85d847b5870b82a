//! Farm core: periodic yield accrual, multi-level referral commissions and the
//! append-only ledger that keeps every balance equal to the sum of its entries.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub mod accrual;
pub mod clock;
pub mod config;
pub mod ledger;
pub mod metrics;
pub mod referral;
pub mod scheduler;
pub mod store;

pub use accrual::{AccrualCalculator, Income};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::FarmConfig;
pub use ledger::{CreditOutcome, CreditRequest, LedgerUpdater};
pub use referral::{DistributionReport, ReferralDistributor, RewardEvent, StopReason};
pub use scheduler::{Scheduler, SchedulerPhase, TickReport};

/// Hard ceiling on referral depth, independent of configuration.
pub const MAX_LEVELS: usize = 20;

/// Decimal places kept on every ledger amount.
pub const LEDGER_SCALE: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub u64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionId(pub u64);

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned ledger entry id. Ids increase with insertion order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Currency ticker (e.g. `"USDT"`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(pub String);

impl Currency {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Player account.
///
/// Balances are a cache of the ledger: for every currency,
/// `balances[c] == Σ entries(account, c)`. Only the ledger updater changes them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    #[serde(default)]
    pub balances: BTreeMap<Currency, Decimal>,
    /// Direct referrer, fixed at creation.
    pub referrer: Option<AccountId>,
    /// Stable code other players sign up with.
    pub referral_code: String,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn balance(&self, currency: &Currency) -> Decimal {
        self.balances.get(currency).copied().unwrap_or(Decimal::ZERO)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionKind {
    Farming,
    /// Time-limited position; accrues only until `expires_at`.
    Boost,
}

/// A staked deposit accruing yield.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub owner: AccountId,
    pub kind: PositionKind,
    pub currency: Currency,
    pub deposit: Decimal,
    /// Yield as a fraction of the deposit per day (0.01 = 1%/day).
    pub daily_rate: Decimal,
    pub last_update: DateTime<Utc>,
    pub active: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    YieldIncome,
    ReferralCommission,
    Deposit,
    Withdrawal,
    Purchase,
    Bonus,
}

impl EntryType {
    /// Whether entries of this type add to the balance.
    pub fn is_credit(self) -> bool {
        matches!(
            self,
            EntryType::YieldIncome
                | EntryType::ReferralCommission
                | EntryType::Deposit
                | EntryType::Bonus
        )
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryType::YieldIncome => "yield_income",
            EntryType::ReferralCommission => "referral_commission",
            EntryType::Deposit => "deposit",
            EntryType::Withdrawal => "withdrawal",
            EntryType::Purchase => "purchase",
            EntryType::Bonus => "bonus",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Completed,
}

/// Immutable ledger record. `amount` is signed: debits are negative.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub account: AccountId,
    pub entry_type: EntryType,
    pub amount: Decimal,
    pub currency: Currency,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
    /// Account whose activity produced this entry (referral audit trail).
    pub source_account: Option<AccountId>,
    /// External event identifier (e.g. an on-chain tx hash).
    pub dedup_key: Option<String>,
    /// Depth in the referral chain for commission entries.
    pub referral_level: Option<u8>,
}

/// Entry as submitted to a store, before an id is assigned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    pub account: AccountId,
    pub entry_type: EntryType,
    pub amount: Decimal,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
    pub source_account: Option<AccountId>,
    pub dedup_key: Option<String>,
    pub referral_level: Option<u8>,
}

impl NewEntry {
    pub fn into_entry(self, id: EntryId) -> LedgerEntry {
        LedgerEntry {
            id,
            account: self.account,
            entry_type: self.entry_type,
            amount: self.amount,
            currency: self.currency,
            status: EntryStatus::Completed,
            created_at: self.created_at,
            source_account: self.source_account,
            dedup_key: self.dedup_key,
            referral_level: self.referral_level,
        }
    }
}

/// Unified error type for farm core operations.
#[derive(Debug, Error)]
pub enum FarmError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Insufficient {currency} balance on account {account}: have {available}, need {requested}")]
    InsufficientBalance {
        account: AccountId,
        currency: Currency,
        available: Decimal,
        requested: Decimal,
    },

    #[error("Income {amount} exceeds bound {bound} for position {position}")]
    IncomeBoundExceeded {
        position: PositionId,
        amount: Decimal,
        bound: Decimal,
    },

    #[error("Invalid commission schedule: {0}")]
    InvalidCommissionSchedule(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl FarmError {
    /// Storage failures are transient from the engine's point of view; the
    /// same call may succeed on the next tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FarmError::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, FarmError>;
