//! Multi-level referral commissions.
//!
//! A reward earned by one account pays a fixed share of the *original* amount
//! to each ancestor in its referral chain, level 1 being the direct referrer.
//! The walk is bounded by `max_levels` (never more than [`MAX_LEVELS`]) and by
//! a visited set, so a corrupted edge store cannot make it loop.
//!
//! Distribution is best-effort per level: a failed credit at one level is
//! logged and the walk moves on.

use crate::config::ReferralConfig;
use crate::ledger::{CreditOutcome, CreditRequest, LedgerUpdater};
use crate::store::ReferralStore;
use crate::{
    AccountId, Currency, EntryId, EntryType, FarmError, LedgerEntry, Result, LEDGER_SCALE,
    MAX_LEVELS,
};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-level commission rates, level 1 first.
///
/// Invariants (checked by [`CommissionSchedule::new`]):
/// - at most `MAX_LEVELS` levels
/// - every rate in `[0, 1]`
/// - non-increasing with depth
/// - total of all levels `<= 1`
#[derive(Clone, Debug, PartialEq)]
pub struct CommissionSchedule {
    rates: Vec<Decimal>,
}

impl CommissionSchedule {
    pub fn new(rates: Vec<Decimal>) -> Result<Self> {
        if rates.len() > MAX_LEVELS {
            return Err(FarmError::InvalidCommissionSchedule(format!(
                "{} levels configured, max {}",
                rates.len(),
                MAX_LEVELS
            )));
        }

        let mut total = Decimal::ZERO;
        for (idx, rate) in rates.iter().enumerate() {
            if *rate < Decimal::ZERO || *rate > Decimal::ONE {
                return Err(FarmError::InvalidCommissionSchedule(format!(
                    "level {} rate {} outside [0, 1]",
                    idx + 1,
                    rate
                )));
            }
            if idx > 0 && *rate > rates[idx - 1] {
                return Err(FarmError::InvalidCommissionSchedule(format!(
                    "level {} rate {} exceeds level {} rate {}",
                    idx + 1,
                    rate,
                    idx,
                    rates[idx - 1]
                )));
            }
            total += *rate;
        }

        if total > Decimal::ONE {
            return Err(FarmError::InvalidCommissionSchedule(format!(
                "levels sum to {total}, more than the reward itself"
            )));
        }

        Ok(Self { rates })
    }

    /// Rate for a 1-based level.
    pub fn rate(&self, level: usize) -> Option<Decimal> {
        level.checked_sub(1).and_then(|idx| self.rates.get(idx)).copied()
    }

    pub fn levels(&self) -> usize {
        self.rates.len()
    }
}

/// An earned reward that may cascade to referrers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RewardEvent {
    pub source_account: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
    pub event_type: EntryType,
    /// Ledger entry that recorded the reward. When present, commissions are
    /// keyed on it so a retried distribution never pays a level twice.
    pub origin_entry: Option<EntryId>,
}

impl RewardEvent {
    pub fn from_entry(entry: &LedgerEntry) -> Self {
        Self {
            source_account: entry.account,
            amount: entry.amount,
            currency: entry.currency.clone(),
            event_type: entry.entry_type,
            origin_entry: Some(entry.id),
        }
    }
}

/// Why a walk ended. None of these are errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The event type or amount does not distribute.
    NotEligible,
    /// An ancestor had no referrer.
    ChainExhausted,
    MaxLevels,
    /// The chain revisited an account already seen in this walk.
    CycleDetected,
    /// The edge store could not be read; the walk cannot continue.
    LookupFailed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LevelFailure {
    pub level: u8,
    pub referrer: AccountId,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistributionReport {
    pub source_account: AccountId,
    pub levels_walked: usize,
    pub credited: Vec<LedgerEntry>,
    /// Levels already paid by an earlier attempt for the same origin entry.
    pub duplicates: usize,
    pub failures: Vec<LevelFailure>,
    pub stop: StopReason,
}

impl DistributionReport {
    fn empty(source_account: AccountId, stop: StopReason) -> Self {
        Self {
            source_account,
            levels_walked: 0,
            credited: Vec::new(),
            duplicates: 0,
            failures: Vec::new(),
            stop,
        }
    }

    pub fn total_paid(&self) -> Decimal {
        self.credited.iter().map(|e| e.amount).sum()
    }
}

pub struct ReferralDistributor {
    referrals: Arc<dyn ReferralStore>,
    updater: Arc<LedgerUpdater>,
    schedule: CommissionSchedule,
    max_levels: usize,
    triggers: HashSet<EntryType>,
}

impl ReferralDistributor {
    pub fn new(
        config: &ReferralConfig,
        referrals: Arc<dyn ReferralStore>,
        updater: Arc<LedgerUpdater>,
    ) -> Result<Self> {
        let schedule = CommissionSchedule::new(config.level_rates.clone())?;
        let mut triggers = HashSet::new();
        for entry_type in &config.trigger_types {
            // Commissions never earn commissions, and spending never earns anything.
            if *entry_type == EntryType::ReferralCommission || !entry_type.is_credit() {
                warn!(%entry_type, "Ignoring entry type that cannot trigger referral rewards");
                continue;
            }
            triggers.insert(*entry_type);
        }

        Ok(Self {
            referrals,
            updater,
            schedule,
            max_levels: config.max_levels.min(MAX_LEVELS),
            triggers,
        })
    }

    pub fn triggers_on(&self, entry_type: EntryType) -> bool {
        self.triggers.contains(&entry_type)
    }

    /// Pay commissions for `event` up the referral chain.
    pub async fn distribute(&self, event: &RewardEvent) -> DistributionReport {
        let source = event.source_account;
        if !self.triggers_on(event.event_type) || event.amount <= Decimal::ZERO {
            debug!(%source, event_type = %event.event_type, "Event does not distribute");
            return DistributionReport::empty(source, StopReason::NotEligible);
        }

        let limit = self.max_levels.min(self.schedule.levels());
        let mut report = DistributionReport::empty(source, StopReason::ChainExhausted);
        let mut visited = HashSet::from([source]);
        let mut current = source;

        report.stop = loop {
            if report.levels_walked >= limit {
                break StopReason::MaxLevels;
            }

            let referrer = match self.referrals.get_referrer(current).await {
                Ok(Some(referrer)) => referrer,
                Ok(None) => break StopReason::ChainExhausted,
                Err(e) => {
                    warn!(
                        %source,
                        account = %current,
                        level = report.levels_walked + 1,
                        error = %e,
                        "Referrer lookup failed, ending walk"
                    );
                    break StopReason::LookupFailed;
                }
            };

            if !visited.insert(referrer) {
                warn!(%source, %referrer, level = report.levels_walked + 1, "Referral cycle detected");
                break StopReason::CycleDetected;
            }

            report.levels_walked += 1;
            let level = report.levels_walked;
            current = referrer;

            let rate = self.schedule.rate(level).unwrap_or(Decimal::ZERO);
            let commission = (event.amount * rate)
                .round_dp_with_strategy(LEDGER_SCALE, RoundingStrategy::ToZero);
            if commission <= Decimal::ZERO {
                debug!(%source, %referrer, level, "Commission rounds to zero");
                continue;
            }

            let mut request = CreditRequest::new(
                referrer,
                commission,
                event.currency.clone(),
                EntryType::ReferralCommission,
            )
            .with_source(source)
            .with_level(level as u8);
            if let Some(origin) = event.origin_entry {
                request = request.with_dedup_key(format!("commission:{origin}:{level}"));
            }

            match self.updater.credit(request).await {
                Ok(CreditOutcome::Written(entry)) => report.credited.push(entry),
                Ok(CreditOutcome::Duplicate(_)) => report.duplicates += 1,
                Err(e) => {
                    warn!(
                        %source,
                        %referrer,
                        level,
                        amount = %commission,
                        currency = %event.currency,
                        event_type = %event.event_type,
                        error = %e,
                        "Commission credit failed"
                    );
                    report.failures.push(LevelFailure {
                        level: level as u8,
                        referrer,
                        error: e.to_string(),
                    });
                }
            }
        };

        if !report.credited.is_empty() {
            info!(
                %source,
                levels = report.levels_walked,
                paid = %report.total_paid(),
                stop = ?report.stop,
                "Referral commissions distributed"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, ReferralStore};
    use crate::Account;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    fn usdt() -> Currency {
        Currency::new("USDT")
    }

    /// Store with `count` accounts where account `n` is referred by `n - 1`.
    fn chain(count: u64) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for id in 1..=count {
            store
                .insert_account(Account {
                    id: AccountId(id),
                    balances: Default::default(),
                    referrer: (id > 1).then(|| AccountId(id - 1)),
                    referral_code: format!("code{id}"),
                    created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                })
                .unwrap();
        }
        store
    }

    fn distributor(
        store: Arc<MemoryStore>,
        referrals: Arc<dyn ReferralStore>,
        config: &ReferralConfig,
    ) -> ReferralDistributor {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap(),
        ));
        let updater = Arc::new(LedgerUpdater::new(store.clone(), store, clock));
        ReferralDistributor::new(config, referrals, updater).unwrap()
    }

    fn event(source: u64, amount: Decimal) -> RewardEvent {
        RewardEvent {
            source_account: AccountId(source),
            amount,
            currency: usdt(),
            event_type: EntryType::YieldIncome,
            origin_entry: None,
        }
    }

    struct MapReferrals(HashMap<u64, u64>);

    #[async_trait]
    impl ReferralStore for MapReferrals {
        async fn get_referrer(&self, account: AccountId) -> Result<Option<AccountId>> {
            Ok(self.0.get(&account.0).copied().map(AccountId))
        }
    }

    #[test]
    fn schedule_rejects_bad_tables() {
        assert!(CommissionSchedule::new(vec![Decimal::new(1, 1), Decimal::new(2, 1)]).is_err());
        assert!(CommissionSchedule::new(vec![Decimal::new(-1, 2)]).is_err());
        assert!(CommissionSchedule::new(vec![Decimal::new(6, 1), Decimal::new(6, 1)]).is_err());
        assert!(CommissionSchedule::new(vec![Decimal::new(1, 2); MAX_LEVELS + 1]).is_err());
        assert!(CommissionSchedule::new(vec![]).is_ok());
    }

    #[test]
    fn schedule_levels_are_one_based() {
        let schedule = CommissionSchedule::new(vec![Decimal::new(1, 1)]).unwrap();
        assert_eq!(schedule.rate(0), None);
        assert_eq!(schedule.rate(1), Some(Decimal::new(1, 1)));
        assert_eq!(schedule.rate(2), None);
    }

    #[tokio::test]
    async fn deep_chain_stops_at_max_levels() {
        let store = chain(26);
        let dist = distributor(store.clone(), store.clone(), &ReferralConfig::default());

        let report = dist.distribute(&event(26, Decimal::new(100, 0))).await;

        assert_eq!(report.credited.len(), MAX_LEVELS);
        assert_eq!(report.stop, StopReason::MaxLevels);
        let paid: Vec<u64> = report.credited.iter().map(|e| e.account.0).collect();
        assert_eq!(paid, (6..=25).rev().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn chain_broken_at_level_three_pays_two_levels() {
        let store = chain(3);
        let dist = distributor(store.clone(), store.clone(), &ReferralConfig::default());

        let report = dist.distribute(&event(3, Decimal::new(100, 0))).await;

        assert_eq!(report.credited.len(), 2);
        assert_eq!(report.stop, StopReason::ChainExhausted);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn commissions_use_original_amount() {
        let store = chain(3);
        let dist = distributor(store.clone(), store.clone(), &ReferralConfig::default());

        let report = dist.distribute(&event(3, Decimal::new(100, 0))).await;

        let first = &report.credited[0];
        let second = &report.credited[1];
        assert_eq!(first.amount, Decimal::new(10, 0));
        assert_eq!(first.referral_level, Some(1));
        assert_eq!(first.source_account, Some(AccountId(3)));
        assert_eq!(first.entry_type, EntryType::ReferralCommission);
        // 5% of 100, not 5% of the level-1 payout.
        assert_eq!(second.amount, Decimal::new(5, 0));
        assert_eq!(second.referral_level, Some(2));
    }

    #[tokio::test]
    async fn cycle_is_cut_without_revisiting() {
        let store = chain(3);
        let referrals = Arc::new(MapReferrals(HashMap::from([(1, 2), (2, 3), (3, 1)])));
        let dist = distributor(store, referrals, &ReferralConfig::default());

        let report = dist.distribute(&event(1, Decimal::new(100, 0))).await;

        assert_eq!(report.stop, StopReason::CycleDetected);
        let paid: Vec<u64> = report.credited.iter().map(|e| e.account.0).collect();
        assert_eq!(paid, vec![2, 3]);
    }

    #[tokio::test]
    async fn purchases_do_not_distribute() {
        let store = chain(3);
        let dist = distributor(store.clone(), store.clone(), &ReferralConfig::default());
        let mut purchase = event(3, Decimal::new(100, 0));
        purchase.event_type = EntryType::Purchase;

        let report = dist.distribute(&purchase).await;

        assert_eq!(report.stop, StopReason::NotEligible);
        assert!(report.credited.is_empty());
        assert!(store.snapshot().unwrap().entries().is_empty());
    }

    #[tokio::test]
    async fn commission_triggers_are_filtered_out() {
        let store = chain(2);
        let config = ReferralConfig {
            trigger_types: vec![EntryType::ReferralCommission, EntryType::Purchase],
            ..ReferralConfig::default()
        };
        let dist = distributor(store.clone(), store, &config);

        assert!(!dist.triggers_on(EntryType::ReferralCommission));
        assert!(!dist.triggers_on(EntryType::Purchase));
    }

    #[tokio::test]
    async fn retry_with_origin_entry_pays_once() {
        let store = chain(3);
        let dist = distributor(store.clone(), store.clone(), &ReferralConfig::default());
        let mut reward = event(3, Decimal::new(100, 0));
        reward.origin_entry = Some(EntryId(42));

        let first = dist.distribute(&reward).await;
        let second = dist.distribute(&reward).await;

        assert_eq!(first.credited.len(), 2);
        assert!(second.credited.is_empty());
        assert_eq!(second.duplicates, 2);
        assert_eq!(store.snapshot().unwrap().entries().len(), 2);
    }

    #[tokio::test]
    async fn failed_level_does_not_stop_walk() {
        // Level 1 referrer (account 9) does not exist in the account store.
        let store = chain(3);
        let referrals = Arc::new(MapReferrals(HashMap::from([(3, 9), (9, 1)])));
        let dist = distributor(store, referrals, &ReferralConfig::default());

        let report = dist.distribute(&event(3, Decimal::new(100, 0))).await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].level, 1);
        assert_eq!(report.credited.len(), 1);
        assert_eq!(report.credited[0].account, AccountId(1));
        assert_eq!(report.credited[0].referral_level, Some(2));
    }

    #[tokio::test]
    async fn dust_commissions_are_skipped() {
        let store = chain(2);
        let dist = distributor(store.clone(), store.clone(), &ReferralConfig::default());

        let report = dist.distribute(&event(2, Decimal::new(1, 8))).await;

        assert_eq!(report.levels_walked, 1);
        assert!(report.credited.is_empty());
        assert!(report.failures.is_empty());
    }
}
