//! End-to-end engine tests.
//!
//! These drive the scheduler, distributor and updater together against the
//! in-memory store with a manual clock.

use chrono::{DateTime, Duration, TimeZone, Utc};
use farm_core::metrics::EngineMetrics;
use farm_core::store::{AccountStore, MemoryStore};
use farm_core::{
    Account, AccountId, Currency, EntryType, FarmConfig, LedgerUpdater, ManualClock, Position,
    PositionId, PositionKind, ReferralDistributor, RewardEvent, Scheduler, StopReason, MAX_LEVELS,
};
use farm_core::{CreditOutcome, CreditRequest};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;

// =============================================================================
// Fixtures
// =============================================================================

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

fn usdt() -> Currency {
    Currency::new("USDT")
}

struct World {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    updater: Arc<LedgerUpdater>,
    distributor: Arc<ReferralDistributor>,
    scheduler: Scheduler,
}

impl World {
    fn new(config: FarmConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let updater = Arc::new(LedgerUpdater::new(
            store.clone(),
            store.clone(),
            clock.clone(),
        ));
        let distributor = Arc::new(
            ReferralDistributor::new(&config.referral, store.clone(), updater.clone())
                .expect("valid schedule"),
        );
        let scheduler = Scheduler::new(
            &config,
            store.clone(),
            updater.clone(),
            distributor.clone(),
            clock.clone(),
            Arc::new(EngineMetrics::new()),
        );
        Self {
            store,
            clock,
            updater,
            distributor,
            scheduler,
        }
    }

    /// Accounts `1..=count`, each referred by the previous one.
    fn with_chain(self, count: u64) -> Self {
        for id in 1..=count {
            self.store
                .insert_account(Account {
                    id: AccountId(id),
                    balances: Default::default(),
                    referrer: (id > 1).then(|| AccountId(id - 1)),
                    referral_code: format!("ref-{id}"),
                    created_at: t0(),
                })
                .expect("insert account");
        }
        self
    }

    fn stake(&self, id: u64, owner: u64, deposit: Decimal) {
        self.store
            .insert_position(Position {
                id: PositionId(id),
                owner: AccountId(owner),
                kind: PositionKind::Farming,
                currency: usdt(),
                deposit,
                daily_rate: Decimal::new(1, 2),
                last_update: t0(),
                active: true,
                expires_at: None,
            })
            .expect("insert position");
    }

    async fn balance(&self, account: u64) -> Decimal {
        self.store
            .get_account(AccountId(account))
            .await
            .unwrap()
            .unwrap()
            .balance(&usdt())
    }

    /// Every account's cached balance equals its ledger sum.
    fn assert_ledger_consistent(&self) {
        let book = self.store.snapshot().unwrap();
        for account in book.accounts() {
            let totals = book.ledger_totals(account.id);
            for (currency, balance) in &account.balances {
                assert_eq!(
                    Some(balance),
                    totals.get(currency),
                    "account {} drifted in {}",
                    account.id,
                    currency
                );
            }
            for currency in totals.keys() {
                assert!(account.balances.contains_key(currency));
            }
        }
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn first_period_credits_one_period_of_yield() {
    let world = World::new(FarmConfig::default()).with_chain(1);
    world.stake(1, 1, Decimal::new(100, 0));
    world.clock.advance(Duration::minutes(5));

    let report = world.scheduler.run_tick().await.unwrap();

    assert_eq!(report.credited, 1);
    assert_eq!(world.balance(1).await, Decimal::new(347222, 8));
    world.assert_ledger_consistent();
}

#[tokio::test]
async fn two_days_of_downtime_credit_one_day() {
    let world = World::new(FarmConfig::default()).with_chain(1);
    world.stake(1, 1, Decimal::new(100, 0));
    world.clock.advance(Duration::hours(48));

    world.scheduler.run_tick().await.unwrap();

    // 288 periods of 5 minutes: one full day at 1%.
    assert_eq!(world.balance(1).await, Decimal::ONE);
    assert_eq!(world.scheduler.metrics().periods_capped.get(), 1);

    // The capped-away day is forfeited; nothing more is owed right away.
    let again = world.scheduler.run_tick().await.unwrap();
    assert_eq!(again.credited, 0);
    assert_eq!(world.balance(1).await, Decimal::ONE);
}

#[tokio::test]
async fn deep_chain_pays_twenty_levels() {
    let world = World::new(FarmConfig::default()).with_chain(26);
    world.stake(1, 26, Decimal::new(1_000, 0));
    world.clock.advance(Duration::hours(24));

    let report = world.scheduler.run_tick().await.unwrap();

    assert_eq!(report.commissions_written, MAX_LEVELS);
    let book = world.store.snapshot().unwrap();
    let commissions: Vec<_> = book
        .entries()
        .iter()
        .filter(|e| e.entry_type == EntryType::ReferralCommission)
        .collect();
    assert_eq!(commissions.len(), MAX_LEVELS);
    assert!(commissions
        .iter()
        .all(|e| e.source_account == Some(AccountId(26))));
    // Account 5 sits at level 21 and gets nothing.
    assert_eq!(world.balance(5).await, Decimal::ZERO);
    world.assert_ledger_consistent();
}

#[tokio::test]
async fn broken_chain_ends_cleanly() {
    let world = World::new(FarmConfig::default()).with_chain(3);

    let report = world
        .distributor
        .distribute(&RewardEvent {
            source_account: AccountId(3),
            amount: Decimal::new(50, 0),
            currency: usdt(),
            event_type: EntryType::YieldIncome,
            origin_entry: None,
        })
        .await;

    assert_eq!(report.credited.len(), 2);
    assert_eq!(report.stop, StopReason::ChainExhausted);
    assert_eq!(world.balance(2).await, Decimal::new(5, 0));
    assert_eq!(world.balance(1).await, Decimal::new(25, 1));
}

#[tokio::test]
async fn retried_webhook_is_credited_once() {
    let world = World::new(FarmConfig::default()).with_chain(1);
    let deposit = CreditRequest::new(AccountId(1), Decimal::new(40, 0), usdt(), EntryType::Deposit)
        .with_dedup_key("0x9f2c");

    let first = world.updater.credit(deposit.clone()).await.unwrap();
    let second = world.updater.credit(deposit).await.unwrap();

    assert!(matches!(first, CreditOutcome::Written(_)));
    assert!(matches!(second, CreditOutcome::Duplicate(_)));
    assert_eq!(world.store.snapshot().unwrap().entries().len(), 1);
    assert_eq!(world.balance(1).await, Decimal::new(40, 0));
}

#[tokio::test]
async fn purchases_never_pay_referrers() {
    let world = World::new(FarmConfig::default()).with_chain(2);
    world
        .updater
        .credit(CreditRequest::new(AccountId(2), Decimal::new(10, 0), usdt(), EntryType::Deposit))
        .await
        .unwrap();
    let purchase = world
        .updater
        .debit(CreditRequest::new(AccountId(2), Decimal::new(4, 0), usdt(), EntryType::Purchase))
        .await
        .unwrap()
        .into_entry();

    let report = world
        .distributor
        .distribute(&RewardEvent::from_entry(&purchase))
        .await;

    assert_eq!(report.stop, StopReason::NotEligible);
    assert_eq!(world.balance(1).await, Decimal::ZERO);
    assert_eq!(world.balance(2).await, Decimal::new(6, 0));
    world.assert_ledger_consistent();
}

#[tokio::test]
async fn repeated_ticks_accumulate_exactly() {
    let world = World::new(FarmConfig::default()).with_chain(3);
    world.stake(1, 3, Decimal::new(100, 0));
    world.stake(2, 2, Decimal::new(250, 0));

    for _ in 0..12 {
        world.clock.advance(Duration::minutes(5));
        world.scheduler.run_tick().await.unwrap();
    }

    // Twelve single-period credits, each truncated on its own.
    assert_eq!(world.balance(3).await, Decimal::new(347222 * 12, 8));
    let position = world.store.snapshot().unwrap().position(PositionId(1)).cloned();
    assert_eq!(position.unwrap().last_update, t0() + Duration::hours(1));
    world.assert_ledger_consistent();
}

// =============================================================================
// Properties
// =============================================================================

#[derive(Clone, Debug)]
enum Op {
    Credit { account: u64, cents: i64, key: Option<u8> },
    Debit { account: u64, cents: i64 },
    Reward { account: u64, cents: i64 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..=6, 1i64..100_000, proptest::option::of(0u8..8))
            .prop_map(|(account, cents, key)| Op::Credit { account, cents, key }),
        (1u64..=6, 1i64..100_000).prop_map(|(account, cents)| Op::Debit { account, cents }),
        (1u64..=6, 1i64..100_000).prop_map(|(account, cents)| Op::Reward { account, cents }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn balances_always_match_ledger(ops in proptest::collection::vec(op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(async {
            let world = World::new(FarmConfig::default()).with_chain(6);
            for op in ops {
                match op {
                    Op::Credit { account, cents, key } => {
                        let mut request = CreditRequest::new(
                            AccountId(account),
                            Decimal::new(cents, 2),
                            usdt(),
                            EntryType::Bonus,
                        );
                        if let Some(key) = key {
                            request = request.with_dedup_key(format!("bonus-{key}"));
                        }
                        world.updater.credit(request).await.unwrap();
                    }
                    Op::Debit { account, cents } => {
                        // Overdrafts are refused; either way the books stay consistent.
                        let _ = world
                            .updater
                            .debit(CreditRequest::new(
                                AccountId(account),
                                Decimal::new(cents, 2),
                                usdt(),
                                EntryType::Withdrawal,
                            ))
                            .await;
                    }
                    Op::Reward { account, cents } => {
                        let entry = world
                            .updater
                            .credit(CreditRequest::new(
                                AccountId(account),
                                Decimal::new(cents, 2),
                                usdt(),
                                EntryType::YieldIncome,
                            ))
                            .await
                            .unwrap()
                            .into_entry();
                        let report = world
                            .distributor
                            .distribute(&RewardEvent::from_entry(&entry))
                            .await;
                        assert!(report.credited.len() < account as usize);
                    }
                }
                world.assert_ledger_consistent();
            }
            for account in 1..=6 {
                assert!(world.updater.audit_account(AccountId(account)).await.unwrap().is_empty());
            }
        });
    }
}
