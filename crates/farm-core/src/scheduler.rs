//! Periodic accrual sweep.
//!
//! # Phases
//!
//! ```text
//!   Idle ──run_tick──▶ Running ──done──▶ Idle
//!                         │
//!                       stop
//!                         ▼
//!                     Stopping ──done──▶ Idle
//! ```
//!
//! A tick requested while another is in flight (`Running` or `Stopping`) is
//! dropped, never queued. The phase lives behind a std mutex that is only held
//! for the transition itself, never across an `.await`.
//!
//! Per position, in order:
//! 1. compute and validate the income owed
//! 2. credit the owner (`YieldIncome`), keyed by position and `last_update`
//! 3. advance `last_update`, only once the credit is committed
//! 4. distribute referral commissions for the credited entry
//!
//! If step 3 fails, the next tick finds the keyed entry instead of paying the
//! window again, then retries the advance and the distribution.
//! 5. deactivate the position if it expired or was emptied
//!
//! A failure at any step is logged and counted; the sweep moves on to the next
//! position.

use crate::accrual::{AccrualCalculator, Income};
use crate::clock::Clock;
use crate::config::{FarmConfig, SchedulerConfig};
use crate::ledger::{CreditOutcome, CreditRequest, LedgerUpdater};
use crate::metrics::{EngineMetrics, TickTimer};
use crate::referral::{ReferralDistributor, RewardEvent};
use crate::store::PositionStore;
use crate::{Currency, EntryType, FarmError, LedgerEntry, Position, PositionId, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    Idle,
    /// A tick is in flight.
    Running,
    /// Stop requested while a tick was in flight; it drains, then `Idle`.
    Stopping,
}

/// Outcome of one sweep.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    pub started_at: Option<DateTime<Utc>>,
    pub scanned: usize,
    pub credited: usize,
    /// Positions with nothing owed this tick.
    pub skipped: usize,
    pub deactivated: usize,
    pub failed: usize,
    pub commissions_written: usize,
    pub commission_failures: usize,
    /// Windows an earlier tick already credited but never settled.
    pub resumed: usize,
    pub total_credited: BTreeMap<Currency, Decimal>,
    /// Set when a page could not be fetched; later positions were not visited.
    pub aborted: bool,
}

#[derive(Default)]
struct PositionOutcome {
    credited: Option<(Currency, Decimal)>,
    /// An earlier tick's credit for this window was found and settled.
    resumed: bool,
    commissions: usize,
    commission_failures: usize,
    deactivated: bool,
    /// Set when the credit went through but `last_update` could not be moved.
    failure: Option<FarmError>,
}

/// Dedup key for the credit of the window starting at `last_update`.
fn accrual_key(position: &Position) -> String {
    format!(
        "accrual:{}:{}",
        position.id,
        position.last_update.to_rfc3339_opts(SecondsFormat::Nanos, true)
    )
}

pub struct Scheduler {
    inner: Arc<Inner>,
    task: Mutex<Option<TimerLoop>>,
}

/// One spawned timer loop and the signal that ends it.
struct TimerLoop {
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

struct Inner {
    config: SchedulerConfig,
    period: Duration,
    calculator: AccrualCalculator,
    positions: Arc<dyn PositionStore>,
    updater: Arc<LedgerUpdater>,
    distributor: Arc<ReferralDistributor>,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
    phase: Mutex<SchedulerPhase>,
    started: AtomicBool,
}

impl Scheduler {
    pub fn new(
        config: &FarmConfig,
        positions: Arc<dyn PositionStore>,
        updater: Arc<LedgerUpdater>,
        distributor: Arc<ReferralDistributor>,
        clock: Arc<dyn Clock>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: config.scheduler.clone(),
                period: config.accrual.period(),
                calculator: AccrualCalculator::new(&config.accrual),
                positions,
                updater,
                distributor,
                clock,
                metrics,
                phase: Mutex::new(SchedulerPhase::Idle),
                started: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.inner.metrics
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.inner.phase()
    }

    /// Whether a tick is in flight.
    pub fn is_running(&self) -> bool {
        self.phase() != SchedulerPhase::Idle
    }

    /// Whether the timer loop is active.
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Spawn the timer loop on the current tokio runtime.
    ///
    /// Returns `false` (and does nothing) when already started, or when a
    /// previous loop is still draining its last tick after `stop`.
    pub fn start(&self) -> bool {
        let mut task = match self.task.lock() {
            Ok(task) => task,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = task.as_ref() {
            if !previous.handle.is_finished() {
                debug!(
                    started = self.is_started(),
                    "Scheduler loop still active, not starting another"
                );
                return false;
            }
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("Scheduler already started");
            return false;
        }

        let stop = Arc::new(Notify::new());
        let inner = self.inner.clone();
        let signal = stop.clone();
        let handle = tokio::spawn(async move { inner.run_loop(signal).await });
        *task = Some(TimerLoop { stop, handle });
        info!(period_secs = self.inner.period.as_secs(), "Scheduler started");
        true
    }

    /// Stop scheduling new ticks. A tick already in flight runs to completion.
    pub fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let task = match self.task.lock() {
                Ok(task) => task,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(timer) = task.as_ref() {
                timer.stop.notify_one();
            }
        }
        self.inner.transition(|phase| match phase {
            SchedulerPhase::Running => SchedulerPhase::Stopping,
            other => other,
        });
        info!(phase = ?self.phase(), "Scheduler stop requested");
    }

    /// Stop and wait for the loop task (and any in-flight tick) to finish.
    pub async fn shutdown(&self) {
        self.stop();
        let timer = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(timer) = timer {
            if let Err(e) = timer.handle.await {
                error!(error = %e, "Scheduler loop ended abnormally");
            }
        }
        info!("Scheduler shut down");
    }

    /// Run one sweep now. Returns `None` when a tick is already in flight.
    pub async fn run_tick(&self) -> Option<TickReport> {
        self.inner.run_tick().await
    }
}

/// Returns the phase to `Idle` when a tick ends, including by panic or by the
/// tick future being dropped.
struct IdleOnDrop<'a>(&'a Inner);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.transition(|_| SchedulerPhase::Idle);
    }
}

impl Inner {
    fn phase(&self) -> SchedulerPhase {
        match self.phase.lock() {
            Ok(phase) => *phase,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Apply `f` to the phase and return the previous value.
    fn transition(&self, f: impl FnOnce(SchedulerPhase) -> SchedulerPhase) -> SchedulerPhase {
        let mut phase = match self.phase.lock() {
            Ok(phase) => phase,
            Err(poisoned) => poisoned.into_inner(),
        };
        let previous = *phase;
        *phase = f(previous);
        previous
    }

    async fn run_loop(self: Arc<Self>, stop: Arc<Notify>) {
        let mut interval = if self.config.run_on_start {
            tokio::time::interval(self.period)
        } else {
            tokio::time::interval_at(Instant::now() + self.period, self.period)
        };
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop.notified() => break,
                _ = interval.tick() => {
                    if !self.started.load(Ordering::SeqCst) {
                        break;
                    }
                    self.run_tick().await;
                }
            }
        }
        debug!("Scheduler loop exited");
    }

    async fn run_tick(&self) -> Option<TickReport> {
        let previous = self.transition(|phase| match phase {
            SchedulerPhase::Idle => SchedulerPhase::Running,
            other => other,
        });
        if previous != SchedulerPhase::Idle {
            self.metrics.ticks_skipped.inc();
            debug!(phase = ?previous, "Tick already in flight, skipping");
            return None;
        }

        let report = {
            let _idle = IdleOnDrop(self);
            let _timer = TickTimer::start(&self.metrics.tick_duration);
            self.sweep().await
        };

        self.metrics.ticks_run.inc();
        self.metrics.last_tick_scanned.set(report.scanned as u64);

        info!(
            scanned = report.scanned,
            credited = report.credited,
            skipped = report.skipped,
            deactivated = report.deactivated,
            failed = report.failed,
            commissions = report.commissions_written,
            aborted = report.aborted,
            "Tick complete"
        );
        Some(report)
    }

    async fn sweep(&self) -> TickReport {
        let now = self.clock.now();
        let mut report = TickReport {
            started_at: Some(now),
            ..TickReport::default()
        };

        let mut cursor: Option<PositionId> = None;
        loop {
            let page = match self
                .positions
                .list_active_positions(cursor, self.config.batch_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    error!(after = ?cursor, error = %e, "Failed to list active positions");
                    report.aborted = true;
                    break;
                }
            };
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.id);
            let last_page = page.len() < self.config.batch_size;

            for position in &page {
                report.scanned += 1;
                let failure = match self.process(position, now).await {
                    Ok(outcome) => {
                        match outcome.credited {
                            Some((currency, amount)) => {
                                report.credited += 1;
                                *report.total_credited.entry(currency).or_default() += amount;
                            }
                            None if outcome.resumed => report.resumed += 1,
                            None if !outcome.deactivated && outcome.failure.is_none() => {
                                report.skipped += 1
                            }
                            None => {}
                        }
                        if outcome.deactivated {
                            report.deactivated += 1;
                        }
                        report.commissions_written += outcome.commissions;
                        report.commission_failures += outcome.commission_failures;
                        outcome.failure
                    }
                    Err(e) => Some(e),
                };
                if let Some(e) = failure {
                    report.failed += 1;
                    self.metrics.position_failures.inc();
                    warn!(
                        position = %position.id,
                        account = %position.owner,
                        event_type = %EntryType::YieldIncome,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Position accrual failed"
                    );
                }
            }

            if last_page {
                break;
            }
        }
        report
    }

    async fn process(&self, position: &Position, now: DateTime<Utc>) -> Result<PositionOutcome> {
        let mut outcome = PositionOutcome::default();

        if position.deposit <= Decimal::ZERO {
            self.deactivate(position, "emptied").await?;
            outcome.deactivated = true;
            return Ok(outcome);
        }

        if let Some(income) = self.calculator.calculate_income(position, now) {
            self.calculator.validate(&income)?;
            if income.periods_capped {
                self.metrics.periods_capped.inc();
            }
            if income.amount_capped {
                self.metrics.amounts_capped.inc();
            }

            let committed = self
                .updater
                .credit(
                    CreditRequest::new(
                        income.owner,
                        income.amount,
                        income.currency.clone(),
                        EntryType::YieldIncome,
                    )
                    .with_dedup_key(accrual_key(position))
                    .at(now),
                )
                .await?;

            let (entry, income) = match committed {
                CreditOutcome::Written(entry) => {
                    self.metrics.positions_credited.inc();
                    outcome.credited = Some((entry.currency.clone(), entry.amount));
                    (entry, income)
                }
                CreditOutcome::Duplicate(entry) => {
                    let settled = self.settled_income(position, &entry)?;
                    info!(
                        position = %position.id,
                        account = %position.owner,
                        entry = %entry.id,
                        accrued_until = %settled.accrued_until,
                        "Resuming window credited by an earlier tick"
                    );
                    outcome.resumed = true;
                    (entry, settled)
                }
            };

            let advanced = self
                .positions
                .advance_last_update(position.id, income.last_update, income.accrued_until)
                .await;

            let distribution = self
                .distributor
                .distribute(&RewardEvent::from_entry(&entry))
                .await;
            outcome.commissions = distribution.credited.len();
            outcome.commission_failures = distribution.failures.len();
            self.metrics
                .commissions_written
                .inc_by(distribution.credited.len() as u64);
            self.metrics
                .commission_failures
                .inc_by(distribution.failures.len() as u64);

            match advanced {
                Ok(true) => debug!(
                    position = %position.id,
                    account = %position.owner,
                    amount = %entry.amount,
                    periods = income.effective_periods,
                    accrued_until = %income.accrued_until,
                    "Accrual credited"
                ),
                Ok(false) => {
                    outcome.failure = Some(FarmError::Storage(format!(
                        "last_update of position {} moved during the tick; entry {} stays keyed to the old window",
                        position.id, entry.id
                    )));
                    return Ok(outcome);
                }
                Err(e) => {
                    outcome.failure = Some(e);
                    return Ok(outcome);
                }
            }
        }

        if position.is_expired_at(now) {
            self.deactivate(position, "expired").await?;
            outcome.deactivated = true;
        }
        Ok(outcome)
    }

    /// Income for the window an existing accrual entry already paid.
    ///
    /// The entry carries the tick's timestamp, so recomputing against the same
    /// unchanged `last_update` yields the same window end.
    fn settled_income(&self, position: &Position, entry: &LedgerEntry) -> Result<Income> {
        let income = self
            .calculator
            .calculate_income(position, entry.created_at)
            .ok_or_else(|| {
                FarmError::Storage(format!(
                    "entry {} for position {} covers no whole period",
                    entry.id, position.id
                ))
            })?;
        if income.amount != entry.amount {
            warn!(
                position = %position.id,
                entry = %entry.id,
                paid = %entry.amount,
                recomputed = %income.amount,
                "Accrual entry disagrees with recomputed window; settling it as paid"
            );
        }
        Ok(income)
    }

    async fn deactivate(&self, position: &Position, reason: &'static str) -> Result<()> {
        self.positions.deactivate_position(position.id).await?;
        self.metrics.positions_deactivated.inc();
        info!(position = %position.id, account = %position.owner, reason, "Position deactivated");
        Ok(())
    }
}
