//! Engine counters.
//!
//! - **Counters**: ticks, credits, commissions, failures
//! - **Gauges**: size of the last sweep
//! - **Histograms**: tick duration
//!
//! ```rust,ignore
//! let metrics = Arc::new(EngineMetrics::new());
//! let scheduler = Scheduler::new(..., metrics.clone());
//! println!("{}", metrics.to_json());
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Last-written value.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Bucketed durations in milliseconds.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bounds: Vec<f64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Buckets sized for sweeps: a few ms for small books up to a minute.
    pub fn new_tick_duration() -> Self {
        Self::new(vec![
            5.0, 25.0, 100.0, 500.0, 1_000.0, 5_000.0, 15_000.0, 60_000.0,
        ])
    }

    pub fn new(bounds: Vec<f64>) -> Self {
        Self {
            buckets: (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            bounds,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, millis: f64) {
        let idx = self
            .bounds
            .iter()
            .position(|bound| millis <= *bound)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((millis * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0 / n as f64,
        }
    }

    /// Observations at or below each bound, plus the overflow bucket last.
    pub fn buckets(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }
}

/// Everything the scheduler and its collaborators count.
#[derive(Debug)]
pub struct EngineMetrics {
    pub ticks_run: Counter,
    /// Ticks dropped because the previous one was still in flight.
    pub ticks_skipped: Counter,
    pub positions_credited: Counter,
    pub position_failures: Counter,
    pub positions_deactivated: Counter,
    pub periods_capped: Counter,
    pub amounts_capped: Counter,
    pub commissions_written: Counter,
    pub commission_failures: Counter,

    pub last_tick_scanned: Gauge,

    pub tick_duration: Histogram,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            ticks_run: Counter::new(),
            ticks_skipped: Counter::new(),
            positions_credited: Counter::new(),
            position_failures: Counter::new(),
            positions_deactivated: Counter::new(),
            periods_capped: Counter::new(),
            amounts_capped: Counter::new(),
            commissions_written: Counter::new(),
            commission_failures: Counter::new(),
            last_tick_scanned: Gauge::new(),
            tick_duration: Histogram::new_tick_duration(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "counters": {
                "ticks_run": self.ticks_run.get(),
                "ticks_skipped": self.ticks_skipped.get(),
                "positions_credited": self.positions_credited.get(),
                "position_failures": self.position_failures.get(),
                "positions_deactivated": self.positions_deactivated.get(),
                "periods_capped": self.periods_capped.get(),
                "amounts_capped": self.amounts_capped.get(),
                "commissions_written": self.commissions_written.get(),
                "commission_failures": self.commission_failures.get(),
            },
            "gauges": {
                "last_tick_scanned": self.last_tick_scanned.get(),
            },
            "tick_duration_ms": {
                "count": self.tick_duration.count(),
                "mean": self.tick_duration.mean(),
                "buckets": self.tick_duration.buckets(),
            },
        })
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Observes the elapsed time into a histogram when dropped.
pub struct TickTimer<'a> {
    histogram: &'a Histogram,
    start: Instant,
}

impl<'a> TickTimer<'a> {
    pub fn start(histogram: &'a Histogram) -> Self {
        Self {
            histogram,
            start: Instant::now(),
        }
    }
}

impl Drop for TickTimer<'_> {
    fn drop(&mut self) {
        self.histogram
            .observe(self.start.elapsed().as_secs_f64() * 1000.0);
    }
}
