//! Interval bar building from live ticks.
//!
//! In live mode the strategy sees the same [`Bar`] shape as in a backtest;
//! this builder turns the exchange's trade prints into those bars.

use cta_core::{ts_to_interval, Bar, Interval, Tick, TimestampMs};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Builder for interval bars from ticks.
pub struct BarBuilder {
    symbol: String,
    interval: Interval,
    /// Bars being built, keyed by interval start.
    bars: BTreeMap<TimestampMs, BarInProgress>,
    /// Start of the last interval handed out; later ticks for it are dropped.
    last_finalized: Option<TimestampMs>,
}

/// A bar that's currently being built.
#[derive(Debug, Clone)]
struct BarInProgress {
    ts_ms: TimestampMs,
    open: Option<f64>,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl BarInProgress {
    fn new(ts_ms: TimestampMs) -> Self {
        Self {
            ts_ms,
            open: None,
            high: f64::NEG_INFINITY,
            low: f64::INFINITY,
            close: 0.0,
            volume: 0.0,
        }
    }

    fn add_tick(&mut self, price: f64, size: f64) {
        if self.open.is_none() {
            self.open = Some(price);
        }
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += size;
    }

    fn to_bar(&self, symbol: &str, interval: Interval) -> Option<Bar> {
        let open = self.open?;
        Some(Bar {
            symbol: symbol.to_string(),
            interval,
            ts_ms: self.ts_ms,
            open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        })
    }
}

impl BarBuilder {
    /// Create a new bar builder.
    pub fn new(symbol: impl Into<String>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
            bars: BTreeMap::new(),
            last_finalized: None,
        }
    }

    /// Add a tick. Ticks for intervals already finalized are ignored.
    pub fn add_tick(&mut self, tick: &Tick) {
        if !(tick.price.is_finite() && tick.price > 0.0 && tick.size >= 0.0) {
            warn!(ts_ms = tick.ts_ms, price = tick.price, size = tick.size, "dropping malformed tick");
            return;
        }
        let ts = ts_to_interval(tick.ts_ms, self.interval);
        if matches!(self.last_finalized, Some(last) if ts <= last) {
            debug!(ts_ms = tick.ts_ms, "late tick for finalized bar");
            return;
        }
        self.bars
            .entry(ts)
            .or_insert_with(|| BarInProgress::new(ts))
            .add_tick(tick.price, tick.size);
    }

    /// Add multiple ticks.
    pub fn add_ticks(&mut self, ticks: &[Tick]) {
        for tick in ticks {
            self.add_tick(tick);
        }
    }

    /// Finalize and return completed bars older than the given timestamp.
    ///
    /// Bars whose interval has ended are returned in time order and removed
    /// from the builder.
    pub fn finalize_before(&mut self, current_ts_ms: TimestampMs) -> Vec<Bar> {
        let current = ts_to_interval(current_ts_ms, self.interval);
        let still_open = self.bars.split_off(&current);
        let done = std::mem::replace(&mut self.bars, still_open);

        let completed: Vec<Bar> = done
            .values()
            .filter_map(|b| b.to_bar(&self.symbol, self.interval))
            .collect();
        if let Some(last) = completed.last() {
            self.last_finalized = Some(last.ts_ms);
        }
        completed
    }

    /// Force finalize a specific interval, even if not complete.
    pub fn force_finalize(&mut self, ts_ms: TimestampMs) -> Option<Bar> {
        let key = ts_to_interval(ts_ms, self.interval);
        let bar = self.bars.remove(&key)?.to_bar(&self.symbol, self.interval)?;
        self.last_finalized = Some(self.last_finalized.map_or(key, |last| last.max(key)));
        Some(bar)
    }

    /// Get the number of bars currently being built.
    pub fn pending_bar_count(&self) -> usize {
        self.bars.len()
    }

    /// Clear all state.
    pub fn clear(&mut self) {
        self.bars.clear();
        self.last_finalized = None;
    }
}
