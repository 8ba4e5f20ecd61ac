//! Indicator computation engine.
//!
//! Combines the indicator components into a single per-bar update.

use cta_core::{Bar, TimestampMs};

use crate::rsi::Rsi;
use crate::sma::RollingMean;

/// Window lengths for the indicator set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicatorConfig {
    pub fast_window: usize,
    pub slow_window: usize,
    pub rsi_window: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            fast_window: 10,
            slow_window: 20,
            rsi_window: 14,
        }
    }
}

/// Indicator values as of one bar close.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Indicators {
    pub ts_ms: TimestampMs,
    pub fast_ma: f64,
    pub slow_ma: f64,
    pub rsi: f64,
}

impl Indicators {
    /// Fast average above slow.
    pub fn is_uptrend(&self) -> bool {
        self.fast_ma > self.slow_ma
    }
}

/// Indicator computation engine.
pub struct IndicatorEngine {
    fast: RollingMean,
    slow: RollingMean,
    rsi: Rsi,
    bars_seen: usize,
}

impl IndicatorEngine {
    /// Create a new indicator engine.
    pub fn new(config: IndicatorConfig) -> Self {
        Self {
            fast: RollingMean::new(config.fast_window),
            slow: RollingMean::new(config.slow_window),
            rsi: Rsi::new(config.rsi_window),
            bars_seen: 0,
        }
    }

    /// Process a completed bar. Returns indicators once every component is warm.
    pub fn update(&mut self, bar: &Bar) -> Option<Indicators> {
        self.bars_seen += 1;
        let fast_ma = self.fast.add(bar.close);
        let slow_ma = self.slow.add(bar.close);
        let rsi = self.rsi.add_price(bar.close);

        Some(Indicators {
            ts_ms: bar.ts_ms,
            fast_ma: fast_ma?,
            slow_ma: slow_ma?,
            rsi: rsi?,
        })
    }

    /// Check if the engine has enough warmup data.
    pub fn is_ready(&self) -> bool {
        self.fast.is_ready() && self.slow.is_ready() && self.rsi.is_ready()
    }

    pub fn bars_seen(&self) -> usize {
        self.bars_seen
    }

    /// Clear all state.
    pub fn clear(&mut self) {
        self.fast.clear();
        self.slow.clear();
        self.rsi.clear();
        self.bars_seen = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cta_core::Interval;

    fn make_bar(ts_ms: i64, close: f64) -> Bar {
        Bar {
            symbol: "BTCUSDT".to_string(),
            interval: Interval::Minute,
            ts_ms,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn test_warmup() {
        let mut engine = IndicatorEngine::new(IndicatorConfig {
            fast_window: 2,
            slow_window: 4,
            rsi_window: 3,
        });

        // RSI needs 4 closes, slow MA needs 4.
        for i in 0..3 {
            assert!(engine.update(&make_bar(i * 60_000, 100.0 + i as f64)).is_none());
        }
        let ind = engine.update(&make_bar(180_000, 103.0)).unwrap();
        assert!(engine.is_ready());
        assert!(ind.is_uptrend());
        assert!((ind.fast_ma - 102.5).abs() < 1e-10);
        assert!((ind.slow_ma - 101.5).abs() < 1e-10);
        assert!((ind.rsi - 100.0).abs() < 1e-10);
    }

    #[test]
    fn test_clear() {
        let mut engine = IndicatorEngine::new(IndicatorConfig {
            fast_window: 1,
            slow_window: 1,
            rsi_window: 1,
        });
        engine.update(&make_bar(0, 100.0));
        assert!(engine.update(&make_bar(60_000, 101.0)).is_some());
        engine.clear();
        assert_eq!(engine.bars_seen(), 0);
        assert!(!engine.is_ready());
    }
}
