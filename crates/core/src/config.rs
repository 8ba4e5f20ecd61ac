//! Configuration structures for the cta-trader system.
//!
//! Everything is injected at construction time. Sections default
//! individually, so a config file only needs the keys it overrides.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::Interval;

/// Main configuration for the trading system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Instrument configuration.
    pub instrument: InstrumentConfig,
    /// Execution / fill simulation configuration.
    pub execution: ExecutionConfig,
    /// Backtest configuration.
    pub backtest: BacktestConfig,
    /// Snapshot persistence configuration.
    pub persistence: PersistenceConfig,
    /// Strategy selection and parameters.
    pub strategy: StrategyConfig,
}

impl Config {
    /// Load and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.instrument.symbol.trim().is_empty() {
            return Err(Error::config("instrument.symbol must not be empty"));
        }
        let fee = self.execution.fee_rate;
        if !(0.0..1.0).contains(&fee) {
            return Err(Error::config(format!("execution.fee_rate must be in [0, 1), got {fee}")));
        }
        if self.execution.limit_expiry_bars == 0 {
            return Err(Error::config("execution.limit_expiry_bars must be at least 1"));
        }
        if let Some(p) = self.execution.max_volume_participation {
            if !(p > 0.0 && p <= 1.0) {
                return Err(Error::config(format!(
                    "execution.max_volume_participation must be in (0, 1], got {p}"
                )));
            }
        }
        if !(self.execution.reserve_buffer >= 0.0) {
            return Err(Error::config("execution.reserve_buffer must be non-negative"));
        }
        if !(self.backtest.initial_capital > 0.0) {
            return Err(Error::config("backtest.initial_capital must be positive"));
        }
        if let Some(ppy) = self.backtest.periods_per_year {
            if !(ppy > 0.0) {
                return Err(Error::config("backtest.periods_per_year must be positive"));
            }
        }
        Ok(())
    }

    /// Periods per year used to annualize statistics.
    pub fn periods_per_year(&self) -> f64 {
        self.backtest
            .periods_per_year
            .unwrap_or_else(|| self.instrument.interval.periods_per_year())
    }
}

/// Instrument-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Trading symbol (e.g., "BTCUSDT").
    pub symbol: String,
    /// Exchange name.
    pub exchange: String,
    /// Bar interval.
    pub interval: Interval,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            exchange: "binance".to_string(),
            interval: Interval::Minute,
        }
    }
}

/// Execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Fee as a fraction of notional (0.001 = 0.1%).
    pub fee_rate: f64,
    /// Bars a limit order may rest before it expires.
    pub limit_expiry_bars: u32,
    /// Largest fraction of a bar's volume a single order may take.
    pub max_volume_participation: Option<f64>,
    /// Extra fraction reserved on top of the reference price for market buys.
    pub reserve_buffer: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fee_rate: 0.001,
            limit_expiry_bars: 10,
            max_volume_participation: None,
            reserve_buffer: 0.0,
        }
    }
}

/// Backtest configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Initial capital for backtesting.
    pub initial_capital: f64,
    /// Override for annualization; defaults to the instrument interval.
    pub periods_per_year: Option<f64>,
    /// Emit a progress log line every this many bars (0 = never).
    pub progress_every: usize,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: 1_000_000.0,
            periods_per_year: None,
            progress_every: 1000,
        }
    }
}

/// Where the live account snapshot is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotBackend {
    Json,
    Sqlite,
}

/// Snapshot persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: SnapshotBackend,
    pub snapshot_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: SnapshotBackend::Json,
            snapshot_path: PathBuf::from("positions.json"),
        }
    }
}

/// Strategy selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Registered strategy name.
    pub name: String,
    /// Named numeric parameters.
    pub params: StrategyParams,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            name: "ma_rsi".to_string(),
            params: StrategyParams::default(),
        }
    }
}

/// Named strategy parameters (`fast_window`, `rsi_entry`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyParams(BTreeMap<String, f64>);

impl StrategyParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.0.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// Value or `default` when unset.
    pub fn get_or(&self, name: &str, default: f64) -> f64 {
        self.get(name).unwrap_or(default)
    }

    /// Parameter interpreted as a window length.
    pub fn window_or(&self, name: &str, default: usize) -> Result<usize> {
        match self.get(name) {
            None => Ok(default),
            Some(v) if v >= 1.0 && v.fract() == 0.0 => Ok(v as usize),
            Some(v) => Err(Error::config(format!("parameter {name} must be a positive integer, got {v}"))),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.execution.fee_rate, 0.001);
        assert_eq!(config.instrument.interval, Interval::Minute);
        assert_eq!(config.periods_per_year(), 525_600.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let raw = r#"{
            "instrument": { "symbol": "ETHUSDT", "interval": "1h" },
            "strategy": { "params": { "fast_window": 5, "slow_window": 30 } }
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.instrument.symbol, "ETHUSDT");
        assert_eq!(config.instrument.exchange, "binance");
        assert_eq!(config.periods_per_year(), 8_760.0);
        assert_eq!(config.strategy.name, "ma_rsi");
        assert_eq!(config.strategy.params.get("slow_window"), Some(30.0));
        assert_eq!(config.backtest.initial_capital, 1_000_000.0);
    }

    #[test]
    fn test_from_json_file_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "execution": {{ "fee_rate": 1.5 }} }}"#).unwrap();
        let err = Config::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_window_param() {
        let params = StrategyParams::new().with("fast_window", 10.0).with("bad", 2.5);
        assert_eq!(params.window_or("fast_window", 3).unwrap(), 10);
        assert_eq!(params.window_or("missing", 3).unwrap(), 3);
        assert!(params.window_or("bad", 3).is_err());
    }
}
