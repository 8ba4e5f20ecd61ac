//! Indicator computation for the cta-trader system.
//!
//! This crate handles:
//! - Rolling simple moving averages
//! - Wilder RSI
//! - A combined per-bar indicator engine used by the bundled strategy

pub mod engine;
pub mod rsi;
pub mod sma;

pub use engine::{IndicatorConfig, IndicatorEngine, Indicators};
pub use rsi::Rsi;
pub use sma::RollingMean;
