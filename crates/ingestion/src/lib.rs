//! Market data ingestion and replay for the cta-trader system.
//!
//! This crate handles:
//! - Loading historical bars (in-memory, SQLite)
//! - Sequential bar replay for backtests
//! - Interval bar building from live ticks

pub mod bar_builder;
pub mod replay;
pub mod source;

pub use bar_builder::BarBuilder;
pub use replay::MarketDataReplayer;
pub use source::{BarSource, SqliteBarSource, VecBarSource};
