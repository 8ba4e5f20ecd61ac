//! Core types and configuration for the cta-trader system.
//!
//! This crate provides shared types used across all other crates:
//! - Market data types (bars, intervals)
//! - Order intents and fills
//! - Configuration structures
//! - Common error types

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    BacktestConfig, Config, ExecutionConfig, InstrumentConfig, PersistenceConfig, SnapshotBackend,
    StrategyConfig, StrategyParams,
};
pub use error::{Error, Result};
pub use types::*;
