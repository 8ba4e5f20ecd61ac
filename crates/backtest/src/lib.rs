//! Backtesting and accounting engine for the cta-trader system.
//!
//! This crate provides:
//! - Bar-level fill simulation
//! - Cash and position ledger with reservations
//! - Transaction cost analysis
//! - Performance statistics
//! - The backtest engine and strategy interface
//! - Snapshot persistence and the live account ledger

pub mod engine;
pub mod fill_model;
pub mod live;
pub mod metrics;
pub mod position;
pub mod snapshot;
pub mod strategy;
pub mod tca;

pub use engine::{BacktestEngine, BacktestReport, DecisionRecord, EngineState, RunFailure};
pub use fill_model::{FillDecision, FillModelConfig, FillSimulator};
pub use live::{run_fill_listener, FillAck, FillNotification, LiveAccount};
pub use metrics::{EquityCurve, EquityPoint, Statistics, StatisticsCalculator};
pub use position::{AccountSnapshot, FillOutcome, Position, PositionTracker, RealizedTrade, Reservation};
pub use snapshot::{open_store, JsonFileStore, OpenOrder, SessionSnapshot, SnapshotStore, SqliteSnapshotStore};
pub use strategy::{AccountView, MaRsiParams, MaRsiStrategy, OrderEvent, Strategy};
pub use tca::{TcaAnalyzer, TcaRecord, TcaReport, TcaSummary};
