//! Backtest performance metrics.
//!
//! Statistics are recomputed from the full equity curve and trade history
//! each time; nothing here is updated incrementally.

use std::fmt;

use cta_core::{Fill, TimestampMs};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics as _;

use crate::position::RealizedTrade;

/// Returns with a standard deviation at or below this are treated as constant.
const MIN_STD_DEV: f64 = 1e-15;

/// Backtest performance statistics. Ratios are fractions (0.05 = 5%).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// Final equity / initial equity - 1.
    pub total_return: f64,
    /// Total return compounded to one year.
    pub annual_return: f64,
    /// Annualized Sharpe ratio; `None` when returns have no variance.
    pub sharpe_ratio: Option<f64>,
    /// Largest peak-to-trough decline, as a positive fraction.
    pub max_drawdown: f64,
    /// Winning share of closed trades.
    pub win_rate: f64,
    /// Number of closed (sell) trades.
    pub trade_count: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    /// Number of fills, buys included.
    pub fill_count: u32,
    pub initial_equity: f64,
    pub final_equity: f64,
    pub realized_pnl: f64,
    /// Total fees paid.
    pub total_fees: f64,
    /// Average winning trade P&L.
    pub avg_win: f64,
    /// Average losing trade P&L.
    pub avg_loss: f64,
    /// Gross wins / gross losses; `None` without losing trades.
    pub profit_factor: Option<f64>,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub max_consecutive_wins: u32,
    pub max_consecutive_losses: u32,
    /// Annualized Sortino ratio; `None` without downside returns.
    pub sortino_ratio: Option<f64>,
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn ratio(v: Option<f64>) -> String {
            v.map_or_else(|| "n/a".to_string(), |v| format!("{v:.3}"))
        }

        writeln!(f, "total return     {:>10.2}%", self.total_return * 100.0)?;
        writeln!(f, "annual return    {:>10.2}%", self.annual_return * 100.0)?;
        writeln!(f, "sharpe ratio     {:>10}", ratio(self.sharpe_ratio))?;
        writeln!(f, "sortino ratio    {:>10}", ratio(self.sortino_ratio))?;
        writeln!(f, "max drawdown     {:>10.2}%", self.max_drawdown * 100.0)?;
        writeln!(f, "win rate         {:>10.2}%", self.win_rate * 100.0)?;
        writeln!(f, "trades           {:>10}", self.trade_count)?;
        writeln!(f, "fills            {:>10}", self.fill_count)?;
        writeln!(f, "profit factor    {:>10}", ratio(self.profit_factor))?;
        writeln!(f, "realized pnl     {:>10.2}", self.realized_pnl)?;
        write!(f, "fees             {:>10.2}", self.total_fees)
    }
}

/// Equity curve point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts_ms: TimestampMs,
    pub equity: f64,
    /// Peak equity minus current equity.
    pub drawdown: f64,
    /// Drawdown as a fraction of the peak.
    pub drawdown_pct: f64,
}

/// Tracks the running peak while equity points are appended.
#[derive(Debug, Clone)]
pub struct EquityCurve {
    peak: f64,
    points: Vec<EquityPoint>,
}

impl EquityCurve {
    pub fn new(initial_equity: f64) -> Self {
        Self {
            peak: initial_equity,
            points: Vec::new(),
        }
    }

    /// Append the equity at `ts_ms`.
    pub fn push(&mut self, ts_ms: TimestampMs, equity: f64) -> &EquityPoint {
        self.peak = self.peak.max(equity);
        let drawdown = self.peak - equity;
        let drawdown_pct = if self.peak > 0.0 { drawdown / self.peak } else { 0.0 };
        self.points.push(EquityPoint {
            ts_ms,
            equity,
            drawdown,
            drawdown_pct,
        });
        &self.points[self.points.len() - 1]
    }

    pub fn points(&self) -> &[EquityPoint] {
        &self.points
    }

    pub fn into_points(self) -> Vec<EquityPoint> {
        self.points
    }
}

/// Statistics calculator.
pub struct StatisticsCalculator {
    initial_capital: f64,
    periods_per_year: f64,
}

impl StatisticsCalculator {
    /// Create a new calculator.
    pub fn new(initial_capital: f64, periods_per_year: f64) -> Self {
        Self {
            initial_capital,
            periods_per_year,
        }
    }

    /// Calculate statistics from the equity curve and trade history.
    pub fn calculate(
        &self,
        curve: &[EquityPoint],
        trades: &[RealizedTrade],
        fills: &[Fill],
    ) -> Statistics {
        let mut stats = Statistics {
            initial_equity: self.initial_capital,
            final_equity: curve.last().map_or(self.initial_capital, |p| p.equity),
            fill_count: fills.len() as u32,
            total_fees: fills.iter().map(|f| f.fee).sum(),
            ..Statistics::default()
        };

        let returns = self.periodic_returns(curve);
        stats.total_return = if self.initial_capital > 0.0 {
            stats.final_equity / self.initial_capital - 1.0
        } else {
            0.0
        };
        stats.annual_return = self.annualize(stats.total_return, returns.len());
        stats.sharpe_ratio = self.sharpe(&returns);
        stats.sortino_ratio = self.sortino(&returns);
        stats.max_drawdown = self.max_drawdown(curve);

        self.trade_stats(trades, &mut stats);
        stats
    }

    /// Simple returns between consecutive equity values, starting from the
    /// initial capital.
    pub fn periodic_returns(&self, curve: &[EquityPoint]) -> Vec<f64> {
        let mut prev = self.initial_capital;
        curve
            .iter()
            .map(|p| {
                let r = if prev > 0.0 { p.equity / prev - 1.0 } else { 0.0 };
                prev = p.equity;
                r
            })
            .collect()
    }

    fn annualize(&self, total_return: f64, periods: usize) -> f64 {
        if periods == 0 {
            return 0.0;
        }
        let growth = 1.0 + total_return;
        if growth <= 0.0 {
            return -1.0;
        }
        growth.powf(self.periods_per_year / periods as f64) - 1.0
    }

    /// Annualized Sharpe ratio (sample standard deviation).
    pub fn sharpe(&self, returns: &[f64]) -> Option<f64> {
        if returns.len() < 2 {
            return None;
        }
        let std_dev = returns.iter().std_dev();
        if !std_dev.is_finite() || std_dev <= MIN_STD_DEV {
            return None;
        }
        Some(returns.iter().mean() / std_dev * self.periods_per_year.sqrt())
    }

    /// Annualized Sortino ratio.
    pub fn sortino(&self, returns: &[f64]) -> Option<f64> {
        if returns.len() < 2 {
            return None;
        }
        let n = returns.len() as f64;
        let downside_dev = (returns.iter().map(|r| r.min(0.0).powi(2)).sum::<f64>() / n).sqrt();
        if downside_dev <= MIN_STD_DEV {
            return None;
        }
        Some(returns.iter().mean() / downside_dev * self.periods_per_year.sqrt())
    }

    /// Largest peak-to-trough decline, with the initial capital as the first peak.
    pub fn max_drawdown(&self, curve: &[EquityPoint]) -> f64 {
        let mut peak = self.initial_capital;
        let mut max_dd = 0.0_f64;
        for point in curve {
            peak = peak.max(point.equity);
            if peak > 0.0 {
                max_dd = max_dd.max((peak - point.equity) / peak);
            }
        }
        max_dd
    }

    fn trade_stats(&self, trades: &[RealizedTrade], stats: &mut Statistics) {
        stats.trade_count = trades.len() as u32;
        if trades.is_empty() {
            return;
        }

        let mut gross_wins = 0.0;
        let mut gross_losses = 0.0;

        // Consecutive tracking
        let mut current_wins = 0u32;
        let mut current_losses = 0u32;

        for trade in trades {
            stats.realized_pnl += trade.pnl;

            if trade.pnl > 0.0 {
                stats.winning_trades += 1;
                gross_wins += trade.pnl;
                stats.largest_win = stats.largest_win.max(trade.pnl);

                current_wins += 1;
                current_losses = 0;
                stats.max_consecutive_wins = stats.max_consecutive_wins.max(current_wins);
            } else {
                stats.losing_trades += 1;
                gross_losses += trade.pnl.abs();
                stats.largest_loss = stats.largest_loss.min(trade.pnl);

                current_losses += 1;
                current_wins = 0;
                stats.max_consecutive_losses = stats.max_consecutive_losses.max(current_losses);
            }
        }

        stats.win_rate = stats.winning_trades as f64 / stats.trade_count as f64;
        if stats.winning_trades > 0 {
            stats.avg_win = gross_wins / stats.winning_trades as f64;
        }
        if stats.losing_trades > 0 {
            stats.avg_loss = -gross_losses / stats.losing_trades as f64;
        }
        stats.profit_factor = (gross_losses > 0.0).then(|| gross_wins / gross_losses);
    }
}
