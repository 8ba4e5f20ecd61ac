//! Strategy interface and the bundled MA/RSI strategy.
//!
//! A strategy sees one closed bar at a time plus a read-only view of the
//! account, and answers with order requests. It hears back about every order
//! through [`OrderEvent`]s, so a rejected order is something it can react to
//! rather than a crash. The same contract serves backtests and live trading.

use cta_core::{Bar, Error, Fill, OrderId, OrderIntent, OrderRequest, Result, Side, StrategyParams};
use cta_features::{IndicatorConfig, IndicatorEngine};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Account state for one symbol, as a strategy sees it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountView {
    pub cash: f64,
    pub available_cash: f64,
    /// Held quantity in the traded symbol.
    pub position: f64,
    /// Quantity not already committed to a pending sell.
    pub sellable: f64,
    pub avg_cost: f64,
    /// Orders accepted but not yet resolved.
    pub pending_orders: usize,
}

impl AccountView {
    pub fn is_flat(&self) -> bool {
        self.position <= 0.0
    }
}

/// Something that happened to an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrderEvent {
    /// Reservation placed; the order is pending.
    Accepted { intent: OrderIntent },
    Filled { fill: Fill },
    /// Refused by the ledger or the fill model; nothing is held.
    Rejected { order_id: OrderId, reason: String },
    /// Limit order ran out of bars.
    Expired { order_id: OrderId },
    /// Cancelled while pending (end of run, or on request).
    Cancelled { order_id: OrderId },
}

impl OrderEvent {
    pub fn order_id(&self) -> OrderId {
        match self {
            OrderEvent::Accepted { intent } => intent.id,
            OrderEvent::Filled { fill } => fill.order_id,
            OrderEvent::Rejected { order_id, .. }
            | OrderEvent::Expired { order_id }
            | OrderEvent::Cancelled { order_id } => *order_id,
        }
    }
}

/// A trading strategy.
pub trait Strategy {
    /// Build the strategy from named parameters.
    fn from_params(params: &StrategyParams) -> Result<Self>
    where
        Self: Sized;

    fn name(&self) -> &str;

    /// Called once per closed bar.
    fn on_bar(&mut self, bar: &Bar, account: &AccountView) -> Vec<OrderRequest>;

    /// Called for every order lifecycle event.
    fn on_order_event(&mut self, _event: &OrderEvent) {}
}

/// Parameters of [`MaRsiStrategy`].
#[derive(Debug, Clone, PartialEq)]
pub struct MaRsiParams {
    pub fast_window: usize,
    pub slow_window: usize,
    pub rsi_window: usize,
    /// Enter when RSI is below this.
    pub rsi_entry: f64,
    /// Exit when RSI is above this.
    pub rsi_exit: f64,
    /// Minimum bar volume to enter, and the smallest order size.
    pub min_volume: f64,
    /// Minimum move from the last trade price before exiting.
    pub price_change_threshold: f64,
    /// Fraction of available cash committed per entry.
    pub risk_percent: f64,
}

impl Default for MaRsiParams {
    fn default() -> Self {
        Self {
            fast_window: 10,
            slow_window: 20,
            rsi_window: 14,
            rsi_entry: 35.0,
            rsi_exit: 65.0,
            min_volume: 0.01,
            price_change_threshold: 0.01,
            risk_percent: 0.02,
        }
    }
}

impl MaRsiParams {
    pub fn from_params(params: &StrategyParams) -> Result<Self> {
        let d = Self::default();
        let p = Self {
            fast_window: params.window_or("fast_window", d.fast_window)?,
            slow_window: params.window_or("slow_window", d.slow_window)?,
            rsi_window: params.window_or("rsi_window", d.rsi_window)?,
            rsi_entry: params.get_or("rsi_entry", d.rsi_entry),
            rsi_exit: params.get_or("rsi_exit", d.rsi_exit),
            min_volume: params.get_or("min_volume", d.min_volume),
            price_change_threshold: params.get_or("price_change_threshold", d.price_change_threshold),
            risk_percent: params.get_or("risk_percent", d.risk_percent),
        };
        p.validate()?;
        Ok(p)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fast_window >= self.slow_window {
            return Err(Error::config(format!(
                "fast_window ({}) must be shorter than slow_window ({})",
                self.fast_window, self.slow_window
            )));
        }
        if !(0.0..=100.0).contains(&self.rsi_entry) || !(0.0..=100.0).contains(&self.rsi_exit) {
            return Err(Error::config("rsi thresholds must lie in [0, 100]"));
        }
        if self.rsi_entry >= self.rsi_exit {
            return Err(Error::config("rsi_entry must be below rsi_exit"));
        }
        if !(self.risk_percent > 0.0 && self.risk_percent <= 1.0) {
            return Err(Error::config(format!("risk_percent must be in (0, 1], got {}", self.risk_percent)));
        }
        if self.min_volume < 0.0 || self.price_change_threshold < 0.0 {
            return Err(Error::config("min_volume and price_change_threshold must be non-negative"));
        }
        Ok(())
    }
}

/// Lot size entries are rounded down to.
const LOT_SIZE: f64 = 0.001;

/// Moving-average crossover filtered by RSI, long only.
///
/// Enters when RSI is oversold while the fast average is above the slow one;
/// exits when RSI is overbought or the averages cross down, provided price
/// has moved far enough from the last trade.
pub struct MaRsiStrategy {
    params: MaRsiParams,
    indicators: IndicatorEngine,
    last_trade_price: Option<f64>,
}

impl MaRsiStrategy {
    pub fn new(params: MaRsiParams) -> Self {
        let indicators = IndicatorEngine::new(IndicatorConfig {
            fast_window: params.fast_window,
            slow_window: params.slow_window,
            rsi_window: params.rsi_window,
        });
        Self {
            params,
            indicators,
            last_trade_price: None,
        }
    }

    pub fn params(&self) -> &MaRsiParams {
        &self.params
    }

    /// Entry size: a fixed share of available cash, in whole lots, never
    /// below `min_volume`.
    pub fn entry_quantity(&self, available_cash: f64, price: f64) -> f64 {
        let raw = available_cash * self.params.risk_percent / price;
        let lots = (raw / LOT_SIZE + 1e-9).floor() * LOT_SIZE;
        lots.max(self.params.min_volume)
    }
}

impl Strategy for MaRsiStrategy {
    fn from_params(params: &StrategyParams) -> Result<Self> {
        Ok(Self::new(MaRsiParams::from_params(params)?))
    }

    fn name(&self) -> &str {
        "ma_rsi"
    }

    fn on_bar(&mut self, bar: &Bar, account: &AccountView) -> Vec<OrderRequest> {
        let Some(ind) = self.indicators.update(bar) else {
            return Vec::new();
        };
        if account.pending_orders > 0 {
            return Vec::new();
        }

        if account.is_flat() {
            if ind.rsi < self.params.rsi_entry && ind.is_uptrend() && bar.volume >= self.params.min_volume {
                let quantity = self.entry_quantity(account.available_cash, bar.close);
                info!(
                    ts = bar.ts_ms,
                    rsi = ind.rsi,
                    fast = ind.fast_ma,
                    slow = ind.slow_ma,
                    quantity,
                    "entry signal"
                );
                return vec![OrderRequest::market(&bar.symbol, Side::Buy, quantity)];
            }
        } else if account.sellable > 0.0 {
            let reference = self.last_trade_price.unwrap_or(account.avg_cost);
            let price_change = if reference > 0.0 { bar.close / reference - 1.0 } else { 0.0 };
            let exit_signal = ind.rsi > self.params.rsi_exit || ind.fast_ma < ind.slow_ma;
            if exit_signal && price_change.abs() > self.params.price_change_threshold {
                info!(
                    ts = bar.ts_ms,
                    rsi = ind.rsi,
                    fast = ind.fast_ma,
                    slow = ind.slow_ma,
                    price_change,
                    "exit signal"
                );
                return vec![OrderRequest::market(&bar.symbol, Side::Sell, account.sellable)];
            }
        }
        Vec::new()
    }

    fn on_order_event(&mut self, event: &OrderEvent) {
        match event {
            OrderEvent::Filled { fill } => self.last_trade_price = Some(fill.price),
            OrderEvent::Rejected { order_id, reason } => {
                debug!(%order_id, reason, "order rejected");
            }
            _ => {}
        }
    }
}
