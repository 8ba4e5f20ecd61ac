//! Fill model for backtesting.
//!
//! Decides whether an order intent fills against a bar, and at what price.
//! Orders are only ever evaluated against bars strictly after the one they
//! were decided on, and every fill price lies inside that bar's range.

use cta_core::{Bar, Error, ExecutionConfig, Fill, FillId, OrderIntent, OrderType, Result, Side};

/// Configuration for the fill model.
#[derive(Debug, Clone)]
pub struct FillModelConfig {
    /// Fee rate applied to fill notional.
    pub fee_rate: f64,
    /// Bars a limit order may wait before it expires.
    pub limit_expiry_bars: u32,
    /// Maximum share of a bar's volume one order may take.
    pub max_volume_participation: Option<f64>,
}

impl Default for FillModelConfig {
    fn default() -> Self {
        Self {
            fee_rate: 0.001,
            limit_expiry_bars: 10,
            max_volume_participation: None,
        }
    }
}

impl From<&ExecutionConfig> for FillModelConfig {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            fee_rate: config.fee_rate,
            limit_expiry_bars: config.limit_expiry_bars,
            max_volume_participation: config.max_volume_participation,
        }
    }
}

/// Outcome of evaluating an order against one bar.
#[derive(Debug, Clone, PartialEq)]
pub enum FillDecision {
    Filled(Fill),
    /// Not fillable yet; re-evaluate on the next bar.
    Pending,
    /// Limit order ran out of bars.
    Expired,
    /// Rejected by the liquidity constraint.
    Rejected(String),
}

/// Fill simulator for bar data.
pub struct FillSimulator {
    config: FillModelConfig,
}

impl FillSimulator {
    /// Create a new fill simulator.
    pub fn new(config: FillModelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FillModelConfig {
        &self.config
    }

    /// Evaluate `intent` against `bar`.
    ///
    /// `bars_waited` counts the bars this order has been evaluated against,
    /// including `bar` itself (1 on the first bar after origination).
    pub fn evaluate(&self, intent: &OrderIntent, bar: &Bar, bars_waited: u32) -> Result<FillDecision> {
        if bar.ts_ms <= intent.ts_ms {
            return Err(Error::invariant(format!(
                "order {} decided at {} evaluated against bar {}",
                intent.id, intent.ts_ms, bar.ts_ms
            )));
        }
        if bar.symbol != intent.symbol {
            return Err(Error::invariant(format!(
                "order {} for {} evaluated against {} bar",
                intent.id, intent.symbol, bar.symbol
            )));
        }

        let within_liquidity = self.within_liquidity(intent.quantity, bar);

        let decision = match intent.order_type {
            OrderType::Market => {
                if !within_liquidity {
                    FillDecision::Rejected(format!(
                        "quantity {} exceeds allowed share of bar volume {}",
                        intent.quantity, bar.volume
                    ))
                } else {
                    FillDecision::Filled(self.make_fill(intent, bar, bar.open))
                }
            }
            OrderType::Limit => {
                let limit = intent
                    .limit_price
                    .ok_or_else(|| Error::order(format!("limit order {} without a limit price", intent.id)))?;
                match Self::limit_fill_price(intent.side, limit, bar) {
                    Some(price) if within_liquidity => FillDecision::Filled(self.make_fill(intent, bar, price)),
                    _ if bars_waited >= self.config.limit_expiry_bars => FillDecision::Expired,
                    _ => FillDecision::Pending,
                }
            }
        };
        Ok(decision)
    }

    /// Price a limit order trades at on `bar`, if it trades at all.
    ///
    /// A bar that trades through the limit fills at the limit. A bar that
    /// opens and stays entirely on the better side fills at the open.
    pub fn limit_fill_price(side: Side, limit: f64, bar: &Bar) -> Option<f64> {
        if bar.contains(limit) {
            return Some(limit);
        }
        match side {
            Side::Buy if bar.high < limit => Some(bar.open),
            Side::Sell if bar.low > limit => Some(bar.open),
            _ => None,
        }
    }

    fn within_liquidity(&self, quantity: f64, bar: &Bar) -> bool {
        match self.config.max_volume_participation {
            Some(share) => quantity <= bar.volume * share,
            None => true,
        }
    }

    fn make_fill(&self, intent: &OrderIntent, bar: &Bar, price: f64) -> Fill {
        Fill {
            fill_id: FillId(format!("{}-{}", intent.id, bar.ts_ms)),
            order_id: intent.id,
            symbol: intent.symbol.clone(),
            side: intent.side,
            price,
            quantity: intent.quantity,
            ts_ms: bar.ts_ms,
            fee: self.calculate_fee(price * intent.quantity),
        }
    }

    /// Fee for a given notional.
    pub fn calculate_fee(&self, notional: f64) -> f64 {
        notional * self.config.fee_rate
    }
}
