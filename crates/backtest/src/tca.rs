//! Transaction cost analysis.
//!
//! Measures slippage against the order's reference price and latency from
//! decision to fill. Records are append-only; summaries are recomputed from
//! the full record set on every call.

use cta_core::{Error, Fill, FillId, OrderId, OrderIntent, OrderType, Result, Side, TimestampMs};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median, Statistics as _};

/// Execution quality of one fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcaRecord {
    pub order_id: OrderId,
    pub fill_id: FillId,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    /// Limit price, or the close at decision time for market orders.
    pub reference_price: f64,
    pub fill_price: f64,
    pub quantity: f64,
    /// fill - reference.
    pub slippage: f64,
    /// slippage / reference.
    pub slippage_pct: f64,
    /// Slippage signed so that a worse price is positive for either side.
    pub adverse_slippage_pct: f64,
    pub decision_ts_ms: TimestampMs,
    pub fill_ts_ms: TimestampMs,
    pub latency_ms: i64,
}

/// Aggregates over all records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcaSummary {
    pub count: usize,
    pub buy_count: usize,
    pub sell_count: usize,
    pub mean_slippage: f64,
    pub median_slippage: f64,
    /// Sample standard deviation; zero with fewer than two records.
    pub std_slippage: f64,
    pub min_slippage: f64,
    pub max_slippage: f64,
    pub mean_slippage_pct: f64,
    pub median_slippage_pct: f64,
    pub mean_adverse_slippage_pct: f64,
    pub mean_latency_ms: f64,
    pub min_latency_ms: i64,
    pub max_latency_ms: i64,
}

/// Records plus summary, as handed to monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcaReport {
    pub records: Vec<TcaRecord>,
    pub summary: TcaSummary,
}

/// Transaction cost analyzer.
#[derive(Debug, Clone, Default)]
pub struct TcaAnalyzer {
    records: Vec<TcaRecord>,
}

impl TcaAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fill against the intent it executed.
    pub fn record(&mut self, intent: &OrderIntent, fill: &Fill) -> Result<&TcaRecord> {
        if fill.order_id != intent.id {
            return Err(Error::order(format!(
                "fill {} belongs to {}, not {}",
                fill.fill_id, fill.order_id, intent.id
            )));
        }
        let reference_price = intent.reference_price();
        if !(reference_price.is_finite() && reference_price > 0.0) {
            return Err(Error::order(format!(
                "{}: reference price {reference_price} is not usable",
                intent.id
            )));
        }

        let slippage = fill.price - reference_price;
        let slippage_pct = slippage / reference_price;
        self.records.push(TcaRecord {
            order_id: intent.id,
            fill_id: fill.fill_id.clone(),
            symbol: fill.symbol.clone(),
            side: fill.side,
            order_type: intent.order_type,
            reference_price,
            fill_price: fill.price,
            quantity: fill.quantity,
            slippage,
            slippage_pct,
            adverse_slippage_pct: slippage_pct * intent.side.sign(),
            decision_ts_ms: intent.ts_ms,
            fill_ts_ms: fill.ts_ms,
            latency_ms: fill.ts_ms - intent.ts_ms,
        });

        // Just pushed.
        Ok(&self.records[self.records.len() - 1])
    }

    pub fn records(&self) -> &[TcaRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Summary over every record so far. All zeros when empty.
    pub fn summary(&self) -> TcaSummary {
        if self.records.is_empty() {
            return TcaSummary::default();
        }

        let slippage: Vec<f64> = self.records.iter().map(|r| r.slippage).collect();
        let slippage_pct: Vec<f64> = self.records.iter().map(|r| r.slippage_pct).collect();
        let latencies = self.records.iter().map(|r| r.latency_ms);

        let std_slippage = if slippage.len() < 2 {
            0.0
        } else {
            slippage.iter().std_dev()
        };

        TcaSummary {
            count: self.records.len(),
            buy_count: self.records.iter().filter(|r| r.side == Side::Buy).count(),
            sell_count: self.records.iter().filter(|r| r.side == Side::Sell).count(),
            mean_slippage: slippage.iter().mean(),
            median_slippage: Data::new(slippage.clone()).median(),
            std_slippage,
            min_slippage: slippage.iter().copied().map(OrderedFloat).min().map_or(0.0, |v| v.0),
            max_slippage: slippage.iter().copied().map(OrderedFloat).max().map_or(0.0, |v| v.0),
            mean_slippage_pct: slippage_pct.iter().mean(),
            median_slippage_pct: Data::new(slippage_pct).median(),
            mean_adverse_slippage_pct: self.records.iter().map(|r| r.adverse_slippage_pct).mean(),
            mean_latency_ms: self.records.iter().map(|r| r.latency_ms as f64).mean(),
            min_latency_ms: latencies.clone().min().unwrap_or(0),
            max_latency_ms: latencies.max().unwrap_or(0),
        }
    }

    /// Records plus summary.
    pub fn report(&self) -> TcaReport {
        TcaReport {
            records: self.records.clone(),
            summary: self.summary(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use cta_core::OrderRequest;

    fn fill_for(intent: &OrderIntent, price: f64, ts_ms: i64) -> Fill {
        Fill {
            fill_id: FillId(format!("{}-{ts_ms}", intent.id)),
            order_id: intent.id,
            symbol: intent.symbol.clone(),
            side: intent.side,
            price,
            quantity: intent.quantity,
            ts_ms,
            fee: 0.0,
        }
    }

    #[test]
    fn test_market_slippage_against_decision_close() {
        let intent = OrderIntent::from_request(
            OrderId(1),
            OrderRequest::market("BTCUSDT", Side::Buy, 1.0),
            0,
            100.0,
        )
        .unwrap();
        let mut tca = TcaAnalyzer::new();
        let record = tca.record(&intent, &fill_for(&intent, 101.0, 60_000)).unwrap();

        assert_abs_diff_eq!(record.slippage, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(record.slippage_pct, 0.01, epsilon = 1e-12);
        assert_abs_diff_eq!(record.adverse_slippage_pct, 0.01, epsilon = 1e-12);
        assert_eq!(record.latency_ms, 60_000);
    }

    #[test]
    fn test_limit_reference_is_limit() {
        let intent = OrderIntent::from_request(
            OrderId(2),
            OrderRequest::limit("BTCUSDT", Side::Sell, 1.0, 110.0),
            0,
            100.0,
        )
        .unwrap();
        let mut tca = TcaAnalyzer::new();
        let record = tca.record(&intent, &fill_for(&intent, 111.0, 120_000)).unwrap();

        assert_eq!(record.reference_price, 110.0);
        assert_abs_diff_eq!(record.slippage, 1.0, epsilon = 1e-12);
        // Selling higher is favorable.
        assert!(record.adverse_slippage_pct < 0.0);
    }

    #[test]
    fn test_summary() {
        let mut tca = TcaAnalyzer::new();
        for (i, price) in [101.0, 99.0, 103.0].into_iter().enumerate() {
            let intent = OrderIntent::from_request(
                OrderId(i as u64 + 1),
                OrderRequest::market("BTCUSDT", Side::Buy, 1.0),
                0,
                100.0,
            )
            .unwrap();
            tca.record(&intent, &fill_for(&intent, price, (i as i64 + 1) * 1000)).unwrap();
        }

        let summary = tca.summary();
        assert_eq!(summary.count, 3);
        assert_eq!(summary.buy_count, 3);
        assert_abs_diff_eq!(summary.mean_slippage, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.median_slippage, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.std_slippage, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.min_slippage, -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.max_slippage, 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary.mean_latency_ms, 2000.0, epsilon = 1e-12);
        assert_eq!(summary.min_latency_ms, 1000);
        assert_eq!(summary.max_latency_ms, 3000);
    }

    #[test]
    fn test_empty_summary() {
        assert_eq!(TcaAnalyzer::new().summary(), TcaSummary::default());
    }

    #[test]
    fn test_mismatched_fill_rejected() {
        let intent = OrderIntent::from_request(
            OrderId(1),
            OrderRequest::market("BTCUSDT", Side::Buy, 1.0),
            0,
            100.0,
        )
        .unwrap();
        let mut fill = fill_for(&intent, 100.0, 1000);
        fill.order_id = OrderId(9);

        let mut tca = TcaAnalyzer::new();
        assert!(tca.record(&intent, &fill).is_err());
        assert!(tca.is_empty());
    }
}
