//! Core data types for the cta-trader system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Timestamp in milliseconds since Unix epoch (UTC).
pub type TimestampMs = i64;

/// Render a timestamp as RFC 3339 for logs and reports.
pub fn format_ts(ts_ms: TimestampMs) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ts_ms) {
        Some(dt) => dt.to_rfc3339(),
        None => ts_ms.to_string(),
    }
}

/// Floor a timestamp to the start of its interval.
#[inline]
pub fn ts_to_interval(ts_ms: TimestampMs, interval: Interval) -> TimestampMs {
    let width = interval.duration_ms();
    ts_ms.div_euclid(width) * width
}

/// Bar interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1m")]
    Minute,
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "1d")]
    Day,
}

impl Interval {
    /// Interval width in milliseconds.
    pub fn duration_ms(self) -> i64 {
        match self {
            Interval::Minute => 60_000,
            Interval::Hour => 3_600_000,
            Interval::Day => 86_400_000,
        }
    }

    /// Number of bars in a year. Crypto markets trade around the clock.
    pub fn periods_per_year(self) -> f64 {
        match self {
            Interval::Minute => 525_600.0,
            Interval::Hour => 8_760.0,
            Interval::Day => 365.0,
        }
    }

    /// Short label used in storage and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Interval::Minute => "1m",
            Interval::Hour => "1h",
            Interval::Day => "1d",
        }
    }
}

impl std::str::FromStr for Interval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1m" => Ok(Interval::Minute),
            "1h" => Ok(Interval::Hour),
            "1d" => Ok(Interval::Day),
            other => Err(Error::config(format!("unknown interval '{other}'"))),
        }
    }
}

/// A single trade print from the exchange feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    /// Timestamp in milliseconds.
    pub ts_ms: TimestampMs,
    /// Trade price.
    pub price: f64,
    /// Trade size.
    pub size: f64,
}

/// OHLCV bar for one symbol over one interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Trading symbol (e.g., "BTCUSDT").
    pub symbol: String,
    /// Bar interval.
    pub interval: Interval,
    /// Interval start timestamp (ms).
    pub ts_ms: TimestampMs,
    /// Open price.
    pub open: f64,
    /// High price.
    pub high: f64,
    /// Low price.
    pub low: f64,
    /// Close price.
    pub close: f64,
    /// Total volume.
    pub volume: f64,
}

impl Bar {
    /// Whether `price` lies inside the traded range of this bar.
    #[inline]
    pub fn contains(&self, price: f64) -> bool {
        self.low <= price && price <= self.high
    }

    /// Check OHLC consistency (low <= open/close <= high, positive prices).
    pub fn validate(&self) -> Result<()> {
        let ok = self.low > 0.0
            && self.low <= self.high
            && self.contains(self.open)
            && self.contains(self.close)
            && self.volume >= 0.0;
        if ok {
            Ok(())
        } else {
            Err(Error::data(format!(
                "malformed bar {} @ {}: o={} h={} l={} c={} v={}",
                self.symbol, self.ts_ms, self.open, self.high, self.low, self.close, self.volume
            )))
        }
    }
}

/// Order side. Spot only, so a sell always reduces a long position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for buys, -1 for sells.
    #[inline]
    pub fn sign(self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => f.write_str("buy"),
            Side::Sell => f.write_str("sell"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

/// Identifier of an order intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "O{}", self.0)
    }
}

/// Handle for a cash or quantity hold placed by the position tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservationId(pub u64);

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Identifier of a fill. Exchange trade ids are strings, so simulated fills are too.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FillId(pub String);

impl fmt::Display for FillId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a strategy asks for. The engine stamps it into an [`OrderIntent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
}

impl OrderRequest {
    /// Market order request.
    pub fn market(symbol: impl Into<String>, side: Side, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            order_type: OrderType::Market,
            limit_price: None,
        }
    }

    /// Limit order request.
    pub fn limit(symbol: impl Into<String>, side: Side, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            order_type: OrderType::Limit,
            limit_price: Some(price),
        }
    }
}

/// An order intent, identical in backtest and live mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub id: OrderId,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub order_type: OrderType,
    /// Required for limit orders.
    pub limit_price: Option<f64>,
    /// Origination timestamp.
    pub ts_ms: TimestampMs,
    /// Last close when the intent was created.
    pub decision_price: f64,
}

impl OrderIntent {
    /// Stamp a strategy request with an id, timestamp and decision price.
    pub fn from_request(
        id: OrderId,
        request: OrderRequest,
        ts_ms: TimestampMs,
        decision_price: f64,
    ) -> Result<Self> {
        let intent = Self {
            id,
            symbol: request.symbol,
            side: request.side,
            quantity: request.quantity,
            order_type: request.order_type,
            limit_price: request.limit_price,
            ts_ms,
            decision_price,
        };
        intent.validate()?;
        Ok(intent)
    }

    /// Price the order is measured against: the limit for limit orders,
    /// the decision price for market orders.
    pub fn reference_price(&self) -> f64 {
        match (self.order_type, self.limit_price) {
            (OrderType::Limit, Some(limit)) => limit,
            _ => self.decision_price,
        }
    }

    /// Reject malformed intents before they reach the ledger.
    pub fn validate(&self) -> Result<()> {
        if !(self.quantity.is_finite() && self.quantity > 0.0) {
            return Err(Error::order(format!("{}: quantity must be positive, got {}", self.id, self.quantity)));
        }
        match (self.order_type, self.limit_price) {
            (OrderType::Limit, None) => {
                Err(Error::order(format!("{}: limit order without limit price", self.id)))
            }
            (OrderType::Limit, Some(p)) if !(p.is_finite() && p > 0.0) => {
                Err(Error::order(format!("{}: invalid limit price {p}", self.id)))
            }
            _ => Ok(()),
        }
    }
}

/// An executed trade, simulated or reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: FillId,
    pub order_id: OrderId,
    pub symbol: String,
    pub side: Side,
    /// Fill price.
    pub price: f64,
    /// Fill quantity (positive).
    pub quantity: f64,
    /// Timestamp of fill.
    pub ts_ms: TimestampMs,
    /// Fee paid in quote currency (positive).
    pub fee: f64,
}

impl Fill {
    /// Price × quantity.
    #[inline]
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }

    /// Cash change caused by this fill, fees included.
    pub fn cash_flow(&self) -> f64 {
        match self.side {
            Side::Buy => -(self.notional() + self.fee),
            Side::Sell => self.notional() - self.fee,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(low: f64, high: f64) -> Bar {
        Bar {
            symbol: "BTCUSDT".to_string(),
            interval: Interval::Minute,
            ts_ms: 0,
            open: low,
            high,
            low,
            close: high,
            volume: 1.0,
        }
    }

    #[test]
    fn test_ts_to_interval() {
        // 2024-01-01 00:01:30.500 -> 2024-01-01 00:01:00.000
        assert_eq!(ts_to_interval(1704067290500, Interval::Minute), 1704067260000);
        assert_eq!(ts_to_interval(1704067290500, Interval::Day), 1704067200000);
    }

    #[test]
    fn test_format_ts() {
        assert_eq!(format_ts(0), "1970-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_interval_parse() {
        assert_eq!("1h".parse::<Interval>().unwrap(), Interval::Hour);
        assert!("5m".parse::<Interval>().is_err());
    }

    #[test]
    fn test_bar_contains() {
        let b = bar(99.0, 101.0);
        assert!(b.contains(99.0));
        assert!(b.contains(101.0));
        assert!(!b.contains(101.01));
        assert!(b.validate().is_ok());
    }

    #[test]
    fn test_bar_validate_rejects_inverted_range() {
        let mut b = bar(99.0, 101.0);
        b.high = 98.0;
        assert!(b.validate().is_err());
    }

    #[test]
    fn test_reference_price() {
        let market = OrderIntent::from_request(
            OrderId(1),
            OrderRequest::market("BTCUSDT", Side::Buy, 1.0),
            0,
            100.0,
        )
        .unwrap();
        assert_eq!(market.reference_price(), 100.0);

        let limit = OrderIntent::from_request(
            OrderId(2),
            OrderRequest::limit("BTCUSDT", Side::Buy, 1.0, 95.0),
            0,
            100.0,
        )
        .unwrap();
        assert_eq!(limit.reference_price(), 95.0);
    }

    #[test]
    fn test_limit_without_price_rejected() {
        let mut request = OrderRequest::limit("BTCUSDT", Side::Sell, 1.0, 95.0);
        request.limit_price = None;
        assert!(OrderIntent::from_request(OrderId(1), request, 0, 100.0).is_err());
    }

    #[test]
    fn test_fill_cash_flow() {
        let fill = Fill {
            fill_id: FillId("F1".to_string()),
            order_id: OrderId(1),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            price: 100.0,
            quantity: 2.0,
            ts_ms: 0,
            fee: 0.2,
        };
        assert!((fill.cash_flow() + 200.2).abs() < 1e-10);
    }
}
