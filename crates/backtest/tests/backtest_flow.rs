//! End-to-end backtests over SQLite-stored bars.

use approx::assert_abs_diff_eq;
use cta_backtest::{
    AccountView, BacktestEngine, BacktestReport, EngineState, MaRsiStrategy, OrderEvent, Strategy,
};
use cta_core::{Bar, Config, Error, Interval, OrderRequest, Result, Side, StrategyParams};
use cta_ingestion::{SqliteBarSource, VecBarSource};

const MIN: i64 = 60_000;

fn bar(i: i64, open: f64, high: f64, low: f64, close: f64) -> Bar {
    Bar {
        symbol: "BTCUSDT".to_string(),
        interval: Interval::Minute,
        ts_ms: i * MIN,
        open,
        high,
        low,
        close,
        volume: 25.0,
    }
}

/// Sine-like oscillation around 100 with a slow upward drift.
fn oscillating_bars(n: i64) -> Vec<Bar> {
    (0..n)
        .map(|i| {
            let close = 100.0 + 0.05 * i as f64 + 4.0 * ((i as f64) * 0.5).sin();
            let open = 100.0 + 0.05 * (i - 1) as f64 + 4.0 * (((i - 1) as f64) * 0.5).sin();
            bar(i, open, open.max(close) + 0.2, open.min(close) - 0.2, close)
        })
        .collect()
}

fn config(cash: f64) -> Config {
    let mut config = Config::default();
    config.backtest.initial_capital = cash;
    config
}

fn strategy_params() -> StrategyParams {
    StrategyParams::new()
        .with("fast_window", 3.0)
        .with("slow_window", 8.0)
        .with("rsi_window", 5.0)
        .with("rsi_entry", 45.0)
        .with("rsi_exit", 60.0)
        .with("risk_percent", 0.5)
}

fn sqlite_source(bars: &[Bar]) -> SqliteBarSource {
    let mut source = SqliteBarSource::in_memory().unwrap();
    source.insert_bars(bars).unwrap();
    source
}

#[test]
fn ma_rsi_backtest_over_sqlite() {
    let bars = oscillating_bars(300);
    let mut engine = BacktestEngine::new(config(10_000.0), sqlite_source(&bars)).unwrap();

    let report = engine
        .run::<MaRsiStrategy>(&strategy_params(), "BTCUSDT", 0, 300 * MIN)
        .unwrap();

    assert_eq!(engine.state(), EngineState::Completed);
    assert!(report.is_completed());
    assert_eq!(report.strategy, "ma_rsi");
    assert_eq!(report.bars_processed, 300);
    assert_eq!(report.equity_curve.len(), 300);
    assert!(!report.fills.is_empty(), "strategy never traded");

    // Fills alternate buy/sell for a long-only, one-order-at-a-time strategy.
    for pair in report.fills.windows(2) {
        assert_ne!(pair[0].side, pair[1].side);
    }
    assert_eq!(report.statistics.fill_count as usize, report.fills.len());
    assert_eq!(report.statistics.trade_count as usize, report.trades.len());
    assert_eq!(report.tca.summary.count, report.fills.len());

    // Final equity is cash plus the open position at the last close.
    let last_close = bars.last().unwrap().close;
    let held = report
        .final_account
        .positions
        .get("BTCUSDT")
        .map_or(0.0, |p| p.quantity);
    assert_abs_diff_eq!(
        report.statistics.final_equity,
        report.final_account.cash + held * last_close,
        epsilon = 1e-6
    );

    let total_fees: f64 = report.fills.iter().map(|f| f.fee).sum();
    assert_abs_diff_eq!(report.statistics.total_fees, total_fees, epsilon = 1e-9);
}

#[test]
fn report_serializes_to_json() {
    let bars = oscillating_bars(120);
    let mut engine = BacktestEngine::new(config(10_000.0), VecBarSource::new(bars)).unwrap();
    let report = engine
        .run::<MaRsiStrategy>(&strategy_params(), "BTCUSDT", 0, 120 * MIN)
        .unwrap();

    let json = serde_json::to_string(&report).unwrap();
    let back: BacktestReport = serde_json::from_str(&json).unwrap();
    assert_eq!(back.statistics, report.statistics);
    assert_eq!(back.decision_log, report.decision_log);
    assert!(json.contains("\"event\":\"accepted\""));
}

#[test]
fn range_filters_bars() {
    let bars = oscillating_bars(100);
    let mut engine = BacktestEngine::new(config(10_000.0), sqlite_source(&bars)).unwrap();
    let report = engine
        .run::<MaRsiStrategy>(&strategy_params(), "BTCUSDT", 10 * MIN, 50 * MIN)
        .unwrap();
    assert_eq!(report.bars_processed, 40);
    assert_eq!(report.equity_curve.first().unwrap().ts_ms, 10 * MIN);
    assert_eq!(report.equity_curve.last().unwrap().ts_ms, 49 * MIN);
}

#[test]
fn inverted_range_is_rejected() {
    let mut engine =
        BacktestEngine::new(config(10_000.0), sqlite_source(&oscillating_bars(10))).unwrap();
    let err = engine
        .run::<MaRsiStrategy>(&strategy_params(), "BTCUSDT", 5 * MIN, MIN)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRange { .. }));
}

#[test]
fn bad_strategy_params_are_rejected() {
    let mut engine =
        BacktestEngine::new(config(10_000.0), sqlite_source(&oscillating_bars(10))).unwrap();
    let params = StrategyParams::new().with("fast_window", 50.0);
    let err = engine
        .run::<MaRsiStrategy>(&params, "BTCUSDT", 0, 10 * MIN)
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert_eq!(engine.state(), EngineState::Initialized);
}

/// Places one order on the first bar, then watches.
struct OneShot {
    request: Option<OrderRequest>,
    events: Vec<OrderEvent>,
}

impl Strategy for OneShot {
    fn from_params(_params: &StrategyParams) -> Result<Self> {
        Ok(Self {
            request: None,
            events: Vec::new(),
        })
    }

    fn name(&self) -> &str {
        "one_shot"
    }

    fn on_bar(&mut self, _bar: &Bar, _account: &AccountView) -> Vec<OrderRequest> {
        self.request.take().into_iter().collect()
    }

    fn on_order_event(&mut self, event: &OrderEvent) {
        self.events.push(event.clone());
    }
}

#[test]
fn market_buy_example() {
    // 10,000 cash, buy 1 at the next open of 100 with a 0.1% fee.
    let bars = vec![
        bar(0, 98.0, 99.0, 97.0, 98.5),
        bar(1, 100.0, 101.0, 99.0, 100.5),
    ];
    let mut cfg = config(10_000.0);
    cfg.execution.fee_rate = 0.001;
    let mut engine = BacktestEngine::new(cfg, VecBarSource::new(bars)).unwrap();
    let mut strategy = OneShot {
        request: Some(OrderRequest::market("BTCUSDT", Side::Buy, 1.0)),
        events: Vec::new(),
    };
    let report = engine
        .run_strategy(&mut strategy, "BTCUSDT", 0, 2 * MIN)
        .unwrap();

    let account = &report.final_account;
    assert_abs_diff_eq!(account.cash, 9_899.9, epsilon = 1e-9);
    assert_eq!(account.positions["BTCUSDT"].quantity, 1.0);
    assert_abs_diff_eq!(account.positions["BTCUSDT"].avg_cost, 100.0, epsilon = 1e-12);
    assert_eq!(account.frozen_cash, 0.0);
}

#[test]
fn limit_buy_expiry_example() {
    // Limit buy at 95, expiry 3 bars, no bar trades down to 95.
    let bars: Vec<Bar> = (0..6).map(|i| bar(i, 100.0, 102.0, 96.0, 100.0)).collect();
    let mut cfg = config(10_000.0);
    cfg.execution.limit_expiry_bars = 3;
    let mut engine = BacktestEngine::new(cfg, VecBarSource::new(bars)).unwrap();
    let mut strategy = OneShot {
        request: Some(OrderRequest::limit("BTCUSDT", Side::Buy, 1.0, 95.0)),
        events: Vec::new(),
    };
    let report = engine
        .run_strategy(&mut strategy, "BTCUSDT", 0, 6 * MIN)
        .unwrap();

    assert!(report.fills.is_empty());
    assert!(matches!(strategy.events[0], OrderEvent::Accepted { .. }));
    assert!(matches!(strategy.events[1], OrderEvent::Expired { .. }));
    assert_eq!(strategy.events.len(), 2);
    assert_eq!(report.final_account.frozen_cash, 0.0);
    assert_eq!(report.final_account.available_cash, 10_000.0);
    assert_eq!(report.statistics.total_return, 0.0);
    assert!(report.statistics.sharpe_ratio.is_none());
}

#[test]
fn malformed_bar_fails_run_with_state() {
    let mut bars = oscillating_bars(20);
    bars[12].low = bars[12].high + 1.0;
    let mut engine = BacktestEngine::new(config(10_000.0), VecBarSource::new(bars)).unwrap();
    let report = engine
        .run::<MaRsiStrategy>(&strategy_params(), "BTCUSDT", 0, 20 * MIN)
        .unwrap();

    assert_eq!(report.state, EngineState::Failed);
    assert_eq!(report.failure.as_ref().unwrap().ts_ms, 12 * MIN);
    assert_eq!(report.bars_processed, 12);
    assert_eq!(report.equity_curve.len(), 12);
}
