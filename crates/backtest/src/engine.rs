//! Backtest engine.
//!
//! Replays historical bars through a strategy. Each bar first resolves the
//! orders placed on earlier bars, then shows the bar to the strategy, then
//! marks the account to the bar close. Runs are single-threaded and
//! deterministic.

use cta_core::{
    format_ts, Bar, Config, Error, Fill, Interval, OrderId, OrderIntent, OrderRequest, OrderType,
    ReservationId, Result, Side, StrategyParams, TimestampMs,
};
use cta_ingestion::{BarSource, MarketDataReplayer};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::fill_model::{FillDecision, FillModelConfig, FillSimulator};
use crate::metrics::{EquityCurve, EquityPoint, Statistics, StatisticsCalculator};
use crate::position::{AccountSnapshot, FillOutcome, PositionTracker, RealizedTrade};
use crate::strategy::{AccountView, OrderEvent, Strategy};
use crate::tca::{TcaAnalyzer, TcaReport};

/// Lifecycle of a backtest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Initialized,
    Running,
    Completed,
    Failed,
}

/// Why a run stopped early.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Bar being processed when the run stopped.
    pub ts_ms: TimestampMs,
    pub reason: String,
}

/// One entry in the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Bar timestamp at which the event happened.
    pub ts_ms: TimestampMs,
    #[serde(flatten)]
    pub event: OrderEvent,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub strategy: String,
    pub symbol: String,
    pub interval: Interval,
    pub start_ms: TimestampMs,
    pub end_ms: TimestampMs,
    pub state: EngineState,
    pub failure: Option<RunFailure>,
    pub bars_processed: usize,
    pub statistics: Statistics,
    pub fills: Vec<Fill>,
    pub trades: Vec<RealizedTrade>,
    pub equity_curve: Vec<EquityPoint>,
    pub decision_log: Vec<DecisionRecord>,
    pub tca: TcaReport,
    /// Ledger as of the end of the run, or as of the failure.
    pub final_account: AccountSnapshot,
}

impl BacktestReport {
    pub fn is_completed(&self) -> bool {
        self.state == EngineState::Completed
    }
}

/// An accepted order waiting for a bar to resolve it.
#[derive(Debug, Clone)]
struct PendingOrder {
    intent: OrderIntent,
    reservation: ReservationId,
    bars_waited: u32,
}

/// Mutable state of one run.
struct RunState {
    symbol: String,
    tracker: PositionTracker,
    tca: TcaAnalyzer,
    curve: EquityCurve,
    pending: Vec<PendingOrder>,
    fills: Vec<Fill>,
    log: Vec<DecisionRecord>,
    next_order_id: u64,
    last_ts: Option<TimestampMs>,
}

impl RunState {
    fn view(&self) -> AccountView {
        let position = self.tracker.position(&self.symbol);
        AccountView {
            cash: self.tracker.cash(),
            available_cash: self.tracker.available_cash(),
            position: position.map_or(0.0, |p| p.quantity),
            sellable: position.map_or(0.0, |p| p.available_quantity()),
            avg_cost: position.map_or(0.0, |p| p.avg_cost),
            pending_orders: self.pending.len(),
        }
    }

    fn emit(&mut self, strategy: &mut dyn Strategy, ts_ms: TimestampMs, event: OrderEvent) {
        strategy.on_order_event(&event);
        self.log.push(DecisionRecord { ts_ms, event });
    }
}

/// Backtest engine.
pub struct BacktestEngine<S: BarSource> {
    config: Config,
    source: S,
    fill_sim: FillSimulator,
    state: EngineState,
}

impl<S: BarSource> BacktestEngine<S> {
    /// Create an engine over `source`. The config is validated here.
    pub fn new(config: Config, source: S) -> Result<Self> {
        config.validate()?;
        let fill_sim = FillSimulator::new(FillModelConfig::from(&config.execution));
        Ok(Self {
            config,
            source,
            fill_sim,
            state: EngineState::Initialized,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build strategy `T` from `params` and run it over `[start, end)`.
    pub fn run<T: Strategy>(
        &mut self,
        params: &StrategyParams,
        symbol: &str,
        start: TimestampMs,
        end: TimestampMs,
    ) -> Result<BacktestReport> {
        if start >= end {
            return Err(Error::InvalidRange { start, end });
        }
        let mut strategy = T::from_params(params)?;
        self.run_strategy(&mut strategy, symbol, start, end)
    }

    /// Run an already-built strategy over `[start, end)`.
    ///
    /// Caller errors (bad range, no data, engine already used) come back as
    /// `Err`. Once bars are flowing, a fatal error stops the run and comes
    /// back as a report in the `Failed` state.
    pub fn run_strategy(
        &mut self,
        strategy: &mut dyn Strategy,
        symbol: &str,
        start: TimestampMs,
        end: TimestampMs,
    ) -> Result<BacktestReport> {
        if start >= end {
            return Err(Error::InvalidRange { start, end });
        }
        if self.state != EngineState::Initialized {
            return Err(Error::invariant(format!("engine cannot start from {:?}", self.state)));
        }

        let interval = self.config.instrument.interval;
        let bars = self.source.load(symbol, interval, start, end)?;
        if bars.is_empty() {
            return Err(Error::data(format!(
                "no {} bars for {symbol} in [{}, {})",
                interval.as_str(),
                format_ts(start),
                format_ts(end)
            )));
        }

        let initial_capital = self.config.backtest.initial_capital;
        let mut run = RunState {
            symbol: symbol.to_string(),
            tracker: PositionTracker::new(initial_capital, self.config.execution.fee_rate),
            tca: TcaAnalyzer::new(),
            curve: EquityCurve::new(initial_capital),
            pending: Vec::new(),
            fills: Vec::new(),
            log: Vec::new(),
            next_order_id: 1,
            last_ts: None,
        };

        self.state = EngineState::Running;
        info!(
            strategy = strategy.name(),
            symbol,
            interval = interval.as_str(),
            bars = bars.len(),
            start = %format_ts(start),
            end = %format_ts(end),
            "backtest started"
        );

        let mut replayer = MarketDataReplayer::new(bars);
        let progress_every = self.config.backtest.progress_every;
        let mut failure = None;

        while let Some(bar) = replayer.next_bar() {
            if let Err(e) = self.process_bar(&mut run, strategy, bar) {
                error!(ts = bar.ts_ms, error = %e, "backtest failed");
                failure = Some(RunFailure {
                    ts_ms: bar.ts_ms,
                    reason: e.to_string(),
                });
                break;
            }
            let processed = replayer.position();
            if progress_every > 0 && processed % progress_every == 0 {
                info!(
                    processed,
                    remaining = replayer.remaining(),
                    equity = run.curve.points().last().map_or(initial_capital, |p| p.equity),
                    "backtest progress"
                );
            }
        }

        let bars_processed = match failure {
            Some(_) => replayer.position().saturating_sub(1),
            None => replayer.position(),
        };

        if failure.is_none() {
            if let Err(e) = Self::cancel_pending(&mut run, strategy) {
                error!(error = %e, "failed to release pending orders");
                failure = Some(RunFailure {
                    ts_ms: run.last_ts.unwrap_or(start),
                    reason: e.to_string(),
                });
            }
        }

        self.state = if failure.is_some() {
            EngineState::Failed
        } else {
            EngineState::Completed
        };

        let calculator = StatisticsCalculator::new(initial_capital, self.config.periods_per_year());
        let statistics = calculator.calculate(run.curve.points(), run.tracker.realized_trades(), &run.fills);

        info!(
            state = ?self.state,
            bars = bars_processed,
            fills = run.fills.len(),
            trades = statistics.trade_count,
            total_return = statistics.total_return,
            max_drawdown = statistics.max_drawdown,
            "backtest finished"
        );

        Ok(BacktestReport {
            strategy: strategy.name().to_string(),
            symbol: symbol.to_string(),
            interval,
            start_ms: start,
            end_ms: end,
            state: self.state,
            failure,
            bars_processed,
            statistics,
            trades: run.tracker.realized_trades().to_vec(),
            final_account: run.tracker.snapshot(),
            tca: run.tca.report(),
            equity_curve: run.curve.into_points(),
            fills: run.fills,
            decision_log: run.log,
        })
    }

    /// One bar: resolve pending orders, consult the strategy, mark equity.
    fn process_bar(&self, run: &mut RunState, strategy: &mut dyn Strategy, bar: &Bar) -> Result<()> {
        if bar.symbol != run.symbol {
            return Err(Error::data(format!(
                "bar for {} in a {} run",
                bar.symbol, run.symbol
            )));
        }
        if let Some(previous) = run.last_ts {
            if bar.ts_ms <= previous {
                return Err(Error::OutOfOrderBar {
                    symbol: bar.symbol.clone(),
                    previous,
                    current: bar.ts_ms,
                });
            }
        }
        bar.validate()?;
        run.last_ts = Some(bar.ts_ms);

        self.resolve_pending(run, strategy, bar)?;

        let view = run.view();
        for request in strategy.on_bar(bar, &view) {
            self.submit(run, strategy, bar, request)?;
        }

        run.tracker.verify()?;
        let symbol = run.symbol.as_str();
        let equity = run.tracker.equity(|s| (s == symbol).then_some(bar.close));
        run.curve.push(bar.ts_ms, equity);
        Ok(())
    }

    fn resolve_pending(&self, run: &mut RunState, strategy: &mut dyn Strategy, bar: &Bar) -> Result<()> {
        let pending = std::mem::take(&mut run.pending);
        for mut order in pending {
            order.bars_waited += 1;
            match self.fill_sim.evaluate(&order.intent, bar, order.bars_waited)? {
                FillDecision::Filled(fill) => Self::settle(run, strategy, order, fill)?,
                FillDecision::Pending => run.pending.push(order),
                FillDecision::Expired => {
                    run.tracker.cancel_reservation(order.reservation)?;
                    debug!(order_id = %order.intent.id, waited = order.bars_waited, "order expired");
                    run.emit(strategy, bar.ts_ms, OrderEvent::Expired { order_id: order.intent.id });
                }
                FillDecision::Rejected(reason) => {
                    run.tracker.cancel_reservation(order.reservation)?;
                    warn!(order_id = %order.intent.id, reason, "order rejected by fill model");
                    run.emit(
                        strategy,
                        bar.ts_ms,
                        OrderEvent::Rejected {
                            order_id: order.intent.id,
                            reason,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    fn settle(run: &mut RunState, strategy: &mut dyn Strategy, order: PendingOrder, fill: Fill) -> Result<()> {
        match run.tracker.apply_fill(order.reservation, &fill) {
            Ok(FillOutcome::Applied { .. }) => {
                run.tca.record(&order.intent, &fill)?;
                run.fills.push(fill.clone());
                let ts = fill.ts_ms;
                run.emit(strategy, ts, OrderEvent::Filled { fill });
                Ok(())
            }
            Ok(FillOutcome::Duplicate) => Err(Error::invariant(format!(
                "simulated fill {} applied twice",
                fill.fill_id
            ))),
            Err(e) if e.is_rejection() => {
                run.tracker.cancel_reservation(order.reservation)?;
                warn!(order_id = %order.intent.id, error = %e, "fill rejected at settlement");
                run.emit(
                    strategy,
                    fill.ts_ms,
                    OrderEvent::Rejected {
                        order_id: order.intent.id,
                        reason: e.to_string(),
                    },
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Turn a strategy request into a pending order, or reject it.
    fn submit(&self, run: &mut RunState, strategy: &mut dyn Strategy, bar: &Bar, request: OrderRequest) -> Result<()> {
        let order_id = OrderId(run.next_order_id);
        run.next_order_id += 1;

        if request.symbol != run.symbol {
            let reason = format!("cannot trade {} in a {} run", request.symbol, run.symbol);
            run.emit(strategy, bar.ts_ms, OrderEvent::Rejected { order_id, reason });
            return Ok(());
        }

        let intent = match OrderIntent::from_request(order_id, request, bar.ts_ms, bar.close) {
            Ok(intent) => intent,
            Err(e @ Error::Order(_)) => {
                run.emit(strategy, bar.ts_ms, OrderEvent::Rejected { order_id, reason: e.to_string() });
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let price = match (intent.order_type, intent.side) {
            (OrderType::Market, Side::Buy) => intent.decision_price * (1.0 + self.config.execution.reserve_buffer),
            _ => intent.reference_price(),
        };

        match run.tracker.reserve(&intent.symbol, intent.side, intent.quantity, price) {
            Ok(reservation) => {
                debug!(order_id = %intent.id, %reservation, side = %intent.side, quantity = intent.quantity, "order accepted");
                run.pending.push(PendingOrder {
                    intent: intent.clone(),
                    reservation,
                    bars_waited: 0,
                });
                run.emit(strategy, bar.ts_ms, OrderEvent::Accepted { intent });
                Ok(())
            }
            Err(e) if e.is_rejection() || matches!(e, Error::Order(_)) => {
                debug!(order_id = %intent.id, error = %e, "order rejected");
                run.emit(
                    strategy,
                    bar.ts_ms,
                    OrderEvent::Rejected {
                        order_id: intent.id,
                        reason: e.to_string(),
                    },
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Release every order still pending at the end of the run.
    fn cancel_pending(run: &mut RunState, strategy: &mut dyn Strategy) -> Result<()> {
        let ts = run.last_ts.unwrap_or_default();
        for order in std::mem::take(&mut run.pending) {
            run.tracker.cancel_reservation(order.reservation)?;
            run.emit(strategy, ts, OrderEvent::Cancelled { order_id: order.intent.id });
        }
        run.tracker.verify()
    }
}
