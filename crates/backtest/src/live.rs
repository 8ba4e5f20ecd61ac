//! Live account ledger.
//!
//! Wraps a [`PositionTracker`] for live trading, where exchange fill reports
//! arrive out of band. All ledger access goes through one mutex, so two
//! orders can never be checked against the same available-cash figure. Every
//! change is made on a copy of the ledger, written to the snapshot store, and
//! only then swapped in, so memory never runs ahead of disk.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use cta_core::{Error, Fill, FillId, OrderId, OrderIntent, OrderRequest, OrderType, Result, Side, TimestampMs};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::position::{AccountSnapshot, FillOutcome, PositionTracker};
use crate::snapshot::{OpenOrder, SessionSnapshot, SnapshotStore};
use crate::strategy::AccountView;
use crate::tca::{TcaAnalyzer, TcaReport};

/// Acknowledgement for an exchange fill report.
#[derive(Debug, Clone, PartialEq)]
pub enum FillAck {
    /// Settled and persisted.
    Applied {
        fill_id: FillId,
        realized_pnl: Option<f64>,
    },
    /// Already settled earlier; nothing changed.
    Duplicate { fill_id: FillId },
}

/// A fill report plus the channel its acknowledgement goes back on.
#[derive(Debug)]
pub struct FillNotification {
    pub fill: Fill,
    pub ack: oneshot::Sender<Result<FillAck>>,
}

#[derive(Clone)]
struct LiveState {
    tracker: PositionTracker,
    open_orders: BTreeMap<OrderId, OpenOrder>,
    tca: TcaAnalyzer,
    next_order_id: u64,
}

impl LiveState {
    fn session_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            account: self.tracker.snapshot(),
            open_orders: self.open_orders.values().cloned().collect(),
            next_order_id: self.next_order_id,
        }
    }
}

/// Thread-safe live ledger backed by a snapshot store.
pub struct LiveAccount {
    state: Mutex<LiveState>,
    store: Box<dyn SnapshotStore>,
    /// Extra fraction held on top of the decision price for market buys.
    reserve_buffer: f64,
    /// Log a TCA summary every this many settled fills (0 = never).
    tca_log_every: usize,
}

impl LiveAccount {
    /// Resume from the store's latest snapshot, or start flat with
    /// `initial_cash` when there is none.
    pub fn open(
        store: Box<dyn SnapshotStore>,
        initial_cash: f64,
        fee_rate: f64,
        reserve_buffer: f64,
    ) -> Result<Self> {
        let state = match store.load()? {
            Some(snapshot) => {
                let tracker = PositionTracker::from_snapshot(&snapshot.account)?;
                let open_orders: BTreeMap<OrderId, OpenOrder> = snapshot
                    .open_orders
                    .into_iter()
                    .map(|o| (o.intent.id, o))
                    .collect();
                for order in open_orders.values() {
                    if tracker.reservation(order.reservation).is_none() {
                        return Err(Error::invariant(format!(
                            "open order {} refers to missing reservation {}",
                            order.intent.id, order.reservation
                        )));
                    }
                }
                info!(
                    cash = tracker.cash(),
                    open_orders = open_orders.len(),
                    "live account resumed"
                );
                LiveState {
                    tracker,
                    open_orders,
                    tca: TcaAnalyzer::new(),
                    next_order_id: snapshot.next_order_id,
                }
            }
            None => {
                info!(initial_cash, "live account started flat");
                LiveState {
                    tracker: PositionTracker::new(initial_cash, fee_rate),
                    open_orders: BTreeMap::new(),
                    tca: TcaAnalyzer::new(),
                    next_order_id: 1,
                }
            }
        };

        Ok(Self {
            state: Mutex::new(state),
            store,
            reserve_buffer,
            tca_log_every: 0,
        })
    }

    /// Log a TCA summary every `n` settled fills.
    pub fn with_tca_log_every(mut self, n: usize) -> Self {
        self.tca_log_every = n;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, LiveState>> {
        self.state
            .lock()
            .map_err(|_| Error::invariant("live account lock poisoned"))
    }

    /// Write `next` to the store, then make it the live state.
    fn commit(&self, state: &mut LiveState, next: LiveState) -> Result<()> {
        self.store.save(&next.session_snapshot())?;
        *state = next;
        Ok(())
    }

    /// Reserve funds for a strategy request and return the intent to route
    /// to the exchange. Rejections come back as `Err` with
    /// [`Error::is_rejection`] set.
    pub fn submit(&self, request: OrderRequest, ts_ms: TimestampMs, decision_price: f64) -> Result<OrderIntent> {
        let mut state = self.lock()?;
        let intent = OrderIntent::from_request(OrderId(state.next_order_id), request, ts_ms, decision_price)?;
        let price = match (intent.order_type, intent.side) {
            (OrderType::Market, Side::Buy) => intent.decision_price * (1.0 + self.reserve_buffer),
            _ => intent.reference_price(),
        };

        let mut next = state.clone();
        let reservation = next
            .tracker
            .reserve(&intent.symbol, intent.side, intent.quantity, price)?;
        next.next_order_id += 1;
        next.open_orders.insert(
            intent.id,
            OpenOrder {
                intent: intent.clone(),
                reservation,
            },
        );

        self.commit(&mut state, next)?;
        info!(order_id = %intent.id, %reservation, side = %intent.side, quantity = intent.quantity, "order submitted");
        Ok(intent)
    }

    /// Cancel a pending order and release its hold.
    pub fn cancel(&self, order_id: OrderId) -> Result<()> {
        let mut state = self.lock()?;
        let mut next = state.clone();
        let order = next
            .open_orders
            .remove(&order_id)
            .ok_or_else(|| Error::order(format!("no open order {order_id}")))?;
        next.tracker.cancel_reservation(order.reservation)?;

        self.commit(&mut state, next)?;
        info!(%order_id, "order cancelled");
        Ok(())
    }

    /// Settle an exchange fill. Returns only after the new state is durable.
    pub fn on_fill(&self, fill: &Fill) -> Result<FillAck> {
        let mut state = self.lock()?;

        if state.tracker.has_applied(&fill.fill_id) {
            debug!(fill_id = %fill.fill_id, "duplicate fill report");
            return Ok(FillAck::Duplicate {
                fill_id: fill.fill_id.clone(),
            });
        }

        let order = state
            .open_orders
            .get(&fill.order_id)
            .cloned()
            .ok_or_else(|| Error::order(format!("fill {} for unknown order {}", fill.fill_id, fill.order_id)))?;

        let mut next = state.clone();
        let realized_pnl = match next.tracker.apply_fill(order.reservation, fill)? {
            FillOutcome::Applied { realized_pnl } => realized_pnl,
            FillOutcome::Duplicate => {
                return Ok(FillAck::Duplicate {
                    fill_id: fill.fill_id.clone(),
                })
            }
        };
        next.open_orders.remove(&fill.order_id);
        if let Err(e) = next.tca.record(&order.intent, fill) {
            warn!(fill_id = %fill.fill_id, error = %e, "fill not recorded for TCA");
        }

        self.commit(&mut state, next)?;
        info!(fill_id = %fill.fill_id, order_id = %fill.order_id, price = fill.price, "fill settled");
        self.log_tca(&state.tca);
        Ok(FillAck::Applied {
            fill_id: fill.fill_id.clone(),
            realized_pnl,
        })
    }

    fn log_tca(&self, tca: &TcaAnalyzer) {
        if self.tca_log_every == 0 || tca.is_empty() || tca.len() % self.tca_log_every != 0 {
            return;
        }
        let summary = tca.summary();
        info!(
            fills = summary.count,
            mean_slippage_pct = summary.mean_slippage_pct,
            median_slippage_pct = summary.median_slippage_pct,
            mean_adverse_slippage_pct = summary.mean_adverse_slippage_pct,
            mean_latency_ms = summary.mean_latency_ms,
            "tca summary"
        );
    }

    /// Account view for one symbol.
    pub fn view(&self, symbol: &str) -> Result<AccountView> {
        let state = self.lock()?;
        let position = state.tracker.position(symbol);
        Ok(AccountView {
            cash: state.tracker.cash(),
            available_cash: state.tracker.available_cash(),
            position: position.map_or(0.0, |p| p.quantity),
            sellable: position.map_or(0.0, |p| p.available_quantity()),
            avg_cost: position.map_or(0.0, |p| p.avg_cost),
            pending_orders: state
                .open_orders
                .values()
                .filter(|o| o.intent.symbol == symbol)
                .count(),
        })
    }

    pub fn snapshot(&self) -> Result<AccountSnapshot> {
        Ok(self.lock()?.tracker.snapshot())
    }

    pub fn open_orders(&self) -> Result<Vec<OpenOrder>> {
        Ok(self.lock()?.open_orders.values().cloned().collect())
    }

    /// TCA for fills settled in this process.
    pub fn tca_report(&self) -> Result<TcaReport> {
        Ok(self.lock()?.tca.report())
    }
}

/// Settle fill notifications until the sender side closes.
///
/// Each fill is applied on the blocking pool, since settlement waits for the
/// snapshot to reach disk.
pub async fn run_fill_listener(account: Arc<LiveAccount>, mut rx: mpsc::Receiver<FillNotification>) {
    info!("fill listener started");
    let mut handled = 0usize;

    while let Some(FillNotification { fill, ack }) = rx.recv().await {
        let account = Arc::clone(&account);
        let fill_id = fill.fill_id.clone();
        let result = tokio::task::spawn_blocking(move || account.on_fill(&fill))
            .await
            .unwrap_or_else(|e| Err(Error::invariant(format!("fill task failed: {e}"))));

        match &result {
            Ok(ack) => debug!(%fill_id, ?ack, "fill acknowledged"),
            Err(e) => warn!(%fill_id, error = %e, "fill not applied"),
        }
        if ack.send(result).is_err() {
            warn!(%fill_id, "fill notifier went away before the ack");
        }
        handled += 1;
    }

    info!(handled, "fill listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{JsonFileStore, SqliteSnapshotStore};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Store whose writes can be switched to fail.
    struct FlakyStore {
        inner: Arc<SqliteSnapshotStore>,
        failing: Arc<AtomicBool>,
    }

    impl SnapshotStore for FlakyStore {
        fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::database("disk full"));
            }
            self.inner.save(snapshot)
        }

        fn load(&self) -> Result<Option<SessionSnapshot>> {
            self.inner.load()
        }
    }

    fn flaky_account(cash: f64) -> (LiveAccount, Arc<SqliteSnapshotStore>, Arc<AtomicBool>) {
        let inner = Arc::new(SqliteSnapshotStore::in_memory().unwrap());
        let failing = Arc::new(AtomicBool::new(false));
        let store = FlakyStore {
            inner: Arc::clone(&inner),
            failing: Arc::clone(&failing),
        };
        let account = LiveAccount::open(Box::new(store), cash, 0.001, 0.0).unwrap();
        (account, inner, failing)
    }

    fn fill(id: &str, order_id: OrderId, side: Side, price: f64, quantity: f64) -> Fill {
        Fill {
            fill_id: FillId(id.to_string()),
            order_id,
            symbol: "BTCUSDT".to_string(),
            side,
            price,
            quantity,
            ts_ms: 1_000,
            fee: price * quantity * 0.001,
        }
    }

    #[test]
    fn test_submit_fill_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");

        let account = LiveAccount::open(Box::new(JsonFileStore::new(&path)), 10_000.0, 0.001, 0.0).unwrap();
        let intent = account
            .submit(OrderRequest::market("BTCUSDT", Side::Buy, 1.0), 0, 100.0)
            .unwrap();
        let ack = account.on_fill(&fill("T1", intent.id, Side::Buy, 100.0, 1.0)).unwrap();
        assert!(matches!(ack, FillAck::Applied { realized_pnl: None, .. }));

        let pending = account
            .submit(OrderRequest::limit("BTCUSDT", Side::Sell, 1.0, 120.0), 10, 100.0)
            .unwrap();
        let before = account.snapshot().unwrap();
        drop(account);

        // Restart from disk.
        let resumed = LiveAccount::open(Box::new(JsonFileStore::new(&path)), 0.0, 0.001, 0.0).unwrap();
        assert_eq!(resumed.snapshot().unwrap(), before);
        assert_eq!(resumed.open_orders().unwrap().len(), 1);
        assert!((resumed.snapshot().unwrap().cash - 9_899.9).abs() < 1e-9);

        // Replayed fill from before the restart is ignored.
        let replay = resumed.on_fill(&fill("T1", intent.id, Side::Buy, 100.0, 1.0)).unwrap();
        assert!(matches!(replay, FillAck::Duplicate { .. }));

        let ack = resumed.on_fill(&fill("T2", pending.id, Side::Sell, 120.0, 1.0)).unwrap();
        assert!(matches!(ack, FillAck::Applied { realized_pnl: Some(p), .. } if (p - 20.0).abs() < 1e-9));
        assert!(resumed.open_orders().unwrap().is_empty());
    }

    #[test]
    fn test_rejection_leaves_store_untouched() {
        let store = SqliteSnapshotStore::in_memory().unwrap();
        let account = LiveAccount::open(Box::new(store), 50.0, 0.001, 0.0).unwrap();

        let err = account
            .submit(OrderRequest::market("BTCUSDT", Side::Buy, 1.0), 0, 100.0)
            .unwrap_err();
        assert!(err.is_rejection());
        assert!(account.open_orders().unwrap().is_empty());
        assert_eq!(account.snapshot().unwrap().available_cash, 50.0);
    }

    #[test]
    fn test_cancel_releases_hold() {
        let account =
            LiveAccount::open(Box::new(SqliteSnapshotStore::in_memory().unwrap()), 1_000.0, 0.0, 0.0).unwrap();
        let intent = account
            .submit(OrderRequest::limit("BTCUSDT", Side::Buy, 1.0, 95.0), 0, 100.0)
            .unwrap();
        assert_eq!(account.view("BTCUSDT").unwrap().pending_orders, 1);

        account.cancel(intent.id).unwrap();
        assert_eq!(account.snapshot().unwrap().frozen_cash, 0.0);
        assert!(account.cancel(intent.id).is_err());
    }

    #[test]
    fn test_fill_for_unknown_order() {
        let account =
            LiveAccount::open(Box::new(SqliteSnapshotStore::in_memory().unwrap()), 1_000.0, 0.0, 0.0).unwrap();
        let err = account
            .on_fill(&fill("T9", OrderId(42), Side::Buy, 100.0, 1.0))
            .unwrap_err();
        assert!(matches!(err, Error::Order(_)));
    }

    #[tokio::test]
    async fn test_fill_listener_acks_each_fill() {
        let account = Arc::new(
            LiveAccount::open(Box::new(SqliteSnapshotStore::in_memory().unwrap()), 10_000.0, 0.001, 0.0).unwrap(),
        );
        let intent = account
            .submit(OrderRequest::market("BTCUSDT", Side::Buy, 1.0), 0, 100.0)
            .unwrap();

        let (tx, rx) = mpsc::channel(8);
        let listener = tokio::spawn(run_fill_listener(Arc::clone(&account), rx));

        for _ in 0..2 {
            let (ack_tx, ack_rx) = oneshot::channel();
            tx.send(FillNotification {
                fill: fill("T1", intent.id, Side::Buy, 100.0, 1.0),
                ack: ack_tx,
            })
            .await
            .unwrap();
            assert!(ack_rx.await.unwrap().is_ok());
        }
        drop(tx);
        listener.await.unwrap();

        let snapshot = account.snapshot().unwrap();
        assert_eq!(snapshot.positions["BTCUSDT"].quantity, 1.0);
        assert_eq!(snapshot.applied_fills.len(), 1);
    }

    #[test]
    fn test_failed_write_rolls_back_submit() {
        let (account, durable, failing) = flaky_account(10_000.0);
        failing.store(true, Ordering::SeqCst);

        let err = account
            .submit(OrderRequest::market("BTCUSDT", Side::Buy, 1.0), 0, 100.0)
            .unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        assert!(account.open_orders().unwrap().is_empty());
        assert_eq!(account.snapshot().unwrap().frozen_cash, 0.0);
        assert!(durable.load().unwrap().is_none());

        // Order ids are not burned by the failed attempt.
        failing.store(false, Ordering::SeqCst);
        let intent = account
            .submit(OrderRequest::market("BTCUSDT", Side::Buy, 1.0), 0, 100.0)
            .unwrap();
        assert_eq!(intent.id, OrderId(1));
    }

    #[test]
    fn test_failed_write_does_not_settle_fill() {
        let (account, durable, failing) = flaky_account(10_000.0);
        let intent = account
            .submit(OrderRequest::market("BTCUSDT", Side::Buy, 1.0), 0, 100.0)
            .unwrap();
        let report = fill("T1", intent.id, Side::Buy, 100.0, 1.0);

        failing.store(true, Ordering::SeqCst);
        assert!(account.on_fill(&report).is_err());
        // A retry while storage is still down must not be acknowledged.
        assert!(account.on_fill(&report).is_err());

        let in_memory = account.snapshot().unwrap();
        assert!(in_memory.applied_fills.is_empty());
        assert!(in_memory.positions.is_empty());
        assert_eq!(account.open_orders().unwrap().len(), 1);
        assert!(durable.load().unwrap().unwrap().account.applied_fills.is_empty());

        failing.store(false, Ordering::SeqCst);
        let ack = account.on_fill(&report).unwrap();
        assert!(matches!(ack, FillAck::Applied { .. }));
        let stored = durable.load().unwrap().unwrap();
        assert_eq!(stored.account.applied_fills, vec![FillId("T1".to_string())]);
        assert_eq!(stored.account.positions["BTCUSDT"].quantity, 1.0);
        assert_eq!(account.tca_report().unwrap().records.len(), 1);
    }

    #[test]
    fn test_failed_write_keeps_order_open_on_cancel() {
        let (account, durable, failing) = flaky_account(1_000.0);
        let intent = account
            .submit(OrderRequest::limit("BTCUSDT", Side::Buy, 1.0, 95.0), 0, 100.0)
            .unwrap();
        let held = account.snapshot().unwrap().frozen_cash;
        assert!(held > 0.0);

        failing.store(true, Ordering::SeqCst);
        assert!(account.cancel(intent.id).is_err());
        assert_eq!(account.open_orders().unwrap().len(), 1);
        assert_eq!(account.snapshot().unwrap().frozen_cash, held);

        failing.store(false, Ordering::SeqCst);
        account.cancel(intent.id).unwrap();
        assert!(durable.load().unwrap().unwrap().open_orders.is_empty());
        assert_eq!(account.snapshot().unwrap().frozen_cash, 0.0);
    }

    #[test]
    fn test_periodic_tca_summary() {
        let account = LiveAccount::open(Box::new(SqliteSnapshotStore::in_memory().unwrap()), 10_000.0, 0.001, 0.0)
            .unwrap()
            .with_tca_log_every(2);
        for (i, id) in ["T1", "T2"].into_iter().enumerate() {
            let intent = account
                .submit(OrderRequest::market("BTCUSDT", Side::Buy, 1.0), i as i64, 100.0)
                .unwrap();
            account.on_fill(&fill(id, intent.id, Side::Buy, 100.0, 1.0)).unwrap();
        }
        assert_eq!(account.tca_report().unwrap().summary.count, 2);
    }
}
