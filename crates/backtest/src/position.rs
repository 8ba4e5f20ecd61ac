//! Position and fund tracking.
//!
//! The tracker is the ledger of record for cash and spot holdings. Orders
//! place a reservation before they can fill; fills settle the reservation.
//! Every check runs before any mutation, so a rejected call leaves the ledger
//! exactly as it was.

use std::collections::{BTreeMap, BTreeSet};

use cta_core::{Error, Fill, FillId, ReservationId, Result, Side, TimestampMs};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Quantities below this are treated as zero.
const QTY_EPS: f64 = 1e-9;
/// Tolerance for cash comparisons in invariant checks.
const CASH_EPS: f64 = 1e-6;

/// A long spot holding in one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Quantity held (never negative).
    pub quantity: f64,
    /// Quantity held back for outstanding sell orders.
    pub reserved_quantity: f64,
    /// Average cost basis per unit, fees excluded.
    pub avg_cost: f64,
}

impl Position {
    /// Quantity free to sell.
    pub fn available_quantity(&self) -> f64 {
        (self.quantity - self.reserved_quantity).max(0.0)
    }

    /// Mark-to-market value.
    pub fn market_value(&self, price: f64) -> f64 {
        self.quantity * price
    }

    /// Unrealized P&L at current price.
    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.avg_cost) * self.quantity
    }
}

/// A hold on cash (buys) or quantity (sells) pending order resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    /// Price the hold was sized at.
    pub price: f64,
    /// Cash frozen by this reservation (zero for sells).
    pub frozen_cash: f64,
}

/// Realized result of a sell fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealizedTrade {
    pub fill_id: FillId,
    pub symbol: String,
    pub ts_ms: TimestampMs,
    pub quantity: f64,
    /// Average cost basis at the time of the sale.
    pub entry_price: f64,
    pub exit_price: f64,
    /// (exit - entry) * quantity.
    pub pnl: f64,
    /// Fee paid on the sale.
    pub fee: f64,
}

/// Result of applying a fill.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillOutcome {
    /// Fill settled. Sells carry their realized P&L.
    Applied { realized_pnl: Option<f64> },
    /// Fill id was already applied; nothing changed.
    Duplicate,
}

/// Immutable copy of the whole ledger, used for persistence and restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    /// Timestamp of the last ledger change.
    pub updated_at_ms: TimestampMs,
    pub fee_rate: f64,
    pub cash: f64,
    pub frozen_cash: f64,
    pub available_cash: f64,
    pub positions: BTreeMap<String, Position>,
    pub reservations: Vec<Reservation>,
    pub applied_fills: Vec<FillId>,
    pub realized_pnl: f64,
    pub total_fees: f64,
    pub next_reservation_id: u64,
}

/// Cash and position ledger.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    fee_rate: f64,
    cash: f64,
    positions: BTreeMap<String, Position>,
    reservations: BTreeMap<ReservationId, Reservation>,
    applied_fills: BTreeSet<FillId>,
    realized: Vec<RealizedTrade>,
    realized_pnl: f64,
    total_fees: f64,
    next_reservation_id: u64,
    updated_at_ms: TimestampMs,
}

impl PositionTracker {
    /// Create a flat ledger holding `initial_cash`.
    pub fn new(initial_cash: f64, fee_rate: f64) -> Self {
        Self {
            fee_rate,
            cash: initial_cash,
            positions: BTreeMap::new(),
            reservations: BTreeMap::new(),
            applied_fills: BTreeSet::new(),
            realized: Vec::new(),
            realized_pnl: 0.0,
            total_fees: 0.0,
            next_reservation_id: 1,
            updated_at_ms: 0,
        }
    }

    /// Rebuild a ledger from a persisted snapshot.
    ///
    /// The per-trade realized history is not part of the snapshot; only its
    /// running total survives a restart.
    pub fn from_snapshot(snapshot: &AccountSnapshot) -> Result<Self> {
        let tracker = Self {
            fee_rate: snapshot.fee_rate,
            cash: snapshot.cash,
            positions: snapshot.positions.clone(),
            reservations: snapshot
                .reservations
                .iter()
                .map(|r| (r.id, r.clone()))
                .collect(),
            applied_fills: snapshot.applied_fills.iter().cloned().collect(),
            realized: Vec::new(),
            realized_pnl: snapshot.realized_pnl,
            total_fees: snapshot.total_fees,
            next_reservation_id: snapshot.next_reservation_id,
            updated_at_ms: snapshot.updated_at_ms,
        };

        let frozen = tracker.frozen_cash();
        if (frozen - snapshot.frozen_cash).abs() > CASH_EPS {
            return Err(Error::invariant(format!(
                "snapshot frozen cash {} does not match reservations {}",
                snapshot.frozen_cash, frozen
            )));
        }
        if let Some(max_id) = tracker.reservations.keys().next_back() {
            if max_id.0 >= tracker.next_reservation_id {
                return Err(Error::invariant("snapshot reservation id counter is behind"));
            }
        }
        tracker.verify()?;
        info!(
            cash = tracker.cash,
            frozen = frozen,
            positions = tracker.positions.len(),
            reservations = tracker.reservations.len(),
            "ledger restored from snapshot"
        );
        Ok(tracker)
    }

    /// Place a hold for an order.
    ///
    /// Buys freeze `quantity * price * (1 + fee_rate)` of available cash.
    /// Sells reserve quantity so it cannot be sold twice.
    pub fn reserve(
        &mut self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> Result<ReservationId> {
        if !(quantity.is_finite() && quantity > 0.0) {
            return Err(Error::order(format!("reservation quantity must be positive, got {quantity}")));
        }
        if !(price.is_finite() && price > 0.0) {
            return Err(Error::order(format!("reservation price must be positive, got {price}")));
        }

        let frozen_cash = match side {
            Side::Buy => {
                let required = quantity * price * (1.0 + self.fee_rate);
                let available = self.available_cash();
                if required > available {
                    return Err(Error::InsufficientFunds { required, available });
                }
                required
            }
            Side::Sell => {
                let available = self
                    .positions
                    .get(symbol)
                    .map(Position::available_quantity)
                    .unwrap_or(0.0);
                if available <= QTY_EPS || quantity > available + QTY_EPS {
                    return Err(Error::InsufficientPosition {
                        symbol: symbol.to_string(),
                        requested: quantity,
                        available,
                    });
                }
                0.0
            }
        };

        // Checks passed; mutate.
        if side == Side::Sell {
            if let Some(pos) = self.positions.get_mut(symbol) {
                pos.reserved_quantity += quantity;
            }
        }
        let id = ReservationId(self.next_reservation_id);
        self.next_reservation_id += 1;
        self.reservations.insert(
            id,
            Reservation {
                id,
                symbol: symbol.to_string(),
                side,
                quantity,
                price,
                frozen_cash,
            },
        );

        debug!(%id, symbol, %side, quantity, price, frozen_cash, "reservation placed");
        Ok(id)
    }

    /// Settle a fill against its reservation. Idempotent on the fill id.
    pub fn apply_fill(&mut self, reservation_id: ReservationId, fill: &Fill) -> Result<FillOutcome> {
        if self.applied_fills.contains(&fill.fill_id) {
            debug!(fill_id = %fill.fill_id, "duplicate fill ignored");
            return Ok(FillOutcome::Duplicate);
        }

        let reservation = self
            .reservations
            .get(&reservation_id)
            .ok_or(Error::UnknownReservation(reservation_id))?;
        Self::check_fill_matches(reservation, fill)?;

        let realized_pnl = match fill.side {
            Side::Buy => {
                let cost = fill.notional() + fill.fee;
                let available = self.cash - (self.frozen_cash() - reservation.frozen_cash);
                if cost > available {
                    return Err(Error::InsufficientFunds {
                        required: cost,
                        available,
                    });
                }

                self.reservations.remove(&reservation_id);
                self.cash -= cost;
                let pos = self.positions.entry(fill.symbol.clone()).or_insert(Position {
                    quantity: 0.0,
                    reserved_quantity: 0.0,
                    avg_cost: 0.0,
                });
                let new_qty = pos.quantity + fill.quantity;
                pos.avg_cost = (pos.avg_cost * pos.quantity + fill.price * fill.quantity) / new_qty;
                pos.quantity = new_qty;
                None
            }
            Side::Sell => {
                let pos = self.positions.get(&fill.symbol).ok_or_else(|| {
                    Error::invariant(format!("sell reservation {reservation_id} without a position in {}", fill.symbol))
                })?;
                if pos.reserved_quantity + QTY_EPS < fill.quantity || pos.quantity + QTY_EPS < fill.quantity {
                    return Err(Error::invariant(format!(
                        "sell of {} exceeds reserved {} / held {} in {}",
                        fill.quantity, pos.reserved_quantity, pos.quantity, fill.symbol
                    )));
                }
                let entry_price = pos.avg_cost;
                let pnl = (fill.price - entry_price) * fill.quantity;

                self.reservations.remove(&reservation_id);
                self.cash += fill.notional() - fill.fee;
                let flat = match self.positions.get_mut(&fill.symbol) {
                    Some(pos) => {
                        pos.reserved_quantity = (pos.reserved_quantity - fill.quantity).max(0.0);
                        pos.quantity -= fill.quantity;
                        if pos.quantity < QTY_EPS {
                            pos.quantity = 0.0;
                        }
                        pos.quantity == 0.0 && pos.reserved_quantity < QTY_EPS
                    }
                    None => false,
                };
                if flat {
                    self.positions.remove(&fill.symbol);
                }

                self.realized_pnl += pnl;
                self.realized.push(RealizedTrade {
                    fill_id: fill.fill_id.clone(),
                    symbol: fill.symbol.clone(),
                    ts_ms: fill.ts_ms,
                    quantity: fill.quantity,
                    entry_price,
                    exit_price: fill.price,
                    pnl,
                    fee: fill.fee,
                });
                Some(pnl)
            }
        };

        self.total_fees += fill.fee;
        self.applied_fills.insert(fill.fill_id.clone());
        self.updated_at_ms = self.updated_at_ms.max(fill.ts_ms);

        info!(
            fill_id = %fill.fill_id,
            symbol = %fill.symbol,
            side = %fill.side,
            price = fill.price,
            quantity = fill.quantity,
            fee = fill.fee,
            cash = self.cash,
            available = self.available_cash(),
            "fill applied"
        );
        Ok(FillOutcome::Applied { realized_pnl })
    }

    fn check_fill_matches(reservation: &Reservation, fill: &Fill) -> Result<()> {
        if reservation.symbol != fill.symbol || reservation.side != fill.side {
            return Err(Error::order(format!(
                "fill {} ({} {}) does not match reservation {} ({} {})",
                fill.fill_id, fill.side, fill.symbol, reservation.id, reservation.side, reservation.symbol
            )));
        }
        let tolerance = QTY_EPS * reservation.quantity.max(1.0);
        if (fill.quantity - reservation.quantity).abs() > tolerance {
            return Err(Error::order(format!(
                "fill {} quantity {} differs from reserved {}; partial fills are not supported",
                fill.fill_id, fill.quantity, reservation.quantity
            )));
        }
        if !(fill.price.is_finite() && fill.price > 0.0 && fill.fee >= 0.0) {
            return Err(Error::order(format!("fill {} has invalid price or fee", fill.fill_id)));
        }
        Ok(())
    }

    /// Release a hold without a fill (cancel, reject, expiry).
    pub fn cancel_reservation(&mut self, reservation_id: ReservationId) -> Result<Reservation> {
        let reservation = self
            .reservations
            .remove(&reservation_id)
            .ok_or(Error::UnknownReservation(reservation_id))?;

        if reservation.side == Side::Sell {
            match self.positions.get_mut(&reservation.symbol) {
                Some(pos) => {
                    pos.reserved_quantity = (pos.reserved_quantity - reservation.quantity).max(0.0);
                }
                None => warn!(%reservation_id, symbol = %reservation.symbol, "sell reservation without position"),
            }
        }

        debug!(%reservation_id, released_cash = reservation.frozen_cash, "reservation cancelled");
        Ok(reservation)
    }

    /// Check ledger invariants. A failure means a logic defect.
    pub fn verify(&self) -> Result<()> {
        let frozen = self.frozen_cash();
        if frozen < 0.0 {
            return Err(Error::invariant(format!("frozen cash is negative: {frozen}")));
        }
        if self.cash - frozen < -CASH_EPS {
            return Err(Error::invariant(format!(
                "available cash is negative: cash {} frozen {}",
                self.cash, frozen
            )));
        }
        for (symbol, pos) in &self.positions {
            if pos.quantity < 0.0 || pos.reserved_quantity < 0.0 {
                return Err(Error::invariant(format!("negative quantity in {symbol}")));
            }
            if pos.reserved_quantity > pos.quantity + QTY_EPS {
                return Err(Error::invariant(format!(
                    "{symbol}: reserved {} exceeds held {}",
                    pos.reserved_quantity, pos.quantity
                )));
            }
        }
        Ok(())
    }

    /// Copy of the full ledger state.
    pub fn snapshot(&self) -> AccountSnapshot {
        let frozen_cash = self.frozen_cash();
        AccountSnapshot {
            updated_at_ms: self.updated_at_ms,
            fee_rate: self.fee_rate,
            cash: self.cash,
            frozen_cash,
            available_cash: self.cash - frozen_cash,
            positions: self.positions.clone(),
            reservations: self.reservations.values().cloned().collect(),
            applied_fills: self.applied_fills.iter().cloned().collect(),
            realized_pnl: self.realized_pnl,
            total_fees: self.total_fees,
            next_reservation_id: self.next_reservation_id,
        }
    }

    /// Total cash, frozen included.
    pub fn cash(&self) -> f64 {
        self.cash
    }

    /// Cash held by outstanding buy reservations.
    ///
    /// Summed from the reservations themselves so that it returns to exactly
    /// zero once every hold is released.
    pub fn frozen_cash(&self) -> f64 {
        self.reservations.values().map(|r| r.frozen_cash).sum()
    }

    /// Cash free for new orders.
    pub fn available_cash(&self) -> f64 {
        self.cash - self.frozen_cash()
    }

    pub fn fee_rate(&self) -> f64 {
        self.fee_rate
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Held quantity in `symbol` (zero when flat).
    pub fn quantity(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).map(|p| p.quantity).unwrap_or(0.0)
    }

    pub fn positions(&self) -> &BTreeMap<String, Position> {
        &self.positions
    }

    pub fn reservation(&self, id: ReservationId) -> Option<&Reservation> {
        self.reservations.get(&id)
    }

    /// Whether `fill_id` has already been settled.
    pub fn has_applied(&self, fill_id: &FillId) -> bool {
        self.applied_fills.contains(fill_id)
    }

    pub fn open_reservations(&self) -> usize {
        self.reservations.len()
    }

    pub fn realized_trades(&self) -> &[RealizedTrade] {
        &self.realized
    }

    pub fn realized_pnl(&self) -> f64 {
        self.realized_pnl
    }

    pub fn total_fees(&self) -> f64 {
        self.total_fees
    }

    /// Cash plus positions marked at `mark(symbol)`; unmarked positions at cost.
    pub fn equity(&self, mark: impl Fn(&str) -> Option<f64>) -> f64 {
        let position_value: f64 = self
            .positions
            .iter()
            .map(|(symbol, pos)| pos.market_value(mark(symbol).unwrap_or(pos.avg_cost)))
            .sum();
        self.cash + position_value
    }
}
