//! # ledger: Position / Portfolio Ledger
//!
//! Authoritative in-memory record of open positions, realized and unrealized
//! P&L, peak equity and drawdown for the current trading day.
//!
//! The ledger is owned by the control loop task and is only mutated there.
//! Everyone else gets [`PortfolioState`] copies from [`Ledger::snapshot`].
//!
//! ## Fill idempotency
//! Each fill is identified by `(idempotency key, broker fill id)`. Replaying a
//! fill that was already applied returns [`FillOutcome::Duplicate`] and
//! changes nothing.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

use crate::error::ReconciliationError;
use crate::models::{
    ClosedPosition, Direction, ExitPlan, Fill, IdempotencyKey, Order, OrderIntent, PortfolioState,
    Position, PositionKey, StrategyId, StrategyStats, Tick,
};

// ─── Order binding ────────────────────────────────────────────────────────────

/// What the ledger needs to know about an order to validate its fills.
#[derive(Debug, Clone)]
struct OrderBinding {
    position: PositionKey,
    side:     Direction,
    quantity: u64,
    filled:   u64,
    intent:   OrderIntent,
    plan:     Option<ExitPlan>,
    /// The day's trade count already includes this order's trade.
    counted:  bool,
}

// ─── Outcome ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    Applied(FillReport),
    /// The fill key was seen before; nothing changed.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FillReport {
    /// Position after the fill; `None` when the fill flattened it.
    pub position: Option<Position>,
    /// Archive row when the fill closed a position.
    pub closed:   Option<ClosedPosition>,
    /// P&L realized by this fill.
    pub realized: f64,
    /// Total quantity now filled on the order.
    pub order_filled: u64,
}

// ─── Ledger ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Ledger {
    capital:        f64,
    positions:      BTreeMap<PositionKey, Position>,
    /// Largest absolute size each open position reached.
    peak_sizes:     HashMap<PositionKey, u64>,
    bindings:       HashMap<IdempotencyKey, OrderBinding>,
    applied_fills:  HashSet<(IdempotencyKey, String)>,
    closed:         Vec<ClosedPosition>,
    stats:          BTreeMap<StrategyId, StrategyStats>,
    realized_today: f64,
    peak_equity:    f64,
    trades_today:   u32,
    trading_day:    NaiveDate,
}

impl Ledger {
    pub fn new(capital: f64, trading_day: NaiveDate) -> Self {
        Self {
            capital,
            positions:      BTreeMap::new(),
            peak_sizes:     HashMap::new(),
            bindings:       HashMap::new(),
            applied_fills:  HashSet::new(),
            closed:         Vec::new(),
            stats:          BTreeMap::new(),
            realized_today: 0.0,
            peak_equity:    capital,
            trades_today:   0,
            trading_day,
        }
    }

    // ─── Orders ───────────────────────────────────────────────────────────────

    /// Binds an order's key to its (instrument, strategy, side, quantity).
    ///
    /// Must be called when the order is created, before any fill can arrive.
    /// A replacement inherits the trade count of the order it replaces once
    /// that order has filled at all.
    pub fn register_order(&mut self, order: &Order) {
        let counted = order
            .replaces
            .and_then(|prev| self.bindings.get(&prev))
            .is_some_and(|prev| prev.filled > 0 || prev.counted);
        self.bindings.entry(order.key).or_insert_with(|| OrderBinding {
            position: PositionKey::new(order.symbol.clone(), order.strategy_id.clone()),
            side:     order.side,
            quantity: order.quantity,
            filled:   0,
            intent:   order.intent,
            plan:     order.plan,
            counted,
        });
    }

    /// Drops the bindings and fill ids of orders the order book forgot.
    /// A later fill for one of them reconciles as an unknown order.
    pub fn release_orders(&mut self, keys: &[IdempotencyKey]) {
        if keys.is_empty() {
            return;
        }
        let released: HashSet<&IdempotencyKey> = keys.iter().collect();
        self.bindings.retain(|k, _| !released.contains(k));
        self.applied_fills.retain(|(k, _)| !released.contains(k));
    }

    // ─── Fills ────────────────────────────────────────────────────────────────

    /// Applies one broker fill to the position owned by the order's strategy.
    pub fn apply_fill(
        &mut self,
        key: IdempotencyKey,
        fill: &Fill,
    ) -> Result<FillOutcome, ReconciliationError> {
        if fill.quantity == 0 || !fill.price.is_finite() || fill.price <= 0.0 {
            return Err(ReconciliationError::InvalidFill {
                key,
                reason: format!("quantity {} at price {}", fill.quantity, fill.price),
            });
        }

        let binding = self
            .bindings
            .get(&key)
            .cloned()
            .ok_or(ReconciliationError::UnknownOrder { key })?;

        if self.applied_fills.contains(&(key, fill.fill_id.clone())) {
            debug!(%key, fill_id = %fill.fill_id, "Duplicate fill ignored");
            return Ok(FillOutcome::Duplicate);
        }

        if binding.filled + fill.quantity > binding.quantity {
            return Err(ReconciliationError::Overfill {
                key,
                ordered:  binding.quantity,
                filled:   binding.filled,
                incoming: fill.quantity,
            });
        }

        // First fill of an entry order counts as a trade for the day.
        if binding.filled == 0 && !binding.counted && binding.intent == OrderIntent::Entry {
            self.trades_today += 1;
            self.stats
                .entry(binding.position.strategy_id.clone())
                .or_default()
                .trades_today += 1;
        }

        let signed = binding.side.sign() * fill.quantity as i64;
        let (position, closed, realized) =
            self.net_into_position(&binding.position, signed, fill.price, binding.plan, fill.time);

        self.applied_fills.insert((key, fill.fill_id.clone()));
        let order_filled = {
            let b = self
                .bindings
                .get_mut(&key)
                .ok_or(ReconciliationError::UnknownOrder { key })?;
            b.filled += fill.quantity;
            b.counted = true;
            b.filled
        };

        self.realized_today += realized;
        self.refresh_peak();

        info!(
            %key,
            symbol   = %binding.position.symbol,
            strategy = %binding.position.strategy_id,
            side     = %binding.side,
            qty      = fill.quantity,
            price    = fill.price,
            realized,
            "📒 Fill applied"
        );

        Ok(FillOutcome::Applied(FillReport {
            position,
            closed,
            realized,
            order_filled,
        }))
    }

    /// Nets a signed quantity into the keyed position.
    fn net_into_position(
        &mut self,
        key: &PositionKey,
        signed: i64,
        price: f64,
        plan: Option<ExitPlan>,
        at: DateTime<Utc>,
    ) -> (Option<Position>, Option<ClosedPosition>, f64) {
        let Some(mut position) = self.positions.remove(key) else {
            let opened = Position::open(key, signed, price, plan, at);
            self.peak_sizes.insert(key.clone(), signed.unsigned_abs());
            self.positions.insert(key.clone(), opened.clone());
            return (Some(opened), None, 0.0);
        };

        // Same direction: average in.
        if position.quantity.signum() == signed.signum() {
            let held = position.quantity.unsigned_abs() as f64;
            let add = signed.unsigned_abs() as f64;
            position.avg_entry_price = (position.avg_entry_price * held + price * add) / (held + add);
            position.quantity += signed;
            if position.plan.is_none() {
                position.plan = plan;
            }
            position.refresh_levels();
            position.mark(price, at);
            let size = position.quantity.unsigned_abs();
            let peak = self.peak_sizes.entry(key.clone()).or_insert(size);
            *peak = (*peak).max(size);
            self.positions.insert(key.clone(), position.clone());
            return (Some(position), None, 0.0);
        }

        // Opposite direction: reduce, realize on the closed portion.
        let side = if position.quantity > 0 { Direction::Buy } else { Direction::Sell };
        let held = position.quantity.unsigned_abs();
        let closing = held.min(signed.unsigned_abs());
        let direction = position.quantity.signum() as f64;
        let realized = (price - position.avg_entry_price) * closing as f64 * direction;
        position.realized_pnl += realized;
        position.quantity += signed.signum() * closing as i64;
        let residual = signed + (-signed.signum()) * closing as i64;

        if position.quantity != 0 {
            position.mark(price, at);
            self.positions.insert(key.clone(), position.clone());
            return (Some(position), None, realized);
        }

        let closed = self.archive(position, side, price, at);

        // Crossing zero opens the remainder as a fresh position.
        if residual != 0 {
            let reopened = Position::open(key, residual, price, plan, at);
            self.peak_sizes.insert(key.clone(), residual.unsigned_abs());
            self.positions.insert(key.clone(), reopened.clone());
            return (Some(reopened), Some(closed), realized);
        }

        (None, Some(closed), realized)
    }

    fn archive(
        &mut self,
        position: Position,
        side: Direction,
        exit_price: f64,
        at: DateTime<Utc>,
    ) -> ClosedPosition {
        let max_quantity = self.peak_sizes.remove(&position.key()).unwrap_or_default();

        let closed = ClosedPosition {
            symbol: position.symbol.clone(),
            strategy_id: position.strategy_id.clone(),
            side,
            max_quantity,
            avg_entry_price: position.avg_entry_price,
            exit_price,
            realized_pnl: position.realized_pnl,
            opened_at: position.opened_at,
            closed_at: at,
        };

        let stats = self.stats.entry(position.strategy_id.clone()).or_default();
        stats.closed_positions += 1;
        stats.realized_pnl += position.realized_pnl;
        if position.realized_pnl > 0.0 {
            stats.winning_trades += 1;
        } else {
            stats.losing_trades += 1;
        }

        info!(
            symbol   = %closed.symbol,
            strategy = %closed.strategy_id,
            pnl      = closed.realized_pnl,
            "📕 Position closed"
        );

        self.closed.push(closed.clone());
        closed
    }

    // ─── Ticks ────────────────────────────────────────────────────────────────

    /// Re-marks every position in the tick's instrument. Returns the updated copies.
    pub fn mark_tick(&mut self, tick: &Tick) -> Vec<Position> {
        let updated: Vec<Position> = self
            .positions
            .values_mut()
            .filter(|p| p.symbol == tick.symbol)
            .map(|p| {
                p.mark(tick.ltp, tick.time);
                p.clone()
            })
            .collect();
        if !updated.is_empty() {
            self.refresh_peak();
        }
        updated
    }

    // ─── Equity ───────────────────────────────────────────────────────────────

    pub fn unrealized(&self) -> f64 {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }

    pub fn equity(&self) -> f64 {
        self.capital + self.realized_today + self.unrealized()
    }

    pub fn drawdown(&self) -> f64 {
        if self.peak_equity <= 0.0 {
            return 0.0;
        }
        ((self.peak_equity - self.equity()) / self.peak_equity).max(0.0)
    }

    fn refresh_peak(&mut self) {
        let equity = self.equity();
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
    }

    // ─── Day rollover ─────────────────────────────────────────────────────────

    /// Starts a new trading day. Returns `true` when the day actually changed.
    ///
    /// Realized P&L is folded into capital; peak equity restarts at the
    /// current equity. The closed-position archive only covers one day.
    pub fn roll_day(&mut self, day: NaiveDate) -> bool {
        if day <= self.trading_day {
            return false;
        }
        self.capital += self.realized_today;
        self.realized_today = 0.0;
        self.trades_today = 0;
        self.closed.clear();
        for stats in self.stats.values_mut() {
            stats.trades_today = 0;
        }
        self.peak_equity = self.equity();
        info!(from = %self.trading_day, to = %day, capital = self.capital, "📅 Ledger rolled to new trading day");
        self.trading_day = day;
        true
    }

    /// Restarts drawdown measurement from the current equity (operator reset).
    pub fn rebase_peak(&mut self) {
        self.peak_equity = self.equity();
    }

    // ─── Views ────────────────────────────────────────────────────────────────

    /// Consistent copy of the ledger.
    pub fn snapshot(&self, as_of: DateTime<Utc>) -> PortfolioState {
        let positions: Vec<Position> = self.positions.values().cloned().collect();
        let equity = self.equity();
        PortfolioState {
            capital:            self.capital,
            realized_pnl_today: self.realized_today,
            unrealized_pnl:     self.unrealized(),
            equity,
            peak_equity:        self.peak_equity,
            drawdown:           self.drawdown(),
            open_positions:     positions.len(),
            open_notional:      positions.iter().map(Position::notional).sum(),
            trades_today:       self.trades_today,
            positions,
            pending_entries:    Vec::new(),
            strategy_stats:     self.stats.clone(),
            halted:             false,
            as_of,
        }
    }

    pub fn position(&self, key: &PositionKey) -> Option<&Position> {
        self.positions.get(key)
    }

    pub fn closed_positions(&self) -> &[ClosedPosition] {
        &self.closed
    }

    pub fn trading_day(&self) -> NaiveDate {
        self.trading_day
    }
}
