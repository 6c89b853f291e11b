//! # models::position
//!
//! Structs for **live positions**, archived closed positions and the
//! aggregate [`PortfolioState`] snapshot.
//!
//! ## Why separate from Order?
//! `Order`          = what we asked the broker to do (owned by the order manager)
//! `Position`       = what actually executed, netted per (instrument, strategy)
//! `ClosedPosition` = archive row written once quantity returns to zero

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::signal::{Direction, ExitPlan, StrategyId};

// ─── PositionKey ──────────────────────────────────────────────────────────────

/// At most one Position may be open per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PositionKey {
    pub symbol: String,
    pub strategy_id: StrategyId,
}

impl PositionKey {
    pub fn new(symbol: impl Into<String>, strategy_id: StrategyId) -> Self {
        Self {
            symbol: symbol.into(),
            strategy_id,
        }
    }
}

// ─── Position ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub strategy_id: StrategyId,
    /// Positive = long, negative = short.
    pub quantity: i64,
    pub avg_entry_price: f64,
    /// Last price seen for the instrument (fill or tick).
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    /// P&L already realized by partial closes while the position stayed open.
    pub realized_pnl: f64,
    pub stop_loss: Option<f64>,
    pub target: Option<f64>,
    /// Exit plan of the entry order, reapplied whenever the average moves.
    pub plan: Option<ExitPlan>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn open(
        key: &PositionKey,
        quantity: i64,
        price: f64,
        plan: Option<ExitPlan>,
        at: DateTime<Utc>,
    ) -> Self {
        let mut position = Self {
            symbol: key.symbol.clone(),
            strategy_id: key.strategy_id.clone(),
            quantity,
            avg_entry_price: price,
            mark_price: price,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            stop_loss: None,
            target: None,
            plan,
            opened_at: at,
            updated_at: at,
        };
        position.refresh_levels();
        position
    }

    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.symbol.clone(), self.strategy_id.clone())
    }

    pub fn side(&self) -> Option<Direction> {
        Direction::of_quantity(self.quantity)
    }

    #[inline]
    pub fn is_flat(&self) -> bool {
        self.quantity == 0
    }

    /// Notional at the latest mark.
    #[inline]
    pub fn notional(&self) -> f64 {
        self.quantity.unsigned_abs() as f64 * self.mark_price
    }

    /// Cost basis at the average entry price.
    #[inline]
    pub fn entry_notional(&self) -> f64 {
        self.quantity.unsigned_abs() as f64 * self.avg_entry_price
    }

    /// Re-marks the position and recomputes unrealized P&L.
    pub fn mark(&mut self, price: f64, at: DateTime<Utc>) {
        self.mark_price = price;
        self.unrealized_pnl = (price - self.avg_entry_price) * self.quantity as f64;
        self.updated_at = at;
    }

    /// Recomputes stop-loss / target levels from the current average entry.
    pub fn refresh_levels(&mut self) {
        match (self.plan, self.side()) {
            (Some(plan), Some(side)) => {
                self.stop_loss = Some(plan.stop_loss.stop_level(self.avg_entry_price, side));
                self.target = Some(plan.target.target_level(self.avg_entry_price, side));
            }
            _ => {
                self.stop_loss = None;
                self.target = None;
            }
        }
    }

    /// `true` once the mark price has breached the stop-loss level.
    pub fn stop_breached(&self, price: f64) -> bool {
        match (self.stop_loss, self.side()) {
            (Some(stop), Some(Direction::Buy)) => price <= stop,
            (Some(stop), Some(Direction::Sell)) => price >= stop,
            _ => false,
        }
    }

    /// `true` once the mark price has reached the target level.
    pub fn target_reached(&self, price: f64) -> bool {
        match (self.target, self.side()) {
            (Some(target), Some(Direction::Buy)) => price >= target,
            (Some(target), Some(Direction::Sell)) => price <= target,
            _ => false,
        }
    }
}

// ─── ClosedPosition ───────────────────────────────────────────────────────────

/// Archive entry for a position whose quantity returned to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub symbol: String,
    pub strategy_id: StrategyId,
    pub side: Direction,
    /// Largest absolute quantity held over the position's life.
    pub max_quantity: u64,
    pub avg_entry_price: f64,
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

// ─── Strategy performance ─────────────────────────────────────────────────────

/// Per-strategy scorecard, updated whenever one of its positions closes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub trades_today: u32,
    pub closed_positions: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub realized_pnl: f64,
}

impl StrategyStats {
    pub fn win_rate_pct(&self) -> f64 {
        let total = self.winning_trades + self.losing_trades;
        if total == 0 {
            0.0
        } else {
            self.winning_trades as f64 / total as f64 * 100.0
        }
    }
}

// ─── PendingEntry ─────────────────────────────────────────────────────────────

/// Exposure reserved by a live entry order that has not fully filled yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub symbol: String,
    pub strategy_id: StrategyId,
    /// Unfilled remainder at the order price.
    pub notional: f64,
    /// Already counted in `trades_today` by an earlier partial fill.
    pub partially_filled: bool,
}

// ─── PortfolioState ───────────────────────────────────────────────────────────

/// Consistent point-in-time view of the ledger. Always an owned copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub capital: f64,
    pub realized_pnl_today: f64,
    pub unrealized_pnl: f64,
    pub equity: f64,
    pub peak_equity: f64,
    /// `(peak − equity) / peak`, 0 when at the peak.
    pub drawdown: f64,
    pub open_positions: usize,
    pub open_notional: f64,
    pub trades_today: u32,
    pub positions: Vec<Position>,
    /// Filled in by the control loop from the order manager.
    pub pending_entries: Vec<PendingEntry>,
    pub strategy_stats: BTreeMap<StrategyId, StrategyStats>,
    /// Set by the control loop while the circuit breaker is tripped.
    pub halted: bool,
    pub as_of: DateTime<Utc>,
}

impl PortfolioState {
    /// Loss today as a positive number (0 when in profit).
    pub fn loss_today(&self) -> f64 {
        (-(self.realized_pnl_today + self.unrealized_pnl)).max(0.0)
    }

    pub fn position(&self, symbol: &str, strategy_id: &StrategyId) -> Option<&Position> {
        self.positions
            .iter()
            .find(|p| p.symbol == symbol && &p.strategy_id == strategy_id)
    }

    pub fn positions_for<'a>(
        &'a self,
        strategy_id: &'a StrategyId,
    ) -> impl Iterator<Item = &'a Position> + 'a {
        self.positions
            .iter()
            .filter(move |p| &p.strategy_id == strategy_id)
    }

    pub fn pending_notional(&self) -> f64 {
        self.pending_entries.iter().map(|p| p.notional).sum()
    }

    /// Open positions plus pending entries that would open a new key.
    pub fn committed_positions(&self) -> usize {
        let new_keys = self
            .pending_entries
            .iter()
            .filter(|p| self.position(&p.symbol, &p.strategy_id).is_none())
            .count();
        self.open_positions + new_keys
    }

    /// Trades today plus live entries that have not filled at all yet.
    pub fn committed_trades(&self) -> u32 {
        let unfilled = self.pending_entries.iter().filter(|p| !p.partially_filled).count();
        self.trades_today + unfilled as u32
    }

    pub fn has_pending_entry(&self, symbol: &str, strategy_id: &StrategyId) -> bool {
        self.pending_entries
            .iter()
            .any(|p| p.symbol == symbol && &p.strategy_id == strategy_id)
    }
}
