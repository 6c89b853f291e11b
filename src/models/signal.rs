//! # models::signal
//!
//! Defines [`Signal`], a strategy's proposed action before any risk check.
//!
//! A Signal is created by exactly one strategy, consumed by the gatekeeper and
//! (if approved) turned into exactly one order. It is never mutated after
//! creation; replacement orders after an expiry still point back at the same
//! Signal id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ─── Direction ────────────────────────────────────────────────────────────────

/// Trade side proposed by a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// `+1` for buys, `-1` for sells.
    #[inline]
    pub fn sign(self) -> i64 {
        match self {
            Direction::Buy => 1,
            Direction::Sell => -1,
        }
    }

    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }

    /// Direction that opens a position of the given signed quantity.
    pub fn of_quantity(quantity: i64) -> Option<Self> {
        match quantity.signum() {
            1 => Some(Direction::Buy),
            -1 => Some(Direction::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Buy => write!(f, "BUY"),
            Direction::Sell => write!(f, "SELL"),
        }
    }
}

// ─── StrategyId ───────────────────────────────────────────────────────────────

/// Identifier of the strategy instance that owns a signal, order or position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyId(pub String);

impl StrategyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Exit rules ───────────────────────────────────────────────────────────────

/// Distance of a stop-loss or target from the entry price.
///
/// Units are chosen per strategy: scalping uses a percent stop with a point
/// target, momentum uses percent for both.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "unit", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitRule {
    /// Fraction of the entry price, e.g. `0.15` = 15%.
    Percent(f64),
    /// Absolute price points.
    Points(f64),
}

impl ExitRule {
    fn distance(self, entry: f64) -> f64 {
        match self {
            ExitRule::Percent(pct) => entry * pct,
            ExitRule::Points(points) => points,
        }
    }

    /// Price at which a position opened in `side` is stopped out.
    pub fn stop_level(self, entry: f64, side: Direction) -> f64 {
        match side {
            Direction::Buy => entry - self.distance(entry),
            Direction::Sell => entry + self.distance(entry),
        }
    }

    /// Price at which a position opened in `side` takes profit.
    pub fn target_level(self, entry: f64, side: Direction) -> f64 {
        match side {
            Direction::Buy => entry + self.distance(entry),
            Direction::Sell => entry - self.distance(entry),
        }
    }

    /// The rule expressed as a fraction of `entry`, used for risk sizing.
    pub fn as_fraction(self, entry: f64) -> f64 {
        match self {
            ExitRule::Percent(pct) => pct,
            ExitRule::Points(points) if entry > 0.0 => points / entry,
            ExitRule::Points(_) => f64::INFINITY,
        }
    }
}

/// Stop-loss and target attached to an entry signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitPlan {
    pub stop_loss: ExitRule,
    pub target: ExitRule,
}

// ─── Signal kind ──────────────────────────────────────────────────────────────

/// Why a strategy wants out of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TargetHit,
    TimeExit,
    MomentumReversal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    /// Opens new exposure; subject to every gatekeeper check.
    Entry { plan: ExitPlan },
    /// Closes an existing position; bypasses entry sizing.
    Exit { reason: ExitReason },
}

// ─── Signal ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: Uuid,
    pub strategy_id: StrategyId,
    pub symbol: String,
    pub direction: Direction,
    /// Proposed quantity in contracts (lot size already applied).
    pub quantity: u64,
    /// Price the strategy observed when it decided; basis for notional.
    pub reference_price: f64,
    pub kind: SignalKind,
    /// Human-readable reasoning for logs and the dashboard.
    pub rationale: String,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    #[allow(clippy::too_many_arguments)]
    pub fn entry(
        strategy_id: StrategyId,
        symbol: impl Into<String>,
        direction: Direction,
        quantity: u64,
        reference_price: f64,
        plan: ExitPlan,
        rationale: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            signal_id: Uuid::new_v4(),
            strategy_id,
            symbol: symbol.into(),
            direction,
            quantity,
            reference_price,
            kind: SignalKind::Entry { plan },
            rationale: rationale.into(),
            created_at,
        }
    }

    pub fn exit(
        strategy_id: StrategyId,
        symbol: impl Into<String>,
        direction: Direction,
        quantity: u64,
        reference_price: f64,
        reason: ExitReason,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            signal_id: Uuid::new_v4(),
            strategy_id,
            symbol: symbol.into(),
            direction,
            quantity,
            reference_price,
            kind: SignalKind::Exit { reason },
            rationale: format!("{reason:?}"),
            created_at,
        }
    }

    #[inline]
    pub fn is_exit(&self) -> bool {
        matches!(self.kind, SignalKind::Exit { .. })
    }

    /// Exit plan for entries, `None` for exits.
    pub fn plan(&self) -> Option<ExitPlan> {
        match self.kind {
            SignalKind::Entry { plan } => Some(plan),
            SignalKind::Exit { .. } => None,
        }
    }

    /// Proposed notional exposure: quantity × reference price.
    #[inline]
    pub fn notional(&self) -> f64 {
        self.quantity as f64 * self.reference_price
    }
}
