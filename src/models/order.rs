//! # models::order
//!
//! [`Order`] and its lifecycle state machine, plus the broker-side [`Fill`].
//!
//! ```text
//! Created ─▶ Submitted ─┬─▶ Rejected
//!    │                  └─▶ Acknowledged ─▶ PartiallyFilled ─▶ Filled
//!    │                            │                │
//!    └──────────▶ Cancelled ◀─────┴────────────────┤
//!                                 Expired ◀────────┘
//! ```
//!
//! Orders are owned exclusively by the order manager. Everything else sees
//! clones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::signal::{Direction, ExitPlan, Signal, StrategyId};

// ─── Idempotency key ──────────────────────────────────────────────────────────

/// Locally generated key sent with every submission attempt of one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(pub Uuid);

impl IdempotencyKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for IdempotencyKey {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ─── Enums ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
}

/// Whether the order opens exposure or closes an existing position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderIntent {
    Entry,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Created,
    Submitted,
    Acknowledged,
    PartiallyFilled,
    Filled,
    Rejected,
    Cancelled,
    Expired,
}

impl OrderState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Rejected | OrderState::Cancelled | OrderState::Expired
        )
    }

    #[inline]
    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }

    /// Allowed edges of the lifecycle graph.
    ///
    /// A fill may overtake the broker's acknowledgment, so `Submitted` can
    /// move straight to a filled state.
    pub fn can_transition_to(self, next: OrderState) -> bool {
        use OrderState::*;
        matches!(
            (self, next),
            (Created, Submitted)
                | (Created, Cancelled)
                | (Submitted, Acknowledged)
                | (Submitted, Rejected)
                | (Submitted, PartiallyFilled)
                | (Submitted, Filled)
                | (Submitted, Cancelled)
                | (Acknowledged, PartiallyFilled)
                | (Acknowledged, Filled)
                | (Acknowledged, Cancelled)
                | (Acknowledged, Expired)
                | (PartiallyFilled, PartiallyFilled)
                | (PartiallyFilled, Filled)
                | (PartiallyFilled, Cancelled)
                | (PartiallyFilled, Expired)
        )
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Attempted move along an edge the lifecycle graph does not have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: OrderState,
    pub to:   OrderState,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal order transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

// ─── Fill ─────────────────────────────────────────────────────────────────────

/// One execution reported by the broker against an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// Broker's fill sequence id, unique within one order.
    pub fill_id:  String,
    pub quantity: u64,
    pub price:    f64,
    pub time:     DateTime<Utc>,
}

// ─── Status events ────────────────────────────────────────────────────────────

/// Order-status event keyed by idempotency key.
///
/// Produced by submission workers and by the broker's status stream
/// (paper broker or `POST /api/broker/events`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderEvent {
    Acknowledged {
        key:             IdempotencyKey,
        broker_order_id: String,
        #[serde(default)]
        attempts:        u32,
    },
    /// Broker refused the order outright.
    Rejected { key: IdempotencyKey, reason: String },
    /// Transport retries exhausted without a broker answer.
    SubmissionFailed {
        key:      IdempotencyKey,
        attempts: u32,
        error:    String,
    },
    Fill { key: IdempotencyKey, fill: Fill },
    Cancelled { key: IdempotencyKey },
    CancelFailed { key: IdempotencyKey, error: String },
    /// Broker-side expiry (e.g. day order at session end).
    Expired { key: IdempotencyKey },
}

impl OrderEvent {
    pub fn key(&self) -> IdempotencyKey {
        match self {
            OrderEvent::Acknowledged { key, .. }
            | OrderEvent::Rejected { key, .. }
            | OrderEvent::SubmissionFailed { key, .. }
            | OrderEvent::Fill { key, .. }
            | OrderEvent::Cancelled { key }
            | OrderEvent::CancelFailed { key, .. }
            | OrderEvent::Expired { key } => *key,
        }
    }
}

// ─── Order ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub key:             IdempotencyKey,
    pub signal_id:       Uuid,
    pub strategy_id:     StrategyId,
    pub symbol:          String,
    pub side:            Direction,
    pub quantity:        u64,
    pub order_type:      OrderType,
    /// Signal reference price; also the limit price for `Limit` orders.
    pub price:           f64,
    pub intent:          OrderIntent,
    /// Exit plan carried over to the position on fill (entries only).
    pub plan:            Option<ExitPlan>,
    pub state:           OrderState,
    pub filled_quantity: u64,
    pub avg_fill_price:  f64,
    /// Submission attempts made with this key.
    pub attempts:        u32,
    pub broker_order_id: Option<String>,
    /// Key of the expired order this one replaces.
    pub replaces:        Option<IdempotencyKey>,
    pub created_at:          DateTime<Utc>,
    pub submitted_at:        Option<DateTime<Utc>>,
    pub acknowledged_at:     Option<DateTime<Utc>>,
    pub last_fill_at:        Option<DateTime<Utc>>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub updated_at:          DateTime<Utc>,
    pub error:               Option<String>,
}

impl Order {
    /// Builds a `Created` market order for an approved signal.
    pub fn from_signal(signal: &Signal, quantity: u64, at: DateTime<Utc>) -> Self {
        Self {
            key:             IdempotencyKey::generate(),
            signal_id:       signal.signal_id,
            strategy_id:     signal.strategy_id.clone(),
            symbol:          signal.symbol.clone(),
            side:            signal.direction,
            quantity,
            order_type:      OrderType::Market,
            price:           signal.reference_price,
            intent:          if signal.is_exit() { OrderIntent::Exit } else { OrderIntent::Entry },
            plan:            signal.plan(),
            state:           OrderState::Created,
            filled_quantity: 0,
            avg_fill_price:  0.0,
            attempts:        0,
            broker_order_id: None,
            replaces:        None,
            created_at:          at,
            submitted_at:        None,
            acknowledged_at:     None,
            last_fill_at:        None,
            cancel_requested_at: None,
            updated_at:          at,
            error:               None,
        }
    }

    #[inline]
    pub fn remaining(&self) -> u64 {
        self.quantity.saturating_sub(self.filled_quantity)
    }

    /// Notional of the unfilled remainder at the order price.
    #[inline]
    pub fn remaining_notional(&self) -> f64 {
        self.remaining() as f64 * self.price
    }

    #[inline]
    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    /// Moves along one edge of the lifecycle graph.
    pub fn transition(&mut self, next: OrderState, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition { from: self.state, to: next });
        }
        self.state = next;
        self.updated_at = at;
        match next {
            OrderState::Submitted => self.submitted_at = Some(at),
            OrderState::Acknowledged => self.acknowledged_at = Some(at),
            _ => {}
        }
        Ok(())
    }

    /// Accumulates a fill into filled quantity and average fill price.
    ///
    /// Does not touch `state`; callers decide the transition, since late
    /// fills on terminal orders are recorded without reopening them.
    pub fn record_fill(&mut self, fill: &Fill) {
        let prev_qty = self.filled_quantity as f64;
        let new_qty = prev_qty + fill.quantity as f64;
        if new_qty > 0.0 {
            self.avg_fill_price = (self.avg_fill_price * prev_qty + fill.price * fill.quantity as f64) / new_qty;
        }
        self.filled_quantity += fill.quantity;
        self.last_fill_at = Some(fill.time);
        self.updated_at = fill.time;
    }
}

// ─── Summary ──────────────────────────────────────────────────────────────────

/// Counts by lifecycle bucket, as reported on the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub total:     usize,
    pub open:      usize,
    pub filled:    usize,
    pub cancelled: usize,
    pub rejected:  usize,
    pub expired:   usize,
}

impl OrderSummary {
    pub fn tally<'a>(orders: impl IntoIterator<Item = &'a Order>) -> Self {
        let mut summary = Self::default();
        for order in orders {
            summary.total += 1;
            match order.state {
                OrderState::Filled => summary.filled += 1,
                OrderState::Cancelled => summary.cancelled += 1,
                OrderState::Rejected => summary.rejected += 1,
                OrderState::Expired => summary.expired += 1,
                _ => summary.open += 1,
            }
        }
        summary
    }
}
