//! # engine::orders: Order Lifecycle Manager
//!
//! Owns every [`Order`] of the session. Turns approved signals into orders,
//! walks them through the lifecycle graph on broker events, reconciles fills
//! into the [`Ledger`], expires stale orders and decides on replacements.
//!
//! The manager is synchronous and never touches the network. Broker work is
//! queued as [`OrderCommand`]s and state changes as [`OrderUpdate`]s; the
//! control loop drains both after each event.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{env_pct, env_u32, env_u64};
use crate::error::{ConfigError, ReconciliationError};
use crate::ledger::{FillOutcome, FillReport, Ledger};
use crate::models::{
    Fill, IdempotencyKey, Order, OrderEvent, OrderIntent, OrderState, OrderSummary, PendingEntry,
    PortfolioState, PositionKey, Signal, StrategyId,
};
use crate::retry::RetryPolicy;
use crate::risk::{adverse_move, Gatekeeper, RejectReason, RiskDecision, RiskLimits};

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrderConfig {
    /// Acknowledged orders without a fill for this long expire.
    pub timeout:          Duration,
    pub retry:            RetryPolicy,
    /// Replacement orders allowed per signal.
    pub max_replacements: u32,
    /// Largest adverse move from the signal price a replacement tolerates.
    pub max_drift_pct:    f64,
    /// Wait for a broker cancel confirmation before forcing `Cancelled`.
    pub cancel_grace:     Duration,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            timeout:          Duration::seconds(30),
            retry:            RetryPolicy::default(),
            max_replacements: 1,
            max_drift_pct:    0.02,
            cancel_grace:     Duration::seconds(10),
        }
    }
}

impl OrderConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            timeout:          Duration::seconds(env_u64("ORDER_TIMEOUT_SECS", d.timeout.num_seconds() as u64)? as i64),
            retry:            RetryPolicy::orders_from_env()?,
            max_replacements: env_u32("ORDER_MAX_REPLACEMENTS", d.max_replacements)?,
            max_drift_pct:    env_pct("ORDER_MAX_DRIFT_PCT", d.max_drift_pct)?,
            cancel_grace:     Duration::seconds(
                env_u64("ORDER_CANCEL_GRACE_SECS", d.cancel_grace.num_seconds() as u64)? as i64,
            ),
        })
    }
}

// ─── Outbox types ─────────────────────────────────────────────────────────────

/// Broker work for the executor.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderCommand {
    Submit(Order),
    Cancel(IdempotencyKey),
}

/// Something the rest of the session should hear about.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderUpdate {
    State { order: Order, from: OrderState },
    Fill { order: Order, fill: Fill, report: FillReport },
    Reconciliation(ReconciliationError),
    Alert { key: Option<IdempotencyKey>, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Never dispatched; cancelled without asking the broker.
    CancelledLocally,
    /// Cancel sent to the broker; confirmation pending.
    Requested,
    AlreadyRequested,
    AlreadyTerminal(OrderState),
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplaceOutcome {
    Replaced(IdempotencyKey),
    Dropped(RejectReason),
    Exhausted,
    /// Nothing left to replace.
    Nothing,
}

#[derive(Debug, Clone)]
struct SignalRecord {
    signal:       Signal,
    replacements: u32,
}

// ─── Manager ──────────────────────────────────────────────────────────────────

pub struct OrderManager {
    config:   OrderConfig,
    orders:   HashMap<IdempotencyKey, Order>,
    /// Creation order, for stable listings.
    sequence: Vec<IdempotencyKey>,
    signals:  HashMap<Uuid, SignalRecord>,
    commands: Vec<OrderCommand>,
    updates:  Vec<OrderUpdate>,
    /// Orders the broker reported expired, awaiting a replacement decision.
    expired:  Vec<Order>,
}

impl OrderManager {
    pub fn new(config: OrderConfig) -> Self {
        Self {
            config,
            orders:   HashMap::new(),
            sequence: Vec::new(),
            signals:  HashMap::new(),
            commands: Vec::new(),
            updates:  Vec::new(),
            expired:  Vec::new(),
        }
    }

    pub fn config(&self) -> &OrderConfig {
        &self.config
    }

    // ─── Creation ─────────────────────────────────────────────────────────────

    /// Creates a `Created` order for an approved signal and binds it in the ledger.
    pub fn create(&mut self, signal: &Signal, ledger: &mut Ledger, now: DateTime<Utc>) -> IdempotencyKey {
        self.signals.entry(signal.signal_id).or_insert_with(|| SignalRecord {
            signal:       signal.clone(),
            replacements: 0,
        });
        let order = Order::from_signal(signal, signal.quantity, now);
        self.insert(order, ledger)
    }

    fn insert(&mut self, order: Order, ledger: &mut Ledger) -> IdempotencyKey {
        let key = order.key;
        ledger.register_order(&order);
        info!(
            %key,
            symbol   = %order.symbol,
            strategy = %order.strategy_id,
            side     = %order.side,
            qty      = order.quantity,
            price    = order.price,
            intent   = ?order.intent,
            "🆕 Order created"
        );
        self.updates.push(OrderUpdate::State { order: order.clone(), from: OrderState::Created });
        self.orders.insert(key, order);
        self.sequence.push(key);
        key
    }

    /// Moves every `Created` order to `Submitted` and queues its submission.
    ///
    /// Does nothing while `halted`: no order reaches the broker during a halt.
    pub fn dispatch_created(&mut self, now: DateTime<Utc>, halted: bool) -> usize {
        if halted {
            return 0;
        }
        let created: Vec<IdempotencyKey> = self
            .sequence
            .iter()
            .filter(|k| self.orders.get(*k).is_some_and(|o| o.state == OrderState::Created))
            .copied()
            .collect();
        for key in &created {
            if self.move_to(*key, OrderState::Submitted, now) {
                if let Some(order) = self.orders.get(key) {
                    self.commands.push(OrderCommand::Submit(order.clone()));
                }
            }
        }
        created.len()
    }

    // ─── Broker events ────────────────────────────────────────────────────────

    pub fn apply(&mut self, event: OrderEvent, ledger: &mut Ledger, now: DateTime<Utc>) {
        match event {
            OrderEvent::Acknowledged { key, broker_order_id, attempts } => {
                let Some(order) = self.orders.get_mut(&key) else {
                    warn!(%key, "Acknowledgment for unknown order ignored");
                    return;
                };
                order.broker_order_id = Some(broker_order_id);
                order.attempts = order.attempts.max(attempts);
                let resend_cancel = order.cancel_requested_at.is_some() && order.is_live();
                if order.state == OrderState::Submitted {
                    self.move_to(key, OrderState::Acknowledged, now);
                } else {
                    debug!(%key, state = %order.state, "Late acknowledgment recorded");
                }
                if resend_cancel {
                    self.commands.push(OrderCommand::Cancel(key));
                }
            }

            OrderEvent::Rejected { key, reason } => {
                self.fail(key, reason, now, false);
            }

            OrderEvent::SubmissionFailed { key, attempts, error } => {
                if let Some(order) = self.orders.get_mut(&key) {
                    order.attempts = order.attempts.max(attempts);
                }
                self.fail(key, format!("submission failed after {attempts} attempts: {error}"), now, true);
            }

            OrderEvent::Fill { key, fill } => self.apply_fill(key, fill, ledger, now),

            OrderEvent::Cancelled { key } => {
                match self.orders.get(&key).map(|o| o.state) {
                    Some(state) if state.is_live() => {
                        self.move_to(key, OrderState::Cancelled, now);
                    }
                    Some(_) => debug!(%key, "Cancel confirmation for terminal order"),
                    None => warn!(%key, "Cancel confirmation for unknown order ignored"),
                }
            }

            OrderEvent::CancelFailed { key, error } => {
                warn!(%key, %error, "⚠️ Broker did not confirm cancel");
            }

            OrderEvent::Expired { key } => {
                let expirable = self
                    .orders
                    .get(&key)
                    .is_some_and(|o| o.state.can_transition_to(OrderState::Expired));
                if expirable && self.move_to(key, OrderState::Expired, now) {
                    info!(%key, "⌛ Broker expired order");
                    if let Some(order) = self.orders.get(&key) {
                        self.expired.push(order.clone());
                    }
                }
            }
        }
    }

    fn fail(&mut self, key: IdempotencyKey, reason: String, now: DateTime<Utc>, alert: bool) {
        let Some(order) = self.orders.get_mut(&key) else {
            warn!(%key, %reason, "Failure for unknown order ignored");
            return;
        };
        if order.state != OrderState::Submitted {
            warn!(%key, state = %order.state, %reason, "Failure for order not awaiting the broker ignored");
            return;
        }
        order.error = Some(reason.clone());
        self.move_to(key, OrderState::Rejected, now);
        if alert {
            error!(%key, %reason, "🚨 Order rejected after retries");
            self.updates.push(OrderUpdate::Alert { key: Some(key), message: reason });
        }
    }

    fn apply_fill(&mut self, key: IdempotencyKey, fill: Fill, ledger: &mut Ledger, now: DateTime<Utc>) {
        let report = match ledger.apply_fill(key, &fill) {
            Ok(FillOutcome::Applied(report)) => report,
            Ok(FillOutcome::Duplicate) => return,
            Err(err) => {
                error!(%key, error = %err, "⚠️ Reconciliation error");
                self.updates.push(OrderUpdate::Alert { key: Some(key), message: err.to_string() });
                self.updates.push(OrderUpdate::Reconciliation(err));
                return;
            }
        };

        let Some(order) = self.orders.get_mut(&key) else {
            return;
        };
        order.record_fill(&fill);
        let next = if order.filled_quantity >= order.quantity {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        let state = order.state;
        let snapshot = order.clone();
        self.updates.push(OrderUpdate::Fill { order: snapshot, fill, report });

        if state.is_terminal() {
            warn!(%key, %state, "📥 Late fill applied to terminal order");
        } else if !self.move_to(key, next, now) {
            warn!(%key, %state, "Fill arrived before dispatch");
        }
    }

    /// Applies one lifecycle edge; logs and refuses edges the graph lacks.
    fn move_to(&mut self, key: IdempotencyKey, next: OrderState, now: DateTime<Utc>) -> bool {
        let Some(order) = self.orders.get_mut(&key) else {
            return false;
        };
        let from = order.state;
        if let Err(e) = order.transition(next, now) {
            warn!(%key, error = %e, "Invalid order transition ignored");
            return false;
        }
        info!(%key, symbol = %order.symbol, %from, to = %next, "🔄 Order state");
        self.updates.push(OrderUpdate::State { order: order.clone(), from });
        true
    }

    // ─── Timers ───────────────────────────────────────────────────────────────

    /// Expires working orders with no fill inside the timeout and forces
    /// overdue cancels. Returns the orders that just expired.
    pub fn on_timer(&mut self, now: DateTime<Utc>) -> Vec<Order> {
        self.force_overdue_cancels(now);

        let timeout = self.config.timeout;
        let stale: Vec<IdempotencyKey> = self
            .sequence
            .iter()
            .filter_map(|k| self.orders.get(k))
            .filter(|o| {
                matches!(o.state, OrderState::Acknowledged | OrderState::PartiallyFilled)
                    && o.cancel_requested_at.is_none()
            })
            .filter(|o| {
                let since = o.last_fill_at.or(o.acknowledged_at).unwrap_or(o.created_at);
                now - since >= timeout
            })
            .map(|o| o.key)
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for key in stale {
            if self.move_to(key, OrderState::Expired, now) {
                info!(%key, "⌛ Order expired without fill");
                // Pull the remainder off the broker's book.
                self.commands.push(OrderCommand::Cancel(key));
                if let Some(order) = self.orders.get(&key) {
                    expired.push(order.clone());
                }
            }
        }
        expired
    }

    fn force_overdue_cancels(&mut self, now: DateTime<Utc>) {
        let grace = self.config.cancel_grace;
        let overdue: Vec<IdempotencyKey> = self
            .orders
            .values()
            .filter(|o| o.is_live())
            .filter(|o| o.cancel_requested_at.is_some_and(|at| now - at >= grace))
            .map(|o| o.key)
            .collect();
        self.force_cancel(overdue, now);
    }

    /// Shutdown gave up waiting: every live order becomes `Cancelled` with
    /// a `ForcedCancelTimeout` error. Returns how many were forced.
    pub fn force_cancel_live(&mut self, now: DateTime<Utc>) -> usize {
        let live: Vec<IdempotencyKey> = self.live_orders().map(|o| o.key).collect();
        self.force_cancel(live, now)
    }

    fn force_cancel(&mut self, keys: Vec<IdempotencyKey>, now: DateTime<Utc>) -> usize {
        let mut forced = 0;
        for key in keys {
            if let Some(order) = self.orders.get_mut(&key) {
                order.error = Some("ForcedCancelTimeout".into());
            }
            if self.move_to(key, OrderState::Cancelled, now) {
                warn!(%key, "⏱️ ForcedCancelTimeout: broker never confirmed cancel");
                self.updates.push(OrderUpdate::Alert {
                    key:     Some(key),
                    message: "ForcedCancelTimeout".into(),
                });
                forced += 1;
            }
        }
        forced
    }

    /// Re-evaluates the signal behind an expired order and creates a
    /// replacement for the unfilled remainder when everything still holds.
    pub fn replace(
        &mut self,
        expired: &Order,
        state: &PortfolioState,
        limits: &RiskLimits,
        current_price: Option<f64>,
        ledger: &mut Ledger,
        now: DateTime<Utc>,
    ) -> ReplaceOutcome {
        let remaining = expired.remaining();
        if remaining == 0 {
            return ReplaceOutcome::Nothing;
        }
        let Some(record) = self.signals.get(&expired.signal_id) else {
            return ReplaceOutcome::Nothing;
        };
        if record.replacements >= self.config.max_replacements {
            info!(key = %expired.key, "Replacement budget exhausted, dropping remainder");
            return ReplaceOutcome::Exhausted;
        }
        if state.halted {
            return ReplaceOutcome::Dropped(RejectReason::CircuitBreakerTripped);
        }

        let reference = record.signal.reference_price;
        let price = current_price.unwrap_or(expired.price);
        if adverse_move(expired.side, reference, price) > self.config.max_drift_pct {
            info!(key = %expired.key, reference, price, "Price drifted, dropping remainder");
            return ReplaceOutcome::Dropped(RejectReason::PriceDrifted { reference, current: price });
        }

        let candidate = Signal {
            quantity: remaining,
            reference_price: price,
            created_at: now,
            ..record.signal.clone()
        };
        let decision = if candidate.is_exit() {
            Gatekeeper::evaluate(&candidate, state, limits)
        } else {
            Gatekeeper::evaluate_replacement(&candidate, state, limits)
        };
        if let RiskDecision::Rejected(reason) = decision {
            info!(key = %expired.key, %reason, "Replacement refused by gatekeeper");
            return ReplaceOutcome::Dropped(reason);
        }

        if let Some(record) = self.signals.get_mut(&expired.signal_id) {
            record.replacements += 1;
        }
        let mut order = Order::from_signal(&candidate, remaining, now);
        order.replaces = Some(expired.key);
        let key = self.insert(order, ledger);
        info!(%key, replaces = %expired.key, qty = remaining, "♻️ Replacement order created");
        ReplaceOutcome::Replaced(key)
    }

    // ─── Cancellation ─────────────────────────────────────────────────────────

    pub fn cancel(&mut self, key: IdempotencyKey, now: DateTime<Utc>) -> CancelOutcome {
        let Some(order) = self.orders.get(&key) else {
            return CancelOutcome::Unknown;
        };
        let (state, requested) = (order.state, order.cancel_requested_at.is_some());
        match state {
            OrderState::Created => {
                self.move_to(key, OrderState::Cancelled, now);
                CancelOutcome::CancelledLocally
            }
            state if state.is_terminal() => CancelOutcome::AlreadyTerminal(state),
            _ if requested => CancelOutcome::AlreadyRequested,
            _ => {
                if let Some(order) = self.orders.get_mut(&key) {
                    order.cancel_requested_at = Some(now);
                    order.updated_at = now;
                    info!(%key, symbol = %order.symbol, "🛑 Cancel requested");
                }
                self.commands.push(OrderCommand::Cancel(key));
                CancelOutcome::Requested
            }
        }
    }

    /// Cancels every live order. Returns how many were touched.
    pub fn cancel_all(&mut self, now: DateTime<Utc>) -> usize {
        let live: Vec<IdempotencyKey> = self
            .sequence
            .iter()
            .filter(|k| self.orders.get(*k).is_some_and(Order::is_live))
            .copied()
            .collect();
        live.into_iter()
            .filter(|k| {
                matches!(
                    self.cancel(*k, now),
                    CancelOutcome::CancelledLocally | CancelOutcome::Requested
                )
            })
            .count()
    }

    // ─── Outbox ───────────────────────────────────────────────────────────────

    pub fn drain_commands(&mut self) -> Vec<OrderCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn take_updates(&mut self) -> Vec<OrderUpdate> {
        std::mem::take(&mut self.updates)
    }

    /// Broker-side expiries since the last call, oldest first.
    pub fn take_expired(&mut self) -> Vec<Order> {
        std::mem::take(&mut self.expired)
    }

    // ─── Housekeeping ─────────────────────────────────────────────────────────

    /// Forgets terminal orders whose whole signal chain is settled.
    ///
    /// Run at day rollover. Returns the keys dropped so the ledger can
    /// release their bindings.
    pub fn prune_terminal(&mut self) -> Vec<IdempotencyKey> {
        let live_signals: HashSet<Uuid> = self.live_orders().map(|o| o.signal_id).collect();
        let pruned: Vec<IdempotencyKey> = self
            .sequence
            .iter()
            .filter_map(|k| self.orders.get(k))
            .filter(|o| o.state.is_terminal() && !live_signals.contains(&o.signal_id))
            .map(|o| o.key)
            .collect();
        for key in &pruned {
            self.orders.remove(key);
        }
        self.sequence.retain(|k| self.orders.contains_key(k));
        self.signals.retain(|id, _| live_signals.contains(id));
        if !pruned.is_empty() {
            debug!(pruned = pruned.len(), kept = self.orders.len(), "🧹 Terminal orders pruned");
        }
        pruned
    }

    // ─── Queries ──────────────────────────────────────────────────────────────

    pub fn get(&self, key: &IdempotencyKey) -> Option<&Order> {
        self.orders.get(key)
    }

    /// Every order of the session, oldest first.
    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.sequence.iter().filter_map(|k| self.orders.get(k))
    }

    pub fn live_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders().filter(|o| o.is_live())
    }

    pub fn orders_for<'a>(&'a self, strategy_id: &'a StrategyId) -> impl Iterator<Item = &'a Order> + 'a {
        self.orders().filter(move |o| &o.strategy_id == strategy_id)
    }

    pub fn summary(&self) -> OrderSummary {
        OrderSummary::tally(self.orders.values())
    }

    pub fn all_terminal(&self) -> bool {
        self.orders.values().all(|o| o.state.is_terminal())
    }

    /// Exposure reserved by live entry orders.
    pub fn pending_entries(&self) -> Vec<PendingEntry> {
        self.live_orders()
            .filter(|o| o.intent == OrderIntent::Entry)
            .map(|o| {
                let inherited = o
                    .replaces
                    .and_then(|prev| self.orders.get(&prev))
                    .is_some_and(|prev| prev.filled_quantity > 0);
                PendingEntry {
                    symbol:           o.symbol.clone(),
                    strategy_id:      o.strategy_id.clone(),
                    notional:         o.remaining_notional(),
                    partially_filled: o.filled_quantity > 0 || inherited,
                }
            })
            .collect()
    }

    pub fn has_live_exit(&self, key: &PositionKey) -> bool {
        self.live_orders().any(|o| {
            o.intent == OrderIntent::Exit && o.symbol == key.symbol && o.strategy_id == key.strategy_id
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, ExitPlan, ExitReason, ExitRule};

    fn make_limits() -> RiskLimits {
        RiskLimits {
            risk_per_trade_pct: 0.05,
            ..RiskLimits::default()
        }
    }

    fn make_entry(symbol: &str, qty: u64, price: f64) -> Signal {
        Signal::entry(
            StrategyId::new("momentum"),
            symbol,
            Direction::Buy,
            qty,
            price,
            ExitPlan { stop_loss: ExitRule::Percent(0.15), target: ExitRule::Percent(0.5) },
            "test",
            Utc::now(),
        )
    }

    fn make_fill(id: &str, qty: u64, price: f64) -> Fill {
        Fill { fill_id: id.into(), quantity: qty, price, time: Utc::now() }
    }

    fn setup() -> (OrderManager, Ledger) {
        (
            OrderManager::new(OrderConfig::default()),
            Ledger::new(100_000.0, Utc::now().date_naive()),
        )
    }

    fn ack(key: IdempotencyKey) -> OrderEvent {
        OrderEvent::Acknowledged { key, broker_order_id: "B-1".into(), attempts: 1 }
    }

    fn state_of(manager: &OrderManager, key: IdempotencyKey) -> OrderState {
        manager.get(&key).unwrap().state
    }

    #[test]
    fn test_happy_path_to_filled() {
        let (mut manager, mut ledger) = setup();
        let now = Utc::now();
        let key = manager.create(&make_entry("NIFTY", 50, 100.0), &mut ledger, now);
        assert_eq!(state_of(&manager, key), OrderState::Created);

        assert_eq!(manager.dispatch_created(now, false), 1);
        assert!(matches!(manager.drain_commands().as_slice(), [OrderCommand::Submit(o)] if o.key == key));

        manager.apply(ack(key), &mut ledger, now);
        manager.apply(OrderEvent::Fill { key, fill: make_fill("f1", 20, 100.0) }, &mut ledger, now);
        assert_eq!(state_of(&manager, key), OrderState::PartiallyFilled);
        manager.apply(OrderEvent::Fill { key, fill: make_fill("f2", 30, 101.0) }, &mut ledger, now);

        let order = manager.get(&key).unwrap();
        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.filled_quantity, 50);
        assert!((order.avg_fill_price - 100.6).abs() < 1e-9);
        assert_eq!(ledger.snapshot(now).positions[0].quantity, 50);
    }

    #[test]
    fn test_halted_session_never_submits() {
        let (mut manager, mut ledger) = setup();
        let now = Utc::now();
        let key = manager.create(&make_entry("NIFTY", 50, 100.0), &mut ledger, now);
        assert_eq!(manager.dispatch_created(now, true), 0);
        assert!(manager.drain_commands().is_empty());

        assert_eq!(manager.cancel_all(now), 1);
        assert_eq!(state_of(&manager, key), OrderState::Cancelled);
        assert!(manager.drain_commands().is_empty());
    }

    #[test]
    fn test_duplicate_fill_counts_once() {
        let (mut manager, mut ledger) = setup();
        let now = Utc::now();
        let key = manager.create(&make_entry("NIFTY", 50, 100.0), &mut ledger, now);
        manager.dispatch_created(now, false);
        let fill = make_fill("f1", 50, 100.0);
        manager.apply(OrderEvent::Fill { key, fill: fill.clone() }, &mut ledger, now);
        manager.apply(OrderEvent::Fill { key, fill }, &mut ledger, now);

        assert_eq!(manager.get(&key).unwrap().filled_quantity, 50);
        assert_eq!(ledger.snapshot(now).positions[0].quantity, 50);
    }

    #[test]
    fn test_retry_exhaustion_rejects_with_alert() {
        let (mut manager, mut ledger) = setup();
        let now = Utc::now();
        let key = manager.create(&make_entry("NIFTY", 50, 100.0), &mut ledger, now);
        manager.dispatch_created(now, false);
        manager.take_updates();

        manager.apply(
            OrderEvent::SubmissionFailed { key, attempts: 3, error: "timeout".into() },
            &mut ledger,
            now,
        );
        let order = manager.get(&key).unwrap();
        assert_eq!(order.state, OrderState::Rejected);
        assert_eq!(order.attempts, 3);
        let updates = manager.take_updates();
        assert!(updates.iter().any(|u| matches!(u, OrderUpdate::Alert { .. })));
        assert!(manager.pending_entries().is_empty());
    }

    #[test]
    fn test_unknown_fill_and_overfill_surface() {
        let (mut manager, mut ledger) = setup();
        let now = Utc::now();
        let stray = IdempotencyKey::generate();
        manager.apply(OrderEvent::Fill { key: stray, fill: make_fill("x", 1, 100.0) }, &mut ledger, now);

        let key = manager.create(&make_entry("NIFTY", 10, 100.0), &mut ledger, now);
        manager.dispatch_created(now, false);
        manager.apply(OrderEvent::Fill { key, fill: make_fill("f1", 11, 100.0) }, &mut ledger, now);

        let errors: Vec<ReconciliationError> = manager
            .take_updates()
            .into_iter()
            .filter_map(|u| match u {
                OrderUpdate::Reconciliation(e) => Some(e),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0], ReconciliationError::UnknownOrder { key: stray });
        assert!(matches!(errors[1], ReconciliationError::Overfill { ordered: 10, .. }));
        assert_eq!(state_of(&manager, key), OrderState::Submitted);
    }

    #[test]
    fn test_expiry_replaces_remainder_once() {
        let (mut manager, mut ledger) = setup();
        let limits = make_limits();
        let t0 = Utc::now();
        let key = manager.create(&make_entry("NIFTY", 50, 100.0), &mut ledger, t0);
        manager.dispatch_created(t0, false);
        manager.apply(ack(key), &mut ledger, t0);
        manager.apply(OrderEvent::Fill { key, fill: make_fill("f1", 20, 100.0) }, &mut ledger, t0);
        manager.drain_commands();

        assert!(manager.on_timer(t0 + Duration::seconds(10)).is_empty());
        let t1 = t0 + Duration::seconds(31);
        let expired = manager.on_timer(t1);
        assert_eq!(expired.len(), 1);
        assert_eq!(state_of(&manager, key), OrderState::Expired);
        assert_eq!(manager.drain_commands(), vec![OrderCommand::Cancel(key)]);

        let mut state = ledger.snapshot(t1);
        state.pending_entries = manager.pending_entries();
        let outcome = manager.replace(&expired[0], &state, &limits, Some(100.5), &mut ledger, t1);
        let ReplaceOutcome::Replaced(new_key) = outcome else {
            panic!("expected replacement, got {outcome:?}");
        };
        let replacement = manager.get(&new_key).unwrap();
        assert_eq!(replacement.quantity, 30);
        assert_eq!(replacement.replaces, Some(key));
        assert_eq!(replacement.signal_id, expired[0].signal_id);
        assert!(manager.pending_entries()[0].partially_filled);

        // Second expiry of the same signal: budget of one replacement is spent.
        manager.dispatch_created(t1, false);
        manager.apply(ack(new_key), &mut ledger, t1);
        let again = manager.on_timer(t1 + Duration::seconds(31));
        let state = ledger.snapshot(t1);
        assert_eq!(
            manager.replace(&again[0], &state, &limits, Some(100.5), &mut ledger, t1),
            ReplaceOutcome::Exhausted
        );
    }

    #[test]
    fn test_replacement_dropped_on_drift() {
        let (mut manager, mut ledger) = setup();
        let t0 = Utc::now();
        let key = manager.create(&make_entry("NIFTY", 50, 100.0), &mut ledger, t0);
        manager.dispatch_created(t0, false);
        manager.apply(ack(key), &mut ledger, t0);
        let expired = manager.on_timer(t0 + Duration::seconds(30));
        let state = ledger.snapshot(t0);

        let outcome = manager.replace(&expired[0], &state, &make_limits(), Some(103.0), &mut ledger, t0);
        assert_eq!(
            outcome,
            ReplaceOutcome::Dropped(RejectReason::PriceDrifted { reference: 100.0, current: 103.0 })
        );
    }

    #[test]
    fn test_cancel_paths_and_forced_timeout() {
        let (mut manager, mut ledger) = setup();
        let t0 = Utc::now();
        let key = manager.create(&make_entry("NIFTY", 50, 100.0), &mut ledger, t0);
        manager.dispatch_created(t0, false);
        manager.apply(ack(key), &mut ledger, t0);
        manager.drain_commands();

        assert_eq!(manager.cancel(key, t0), CancelOutcome::Requested);
        assert_eq!(manager.cancel(key, t0), CancelOutcome::AlreadyRequested);
        assert_eq!(manager.drain_commands(), vec![OrderCommand::Cancel(key)]);
        assert_eq!(state_of(&manager, key), OrderState::Acknowledged);

        // No confirmation inside the grace period: forced.
        manager.on_timer(t0 + Duration::seconds(11));
        let order = manager.get(&key).unwrap();
        assert_eq!(order.state, OrderState::Cancelled);
        assert_eq!(order.error.as_deref(), Some("ForcedCancelTimeout"));
        assert_eq!(manager.cancel(key, t0), CancelOutcome::AlreadyTerminal(OrderState::Cancelled));
        assert_eq!(manager.cancel(IdempotencyKey::generate(), t0), CancelOutcome::Unknown);
    }

    #[test]
    fn test_late_fill_on_cancelled_order_reaches_ledger() {
        let (mut manager, mut ledger) = setup();
        let now = Utc::now();
        let key = manager.create(&make_entry("NIFTY", 50, 100.0), &mut ledger, now);
        manager.dispatch_created(now, false);
        manager.apply(ack(key), &mut ledger, now);
        manager.cancel(key, now);
        manager.apply(OrderEvent::Cancelled { key }, &mut ledger, now);
        assert_eq!(state_of(&manager, key), OrderState::Cancelled);

        manager.apply(OrderEvent::Fill { key, fill: make_fill("late", 50, 100.0) }, &mut ledger, now);
        assert_eq!(state_of(&manager, key), OrderState::Cancelled);
        assert_eq!(ledger.snapshot(now).positions[0].quantity, 50);
    }

    #[test]
    fn test_fill_may_overtake_ack() {
        let (mut manager, mut ledger) = setup();
        let now = Utc::now();
        let key = manager.create(&make_entry("NIFTY", 50, 100.0), &mut ledger, now);
        manager.dispatch_created(now, false);
        manager.apply(OrderEvent::Fill { key, fill: make_fill("f1", 50, 100.0) }, &mut ledger, now);
        manager.apply(ack(key), &mut ledger, now);

        let order = manager.get(&key).unwrap();
        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.broker_order_id.as_deref(), Some("B-1"));
    }

    #[test]
    fn test_exit_order_tracking_and_summary() {
        let (mut manager, mut ledger) = setup();
        let now = Utc::now();
        let entry = manager.create(&make_entry("NIFTY", 50, 100.0), &mut ledger, now);
        manager.dispatch_created(now, false);
        manager.apply(OrderEvent::Fill { key: entry, fill: make_fill("f1", 50, 100.0) }, &mut ledger, now);

        let position = ledger.snapshot(now).positions[0].clone();
        let exit = Signal::exit(
            position.strategy_id.clone(),
            "NIFTY",
            Direction::Sell,
            50,
            85.0,
            ExitReason::StopLoss,
            now,
        );
        manager.create(&exit, &mut ledger, now);
        assert!(manager.has_live_exit(&position.key()));
        assert!(manager.pending_entries().is_empty());

        let summary = manager.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.filled, 1);
        assert_eq!(summary.open, 1);
        assert_eq!(manager.orders_for(&StrategyId::new("momentum")).count(), 2);
    }

    #[test]
    fn test_broker_expiry_queues_replacement() {
        let (mut manager, mut ledger) = setup();
        let now = Utc::now();
        let key = manager.create(&make_entry("NIFTY", 50, 100.0), &mut ledger, now);
        manager.dispatch_created(now, false);
        manager.apply(ack(key), &mut ledger, now);
        manager.apply(OrderEvent::Fill { key, fill: make_fill("f1", 10, 100.0) }, &mut ledger, now);

        manager.apply(OrderEvent::Expired { key }, &mut ledger, now);
        let expired = manager.take_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].state, OrderState::Expired);
        assert_eq!(expired[0].remaining(), 40);
        assert!(manager.take_expired().is_empty());

        // A second report for the same order is not queued again.
        manager.apply(OrderEvent::Expired { key }, &mut ledger, now);
        assert!(manager.take_expired().is_empty());

        let mut state = ledger.snapshot(now);
        state.pending_entries = manager.pending_entries();
        let outcome = manager.replace(&expired[0], &state, &make_limits(), Some(100.0), &mut ledger, now);
        assert!(matches!(outcome, ReplaceOutcome::Replaced(_)));
    }

    #[test]
    fn test_force_cancel_live_settles_every_order() {
        let (mut manager, mut ledger) = setup();
        let now = Utc::now();
        let acked = manager.create(&make_entry("NIFTY", 50, 100.0), &mut ledger, now);
        manager.dispatch_created(now, false);
        manager.apply(ack(acked), &mut ledger, now);
        let filled = manager.create(&make_entry("BANKNIFTY", 10, 100.0), &mut ledger, now);
        manager.dispatch_created(now, false);
        manager.apply(OrderEvent::Fill { key: filled, fill: make_fill("f1", 10, 100.0) }, &mut ledger, now);
        manager.cancel_all(now);
        manager.take_updates();

        assert_eq!(manager.force_cancel_live(now), 1);
        assert!(manager.all_terminal());
        assert_eq!(manager.get(&acked).unwrap().error.as_deref(), Some("ForcedCancelTimeout"));
        assert_eq!(state_of(&manager, filled), OrderState::Filled);
        let alerts = manager
            .take_updates()
            .into_iter()
            .filter(|u| matches!(u, OrderUpdate::Alert { key: Some(k), .. } if *k == acked))
            .count();
        assert_eq!(alerts, 1);
        assert_eq!(manager.force_cancel_live(now), 0);
    }

    #[test]
    fn test_prune_keeps_live_signal_chains() {
        let (mut manager, mut ledger) = setup();
        let now = Utc::now();
        let done = manager.create(&make_entry("NIFTY", 50, 100.0), &mut ledger, now);
        manager.dispatch_created(now, false);
        manager.apply(OrderEvent::Fill { key: done, fill: make_fill("f1", 50, 100.0) }, &mut ledger, now);

        let first = manager.create(&make_entry("BANKNIFTY", 50, 100.0), &mut ledger, now);
        manager.dispatch_created(now, false);
        manager.apply(ack(first), &mut ledger, now);
        let expired = manager.on_timer(now + Duration::seconds(31));
        let state = ledger.snapshot(now);
        let ReplaceOutcome::Replaced(second) =
            manager.replace(&expired[0], &state, &make_limits(), Some(100.0), &mut ledger, now)
        else {
            panic!("expected replacement");
        };

        assert_eq!(manager.prune_terminal(), vec![done]);
        assert!(manager.get(&done).is_none());
        assert!(manager.get(&first).is_some(), "chain of a live replacement stays");
        assert_eq!(manager.orders().count(), 2);

        assert_eq!(manager.cancel(second, now), CancelOutcome::CancelledLocally);
        let mut pruned = manager.prune_terminal();
        pruned.sort_by_key(|k| k.to_string());
        let mut expected = vec![first, second];
        expected.sort_by_key(|k| k.to_string());
        assert_eq!(pruned, expected);
        assert_eq!(manager.summary().total, 0);
    }
}
