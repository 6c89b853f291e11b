//! # engine::control: Control Loop
//!
//! Single owner of the [`Ledger`], the [`OrderManager`] and the
//! [`CircuitBreaker`]. Ticks, timer firings and order-status events are merged
//! into one ordered stream and each event runs to completion before the next
//! one starts, so a signal is never evaluated against a portfolio that misses
//! an already-received fill.
//!
//! ```text
//! FeedRunner ─▶ ticks ─────┐
//! Broker     ─▶ events ────┼─▶ EventMerger ─▶ process ─▶ breaker ─▶ dispatch ─▶ Executor
//! interval   ─▶ timer ─────┘                     │
//! operator   ─▶ commands (between events)        └─▶ Journal · broadcast · watch<SessionSnapshot>
//! ```
//!
//! ## Per event
//! 1. **Order event**: lifecycle transition, fills reconciled into the ledger
//! 2. **Tick**: mark positions, ask every strategy, gate the cycle, create orders
//! 3. **Timer**: day rollover (terminal orders pruned), expiries +
//!    replacements, strategy timers
//! 4. Breaker check on the fresh drawdown; a trip cancels every open order
//! 5. `Created` orders go to the broker unless the session is halted
//! 6. Publish the snapshot

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{env_u64, env_usize, AppConfig};
use crate::engine::breaker::CircuitBreaker;
use crate::engine::executor::Executor;
use crate::engine::merge::{Arrival, EventMerger, LoopEvent};
use crate::engine::orders::{CancelOutcome, OrderConfig, OrderManager, OrderUpdate, ReplaceOutcome};
use crate::error::{CircuitBreakerTrip, ConfigError};
use crate::events::{AlertLevel, WsEvent};
use crate::journal::{Journal, JournalRecord};
use crate::ledger::Ledger;
use crate::models::{
    ClosedPosition, IdempotencyKey, Order, OrderEvent, OrderState, OrderSummary, PortfolioState,
    PositionKey, Signal, StrategyId, Tick,
};
use crate::risk::{Gatekeeper, RejectReason, RiskDecision, RiskLimits};
use crate::shutdown::StopSignal;
use crate::strategy::Strategy;

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub timer_interval:   Duration,
    /// How long shutdown waits for in-flight orders to settle.
    pub shutdown_grace:   Duration,
    pub feed_stale_after: Duration,
    pub channel_capacity: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            timer_interval:   Duration::from_millis(1_000),
            shutdown_grace:   Duration::from_secs(10),
            feed_stale_after: Duration::from_secs(30),
            channel_capacity: 1_024,
        }
    }
}

impl ControlConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            timer_interval:   Duration::from_millis(env_u64("TIMER_INTERVAL_MS", d.timer_interval.as_millis() as u64)?),
            shutdown_grace:   Duration::from_secs(env_u64("SHUTDOWN_GRACE_SECS", d.shutdown_grace.as_secs())?),
            feed_stale_after: Duration::from_secs(env_u64("FEED_STALE_AFTER_SECS", d.feed_stale_after.as_secs())?),
            channel_capacity: env_usize("CHANNEL_CAPACITY", d.channel_capacity)?,
        };
        if config.timer_interval.is_zero() {
            return Err(ConfigError::Invalid { key: "TIMER_INTERVAL_MS", reason: "must be positive".into() });
        }
        if config.channel_capacity == 0 {
            return Err(ConfigError::Invalid { key: "CHANNEL_CAPACITY", reason: "must be positive".into() });
        }
        Ok(config)
    }
}

// ─── Operator commands ────────────────────────────────────────────────────────

/// Handled between events, never in the middle of one.
#[derive(Debug)]
pub enum ControlCommand {
    /// Trip the breaker and cancel every open order. The session keeps running.
    Kill { reason: String, reply: oneshot::Sender<KillReport> },
    Reset { reply: oneshot::Sender<bool> },
    ReloadLimits {
        limits: RiskLimits,
        reply:  oneshot::Sender<Result<(), ConfigError>>,
    },
    CancelOrder {
        key:   IdempotencyKey,
        reply: oneshot::Sender<CancelOutcome>,
    },
    /// Graceful shutdown: cancel, drain, persist, exit.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KillReport {
    /// `false` when the breaker was already tripped.
    pub tripped:   bool,
    pub cancelled: usize,
}

// ─── Snapshot / outcome ───────────────────────────────────────────────────────

/// Immutable copy of the session for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub portfolio:        PortfolioState,
    pub orders:           Vec<Order>,
    pub order_summary:    OrderSummary,
    pub closed_positions: Vec<ClosedPosition>,
    pub breaker:          Option<CircuitBreakerTrip>,
    pub limits:           RiskLimits,
    pub trading_day:      NaiveDate,
    pub last_tick_at:     Option<DateTime<Utc>>,
    pub events_processed: u64,
    pub running:          bool,
}

impl SessionSnapshot {
    /// Snapshot of a session that has not seen any event yet.
    pub fn empty(now: DateTime<Utc>) -> Self {
        let limits = RiskLimits::default();
        Self {
            portfolio:        Ledger::new(limits.capital, now.date_naive()).snapshot(now),
            orders:           Vec::new(),
            order_summary:    OrderSummary::default(),
            closed_positions: Vec::new(),
            breaker:          None,
            limits,
            trading_day:      now.date_naive(),
            last_tick_at:     None,
            events_processed: 0,
            running:          true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Clean,
    /// Ended while the circuit breaker was tripped.
    Halted,
}

impl SessionOutcome {
    pub fn exit_code(self) -> u8 {
        match self {
            SessionOutcome::Clean => 0,
            SessionOutcome::Halted => 2,
        }
    }
}

// ─── Wiring ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub control: ControlConfig,
    pub limits:  RiskLimits,
    pub orders:  OrderConfig,
}

impl From<&AppConfig> for LoopSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            control: config.control.clone(),
            limits:  config.limits.clone(),
            orders:  config.orders.clone(),
        }
    }
}

pub struct LoopInputs {
    pub ticks:        mpsc::Receiver<Arrival<Tick>>,
    pub order_events: mpsc::Receiver<Arrival<OrderEvent>>,
    pub commands:     mpsc::Receiver<ControlCommand>,
    pub stop:         StopSignal,
}

pub struct LoopOutputs {
    pub executor:     Executor,
    pub journal:      Journal,
    pub broadcast_tx: broadcast::Sender<String>,
}

enum Flow {
    Continue,
    Stop,
}

// ─── Loop ─────────────────────────────────────────────────────────────────────

pub struct ControlLoop {
    config:           ControlConfig,
    limits:           RiskLimits,
    ledger:           Ledger,
    orders:           OrderManager,
    breaker:          CircuitBreaker,
    merger:           EventMerger,
    strategies:       Vec<Box<dyn Strategy>>,
    priorities:       HashMap<StrategyId, u32>,
    inputs:           LoopInputs,
    outputs:          LoopOutputs,
    snapshot_tx:      watch::Sender<SessionSnapshot>,
    last_prices:      HashMap<String, f64>,
    last_tick_at:     Option<DateTime<Utc>>,
    events_processed: u64,
    running:          bool,
}

impl ControlLoop {
    pub fn new(
        settings: LoopSettings,
        strategies: Vec<Box<dyn Strategy>>,
        outputs: LoopOutputs,
        inputs: LoopInputs,
    ) -> (Self, watch::Receiver<SessionSnapshot>) {
        let now = Utc::now();
        let LoopSettings { control, limits, orders } = settings;
        let ledger = Ledger::new(limits.capital, session_day(&limits, now));
        let priorities = strategies.iter().map(|s| (s.id().clone(), s.priority())).collect();

        let (snapshot_tx, _) = watch::channel(SessionSnapshot::empty(now));
        let this = Self {
            config: control,
            breaker: CircuitBreaker::new(limits.breaker_drawdown_pct),
            limits,
            ledger,
            orders: OrderManager::new(orders),
            merger: EventMerger::new(),
            strategies,
            priorities,
            inputs,
            outputs,
            snapshot_tx,
            last_prices: HashMap::new(),
            last_tick_at: None,
            events_processed: 0,
            running: true,
        };
        this.publish();
        let snapshot_rx = this.snapshot_tx.subscribe();
        (this, snapshot_rx)
    }

    /// Runs until an operator shutdown or the stop signal, then winds down.
    pub async fn run(mut self) -> SessionOutcome {
        info!(
            strategies = self.strategies.len(),
            capital    = self.limits.capital,
            threshold  = self.breaker.threshold(),
            "🚀 Control loop started"
        );

        let mut timer = tokio::time::interval(self.config.timer_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.inputs.stop.triggered() => {
                    warn!("🛑 Emergency stop observed");
                    break;
                }
                Some(command) = self.inputs.commands.recv() => {
                    if let Flow::Stop = self.handle_command(command) {
                        break;
                    }
                }
                Some(arrival) = self.inputs.order_events.recv() => self.merger.push_order(arrival),
                Some(arrival) = self.inputs.ticks.recv() => self.merger.push_tick(arrival),
                _ = timer.tick() => self.merger.push(Instant::now(), LoopEvent::Timer(Utc::now())),
            }

            self.drain_inputs();
            while let Some(event) = self.merger.pop() {
                self.process(event);
            }
        }

        self.shutdown().await
    }

    /// Pulls whatever else already arrived so the merger can order it.
    fn drain_inputs(&mut self) {
        let budget = self.config.channel_capacity;
        for _ in 0..budget {
            match self.inputs.order_events.try_recv() {
                Ok(arrival) => self.merger.push_order(arrival),
                Err(_) => break,
            }
        }
        for _ in 0..budget {
            match self.inputs.ticks.try_recv() {
                Ok(arrival) => self.merger.push_tick(arrival),
                Err(_) => break,
            }
        }
    }

    // ─── Events ───────────────────────────────────────────────────────────────

    fn process(&mut self, event: LoopEvent) {
        let now = Utc::now();
        match event {
            LoopEvent::Order(event) => {
                self.orders.apply(event, &mut self.ledger, now);
                // Broker-side expiry gets the same re-evaluation as a local timeout.
                for expired in self.orders.take_expired() {
                    self.replace_expired(&expired, now);
                }
                self.flush_updates(now);
            }
            LoopEvent::Tick(tick) => self.on_tick(tick, now),
            LoopEvent::Timer(at) => self.on_timer(at),
        }

        self.events_processed += 1;
        if let Some(trip) = self.breaker.check(self.ledger.drawdown(), now) {
            self.on_trip(trip, now);
        }
        self.flush(now);
        self.publish();
    }

    fn on_tick(&mut self, tick: Tick, now: DateTime<Utc>) {
        if !tick.is_valid() {
            warn!(symbol = %tick.symbol, ltp = tick.ltp, "Invalid tick dropped");
            return;
        }
        self.last_tick_at = Some(tick.time);
        self.last_prices.insert(tick.symbol.clone(), tick.ltp);

        for position in self.ledger.mark_tick(&tick) {
            self.broadcast(&WsEvent::PositionUpdated { position: Box::new(position) });
        }

        let portfolio = self.portfolio(now);
        let signals: Vec<Signal> = self
            .strategies
            .iter_mut()
            .filter_map(|s| s.on_tick(&tick, &portfolio))
            .collect();
        self.run_cycle(signals, now);
    }

    fn on_timer(&mut self, now: DateTime<Utc>) {
        if self.ledger.roll_day(session_day(&self.limits, now)) {
            let pruned = self.orders.prune_terminal();
            self.ledger.release_orders(&pruned);
        }

        for expired in self.orders.on_timer(now) {
            self.replace_expired(&expired, now);
        }
        self.flush_updates(now);

        let portfolio = self.portfolio(now);
        let signals: Vec<Signal> = self
            .strategies
            .iter_mut()
            .filter_map(|s| s.on_timer(now, &portfolio))
            .collect();
        self.run_cycle(signals, now);
    }

    fn replace_expired(&mut self, expired: &Order, now: DateTime<Utc>) {
        let state = self.portfolio(now);
        let price = self.last_prices.get(&expired.symbol).copied();
        match self.orders.replace(expired, &state, &self.limits, price, &mut self.ledger, now) {
            ReplaceOutcome::Replaced(key) => {
                debug!(%key, replaces = %expired.key, "Expired order replaced");
            }
            ReplaceOutcome::Dropped(reason) => {
                self.outputs.journal.record(JournalRecord::RiskDecision {
                    signal_id:   expired.signal_id,
                    strategy_id: expired.strategy_id.clone(),
                    symbol:      expired.symbol.clone(),
                    approved:    false,
                    reason:      Some(reason.clone()),
                });
                self.broadcast(&WsEvent::SignalRejected {
                    signal_id:   expired.signal_id,
                    strategy_id: expired.strategy_id.clone(),
                    symbol:      expired.symbol.clone(),
                    reason,
                });
            }
            ReplaceOutcome::Exhausted => {
                self.alert(
                    AlertLevel::Warning,
                    format!("{} {}: replacement budget spent, remainder dropped", expired.symbol, expired.key),
                );
            }
            ReplaceOutcome::Nothing => {}
        }
    }

    /// Gates one batch of signals and creates orders for the approved ones.
    fn run_cycle(&mut self, signals: Vec<Signal>, now: DateTime<Utc>) {
        if signals.is_empty() {
            return;
        }
        for signal in &signals {
            info!(
                strategy  = %signal.strategy_id,
                symbol    = %signal.symbol,
                direction = %signal.direction,
                qty       = signal.quantity,
                price     = signal.reference_price,
                rationale = %signal.rationale,
                "📡 Signal"
            );
            self.outputs.journal.record(JournalRecord::Signal { signal: signal.clone() });
            self.broadcast(&WsEvent::SignalEmitted { signal: Box::new(signal.clone()) });
        }

        let state = self.portfolio(now);
        let priorities = &self.priorities;
        let decisions = Gatekeeper::evaluate_cycle(signals, &state, &self.limits, |id| {
            priorities.get(id).copied().unwrap_or(u32::MAX)
        });

        for (signal, decision) in decisions {
            let decision = match decision {
                RiskDecision::Approved if signal.is_exit() && self.exit_in_flight(&signal) => {
                    RiskDecision::Rejected(RejectReason::ExitAlreadyPending)
                }
                other => other,
            };
            let reason = match &decision {
                RiskDecision::Approved => None,
                RiskDecision::Rejected(reason) => Some(reason.clone()),
            };
            self.outputs.journal.record(JournalRecord::RiskDecision {
                signal_id:   signal.signal_id,
                strategy_id: signal.strategy_id.clone(),
                symbol:      signal.symbol.clone(),
                approved:    reason.is_none(),
                reason:      reason.clone(),
            });

            match reason {
                None => {
                    self.orders.create(&signal, &mut self.ledger, now);
                }
                Some(reason) => {
                    self.notify_rejected(&signal.strategy_id, &signal.symbol, &reason.to_string(), now);
                    self.broadcast(&WsEvent::SignalRejected {
                        signal_id:   signal.signal_id,
                        strategy_id: signal.strategy_id,
                        symbol:      signal.symbol,
                        reason,
                    });
                }
            }
        }
        self.flush_updates(now);
    }

    fn exit_in_flight(&self, signal: &Signal) -> bool {
        let key = PositionKey::new(signal.symbol.clone(), signal.strategy_id.clone());
        self.orders.has_live_exit(&key)
    }

    // ─── Breaker ──────────────────────────────────────────────────────────────

    /// Returns the number of orders cancelled.
    fn on_trip(&mut self, trip: CircuitBreakerTrip, now: DateTime<Utc>) -> usize {
        self.outputs.journal.record(JournalRecord::BreakerTripped { trip: trip.clone() });
        self.broadcast(&WsEvent::BreakerTripped { trip: trip.clone() });
        self.alert(AlertLevel::Critical, format!("trading halted: {}", trip.reason));

        let cancelled = self.orders.cancel_all(now);
        warn!(cancelled, "Open orders cancelled by circuit breaker");
        cancelled
    }

    // ─── Commands ─────────────────────────────────────────────────────────────

    fn handle_command(&mut self, command: ControlCommand) -> Flow {
        let now = Utc::now();
        match command {
            ControlCommand::Kill { reason, reply } => {
                let trip = self.breaker.trip_manual(reason, self.ledger.drawdown(), now);
                let tripped = trip.is_some();
                let cancelled = match trip {
                    Some(trip) => self.on_trip(trip, now),
                    None => self.orders.cancel_all(now),
                };
                // The caller may have given up waiting.
                let _ = reply.send(KillReport { tripped, cancelled });
            }

            ControlCommand::Reset { reply } => {
                let reset = self.breaker.reset();
                if reset {
                    self.ledger.rebase_peak();
                    self.outputs.journal.record(JournalRecord::BreakerReset);
                    self.broadcast(&WsEvent::BreakerReset);
                }
                let _ = reply.send(reset);
            }

            ControlCommand::ReloadLimits { limits, reply } => {
                let result = limits.validate();
                match &result {
                    Ok(()) => {
                        if limits.capital != self.limits.capital {
                            warn!(capital = limits.capital, "Capital change ignored until restart");
                        }
                        info!(
                            max_concurrent = limits.max_concurrent_positions,
                            breaker        = limits.breaker_drawdown_pct,
                            "🔧 Risk limits reloaded"
                        );
                        self.breaker.set_threshold(limits.breaker_drawdown_pct);
                        self.outputs.journal.record(JournalRecord::LimitsReloaded { limits: limits.clone() });
                        self.broadcast(&WsEvent::LimitsReloaded { limits: Box::new(limits.clone()) });
                        self.limits = limits;
                    }
                    Err(e) => warn!(error = %e, "Risk limits reload refused"),
                }
                let _ = reply.send(result);
            }

            ControlCommand::CancelOrder { key, reply } => {
                let outcome = self.orders.cancel(key, now);
                let _ = reply.send(outcome);
            }

            ControlCommand::Shutdown => {
                info!("Shutdown requested by operator");
                return Flow::Stop;
            }
        }

        self.flush(now);
        self.publish();
        Flow::Continue
    }

    // ─── Shutdown ─────────────────────────────────────────────────────────────

    async fn shutdown(mut self) -> SessionOutcome {
        let now = Utc::now();
        self.running = false;
        // Submission workers stop retrying.
        self.inputs.stop.trigger();

        let cancelled = self.orders.cancel_all(now);
        info!(cancelled, grace_secs = self.config.shutdown_grace.as_secs(), "🧹 Shutting down: cancelling open orders");
        self.flush(now);
        self.publish();

        let deadline = Instant::now() + self.config.shutdown_grace;
        while !self.orders.all_terminal() {
            tokio::select! {
                Some(arrival) = self.inputs.order_events.recv() => {
                    let now = Utc::now();
                    self.orders.apply(arrival.item, &mut self.ledger, now);
                    // No replacements once shutdown began.
                    self.orders.take_expired();
                    self.flush(now);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let now = Utc::now();
                    let forced = self.orders.force_cancel_live(now);
                    self.alert(AlertLevel::Warning, format!("shutdown grace elapsed, {forced} orders forced to cancelled"));
                    self.flush(now);
                    break;
                }
            }
        }

        let halted = self.breaker.is_tripped();
        let portfolio = self.portfolio(Utc::now());
        info!(
            equity   = portfolio.equity,
            realized = portfolio.realized_pnl_today,
            open     = portfolio.open_positions,
            halted,
            "🏁 Session ended"
        );
        self.outputs.journal.record(JournalRecord::FinalSnapshot {
            portfolio,
            orders: self.orders.summary(),
            halted,
        });
        self.broadcast(&WsEvent::SessionEnded { halted });
        self.publish();

        if halted {
            SessionOutcome::Halted
        } else {
            SessionOutcome::Clean
        }
    }

    // ─── Outbox ───────────────────────────────────────────────────────────────

    /// Hands `Created` orders and queued cancels to the executor.
    ///
    /// Nothing is submitted while the breaker is tripped or after shutdown began.
    fn flush(&mut self, now: DateTime<Utc>) {
        self.orders.dispatch_created(now, self.breaker.is_tripped() || !self.running);
        for command in self.orders.drain_commands() {
            self.outputs.executor.dispatch(command);
        }
        self.flush_updates(now);
    }

    fn flush_updates(&mut self, now: DateTime<Utc>) {
        for update in self.orders.take_updates() {
            match update {
                OrderUpdate::State { order, from } => {
                    if order.state == OrderState::Rejected {
                        let reason = order.error.clone().unwrap_or_else(|| "rejected".into());
                        self.notify_rejected(&order.strategy_id, &order.symbol, &reason, now);
                    }
                    self.outputs.journal.record(JournalRecord::OrderTransition { order: order.clone(), from });
                    self.broadcast(&WsEvent::OrderUpdated { order: Box::new(order), from });
                }
                OrderUpdate::Fill { order, fill, report } => {
                    self.outputs.journal.record(JournalRecord::Fill { key: order.key, fill });
                    if let Some(closed) = report.closed {
                        self.outputs.journal.record(JournalRecord::PositionClosed { closed: closed.clone() });
                        self.broadcast(&WsEvent::PositionClosed { closed: Box::new(closed) });
                    }
                    if let Some(position) = report.position {
                        self.broadcast(&WsEvent::PositionUpdated { position: Box::new(position) });
                    }
                }
                OrderUpdate::Reconciliation(error) => {
                    self.outputs.journal.record(JournalRecord::Reconciliation { error: error.clone() });
                    self.broadcast(&WsEvent::ReconciliationFailed { error });
                }
                OrderUpdate::Alert { key, message } => {
                    let message = match key {
                        Some(key) => format!("order {key}: {message}"),
                        None => message,
                    };
                    self.alert(AlertLevel::Warning, message);
                }
            }
        }
    }

    fn notify_rejected(&mut self, strategy_id: &StrategyId, symbol: &str, reason: &str, at: DateTime<Utc>) {
        if let Some(strategy) = self.strategies.iter_mut().find(|s| s.id() == strategy_id) {
            strategy.on_order_rejected(symbol, reason, at);
        }
    }

    fn alert(&self, level: AlertLevel, message: String) {
        match level {
            AlertLevel::Critical => error!(%message, "🚨 Alert"),
            AlertLevel::Warning => warn!(%message, "⚠️ Alert"),
        }
        self.outputs.journal.record(JournalRecord::Alert { message: message.clone() });
        self.broadcast(&WsEvent::Alert { level, message });
    }

    fn broadcast(&self, event: &WsEvent) {
        // No subscribers is fine (headless run).
        let _ = self.outputs.broadcast_tx.send(event.to_json());
    }

    // ─── Views ────────────────────────────────────────────────────────────────

    fn portfolio(&self, now: DateTime<Utc>) -> PortfolioState {
        let mut state = self.ledger.snapshot(now);
        state.pending_entries = self.orders.pending_entries();
        state.halted = self.breaker.is_tripped();
        state
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            portfolio:        self.portfolio(Utc::now()),
            orders:           self.orders.orders().cloned().collect(),
            order_summary:    self.orders.summary(),
            closed_positions: self.ledger.closed_positions().to_vec(),
            breaker:          self.breaker.trip_info().cloned(),
            limits:           self.limits.clone(),
            trading_day:      self.ledger.trading_day(),
            last_tick_at:     self.last_tick_at,
            events_processed: self.events_processed,
            running:          self.running,
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}

/// Trading day in exchange time when a window is configured, UTC otherwise.
fn session_day(limits: &RiskLimits, now: DateTime<Utc>) -> NaiveDate {
    limits
        .trading_window
        .and_then(|w| FixedOffset::east_opt(w.utc_offset_minutes * 60))
        .map(|offset| now.with_timezone(&offset).date_naive())
        .unwrap_or_else(|| now.date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerAck, PaperBroker};
    use crate::error::SubmissionError;
    use crate::journal::JournalEntry;
    use crate::models::{Direction, ExitPlan, ExitRule, OrderIntent};
    use crate::retry::RetryPolicy;
    use crate::strategy::exit::{check_exit, exit_signal};
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Enters once per symbol at the tick price and exits on its stop or target.
    struct OneShot {
        id:       StrategyId,
        quantity: u64,
        stop_pct: f64,
        rejected: Vec<String>,
    }

    impl Strategy for OneShot {
        fn id(&self) -> &StrategyId {
            &self.id
        }

        fn priority(&self) -> u32 {
            1
        }

        fn on_tick(&mut self, tick: &Tick, portfolio: &PortfolioState) -> Option<Signal> {
            if let Some(position) = portfolio.position(&tick.symbol, &self.id) {
                let reason = check_exit(position, tick.ltp, tick.time, chrono::Duration::hours(1))?;
                return exit_signal(position, tick.ltp, reason, tick.time);
            }
            if portfolio.has_pending_entry(&tick.symbol, &self.id) || self.rejected.contains(&tick.symbol) {
                return None;
            }
            Some(Signal::entry(
                self.id.clone(),
                tick.symbol.clone(),
                Direction::Buy,
                self.quantity,
                tick.ltp,
                ExitPlan { stop_loss: ExitRule::Percent(self.stop_pct), target: ExitRule::Percent(0.5) },
                "test entry",
                tick.time,
            ))
        }

        fn on_timer(&mut self, _now: DateTime<Utc>, _portfolio: &PortfolioState) -> Option<Signal> {
            None
        }

        fn on_order_rejected(&mut self, symbol: &str, _reason: &str, _at: DateTime<Utc>) {
            self.rejected.push(symbol.to_string());
        }
    }

    /// Acknowledges every order and never confirms a cancel.
    struct StickyBroker;

    #[async_trait]
    impl Broker for StickyBroker {
        fn name(&self) -> &'static str {
            "sticky"
        }

        async fn submit(&self, order: &Order) -> Result<BrokerAck, SubmissionError> {
            Ok(BrokerAck { broker_order_id: format!("STICKY-{}", order.key) })
        }

        async fn cancel(&self, _key: IdempotencyKey) -> Result<(), SubmissionError> {
            Err(SubmissionError::Transport("cancel endpoint down".into()))
        }
    }

    struct Harness {
        ticks:        mpsc::Sender<Arrival<Tick>>,
        order_events: mpsc::Sender<Arrival<OrderEvent>>,
        commands:     mpsc::Sender<ControlCommand>,
        snapshots:    watch::Receiver<SessionSnapshot>,
        journal:      mpsc::UnboundedReceiver<JournalEntry>,
        handle:       tokio::task::JoinHandle<SessionOutcome>,
    }

    fn make_limits() -> RiskLimits {
        RiskLimits {
            max_position_pct:     1.0,
            risk_per_trade_pct:   1.0,
            max_stop_pct:         1.0,
            breaker_drawdown_pct: 0.05,
            trading_window:       None,
            ..RiskLimits::default()
        }
    }

    fn make_strategy(stop_pct: f64) -> OneShot {
        OneShot { id: StrategyId::new("oneshot"), quantity: 100, stop_pct, rejected: Vec::new() }
    }

    fn start(limits: RiskLimits) -> Harness {
        start_with(limits, make_strategy(0.5), |events| Arc::new(PaperBroker::new(events)))
    }

    fn start_with(
        limits: RiskLimits,
        strategy: OneShot,
        broker: impl FnOnce(mpsc::Sender<Arrival<OrderEvent>>) -> Arc<dyn Broker>,
    ) -> Harness {
        let (order_tx, order_rx) = mpsc::channel(64);
        let (tick_tx, tick_rx) = mpsc::channel(64);
        let (command_tx, command_rx) = mpsc::channel(8);
        let (broadcast_tx, _) = broadcast::channel(256);
        let (journal, journal_rx) = Journal::channel();
        let stop = StopSignal::new();

        let executor = Executor::new(broker(order_tx.clone()), RetryPolicy::default(), stop.clone(), order_tx.clone());
        let settings = LoopSettings {
            control: ControlConfig {
                timer_interval: Duration::from_millis(50),
                shutdown_grace: Duration::from_millis(500),
                ..ControlConfig::default()
            },
            limits,
            orders: OrderConfig::default(),
        };
        let (control, snapshots) = ControlLoop::new(
            settings,
            vec![Box::new(strategy)],
            LoopOutputs { executor, journal, broadcast_tx },
            LoopInputs { ticks: tick_rx, order_events: order_rx, commands: command_rx, stop },
        );

        Harness {
            ticks: tick_tx,
            order_events: order_tx,
            commands: command_tx,
            snapshots,
            journal: journal_rx,
            handle: tokio::spawn(control.run()),
        }
    }

    async fn send_tick(harness: &Harness, symbol: &str, ltp: f64) -> DateTime<Utc> {
        let at = Utc::now();
        harness.ticks.send(Arrival::now(Tick::new(symbol, ltp, at))).await.unwrap();
        at
    }

    async fn wait_for(harness: &mut Harness, what: impl FnMut(&SessionSnapshot) -> bool) -> SessionSnapshot {
        tokio::time::timeout(Duration::from_secs(2), harness.snapshots.wait_for(what))
            .await
            .expect("snapshot condition not reached in time")
            .expect("control loop gone")
            .clone()
    }

    fn drain_journal(journal: &mut mpsc::UnboundedReceiver<JournalEntry>) -> Vec<JournalRecord> {
        std::iter::from_fn(|| journal.try_recv().ok()).map(|e| e.record).collect()
    }

    #[tokio::test]
    async fn test_signal_flows_to_filled_position() {
        let mut harness = start(make_limits());
        send_tick(&harness, "NIFTY", 100.0).await;

        let snap = wait_for(&mut harness, |s| s.portfolio.open_positions == 1).await;
        assert_eq!(snap.portfolio.positions[0].quantity, 100);
        assert_eq!(snap.order_summary.filled, 1);
        assert_eq!(snap.portfolio.trades_today, 1);

        harness.commands.send(ControlCommand::Shutdown).await.unwrap();
        assert_eq!(harness.handle.await.unwrap(), SessionOutcome::Clean);

        let records = drain_journal(&mut harness.journal);
        assert!(records.iter().any(|r| matches!(r, JournalRecord::Signal { .. })));
        assert!(records.iter().any(|r| matches!(r, JournalRecord::RiskDecision { approved: true, .. })));
        assert!(records.iter().any(|r| matches!(r, JournalRecord::Fill { .. })));
        assert!(matches!(records.last(), Some(JournalRecord::FinalSnapshot { halted: false, .. })));
    }

    #[tokio::test]
    async fn test_stop_loss_exit_closes_position() {
        let mut harness = start_with(make_limits(), make_strategy(0.15), |events| Arc::new(PaperBroker::new(events)));
        send_tick(&harness, "NIFTY", 100.0).await;
        wait_for(&mut harness, |s| s.portfolio.open_positions == 1).await;

        // Stop sits at 85.
        send_tick(&harness, "NIFTY", 85.0).await;
        let snap = wait_for(&mut harness, |s| s.closed_positions.len() == 1).await;
        assert_eq!(snap.portfolio.open_positions, 0);
        assert!((snap.closed_positions[0].realized_pnl + 1_500.0).abs() < 1e-9);
        assert!((snap.portfolio.realized_pnl_today + 1_500.0).abs() < 1e-9);
        let exit = snap.orders.iter().find(|o| o.intent == OrderIntent::Exit).unwrap();
        assert_eq!(exit.side, Direction::Sell);
        assert_eq!(exit.quantity, 100);
        assert_eq!(exit.state, OrderState::Filled);

        harness.commands.send(ControlCommand::Shutdown).await.unwrap();
        assert_eq!(harness.handle.await.unwrap(), SessionOutcome::Clean);

        let records = drain_journal(&mut harness.journal);
        assert!(records.iter().any(|r| matches!(
            r,
            JournalRecord::OrderTransition { order, .. }
                if order.intent == OrderIntent::Exit && order.state == OrderState::Submitted
        )));
        assert!(records.iter().any(|r| matches!(r, JournalRecord::PositionClosed { .. })));
    }

    #[tokio::test]
    async fn test_daily_loss_blocks_entries_but_not_exits() {
        let limits = RiskLimits {
            capital:              10_000.0,
            max_daily_loss_pct:   0.10,
            breaker_drawdown_pct: 0.50,
            ..make_limits()
        };
        let mut harness = start_with(limits, make_strategy(0.10), |events| Arc::new(PaperBroker::new(events)));
        send_tick(&harness, "NIFTY", 100.0).await;
        wait_for(&mut harness, |s| s.portfolio.open_positions == 1).await;

        // 1,100 loss on 10,000: past the 10% daily limit and through the 90 stop.
        send_tick(&harness, "NIFTY", 89.0).await;
        let snap = wait_for(&mut harness, |s| s.closed_positions.len() == 1).await;
        assert!(snap.portfolio.loss_today() >= 1_000.0);
        assert!(snap.breaker.is_none());

        let at = send_tick(&harness, "BANKNIFTY", 100.0).await;
        let snap = wait_for(&mut harness, |s| s.last_tick_at == Some(at)).await;
        assert_eq!(snap.portfolio.open_positions, 0);
        assert_eq!(snap.orders.len(), 2);

        harness.commands.send(ControlCommand::Shutdown).await.unwrap();
        assert_eq!(harness.handle.await.unwrap(), SessionOutcome::Clean);

        let records = drain_journal(&mut harness.journal);
        assert!(records.iter().any(|r| matches!(
            r,
            JournalRecord::RiskDecision { approved: false, reason: Some(RejectReason::DailyLossLimitExceeded { .. }), symbol, .. }
                if symbol == "BANKNIFTY"
        )));
        let approved = records
            .iter()
            .filter(|r| matches!(r, JournalRecord::RiskDecision { approved: true, symbol, .. } if symbol == "NIFTY"))
            .count();
        assert_eq!(approved, 2, "entry and stop-loss exit");
    }

    #[tokio::test]
    async fn test_broker_expiry_is_replaced() {
        let mut harness = start_with(make_limits(), make_strategy(0.5), |events| {
            Arc::new(PaperBroker::new(events).without_fills())
        });
        send_tick(&harness, "NIFTY", 100.0).await;
        let snap = wait_for(&mut harness, |s| s.orders.iter().any(|o| o.state == OrderState::Acknowledged)).await;
        let key = snap.orders[0].key;

        harness.order_events.send(Arrival::now(OrderEvent::Expired { key })).await.unwrap();
        let snap = wait_for(&mut harness, |s| s.orders.len() == 2).await;
        assert_eq!(snap.orders[0].state, OrderState::Expired);
        let replacement = &snap.orders[1];
        assert_eq!(replacement.replaces, Some(key));
        assert_eq!(replacement.signal_id, snap.orders[0].signal_id);
        assert_eq!(replacement.quantity, 100);

        harness.commands.send(ControlCommand::Shutdown).await.unwrap();
        assert_eq!(harness.handle.await.unwrap(), SessionOutcome::Clean);
    }

    #[tokio::test]
    async fn test_shutdown_forces_unconfirmed_cancels() {
        let mut harness = start_with(make_limits(), make_strategy(0.5), |_| Arc::new(StickyBroker));
        send_tick(&harness, "NIFTY", 100.0).await;
        let snap = wait_for(&mut harness, |s| s.orders.iter().any(|o| o.state == OrderState::Acknowledged)).await;
        let key = snap.orders[0].key;

        harness.commands.send(ControlCommand::Shutdown).await.unwrap();
        assert_eq!(harness.handle.await.unwrap(), SessionOutcome::Clean);

        let snap = harness.snapshots.borrow().clone();
        assert!(!snap.running);
        assert_eq!(snap.orders[0].state, OrderState::Cancelled);
        assert_eq!(snap.orders[0].error.as_deref(), Some("ForcedCancelTimeout"));

        let records = drain_journal(&mut harness.journal);
        let expected = format!("order {key}: ForcedCancelTimeout");
        assert!(records.iter().any(|r| matches!(r, JournalRecord::Alert { message } if *message == expected)));
        match records.last() {
            Some(JournalRecord::FinalSnapshot { orders, halted: false, .. }) => {
                assert_eq!(orders.open, 0);
                assert_eq!(orders.total, 1);
            }
            other => panic!("expected final snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_drawdown_trips_breaker_and_blocks_entries() {
        let mut harness = start(make_limits());
        send_tick(&harness, "NIFTY", 100.0).await;
        wait_for(&mut harness, |s| s.portfolio.open_positions == 1).await;

        // 100 × (100 − 40) = 6,000 loss on 100,000 capital: 6% ≥ 5%.
        send_tick(&harness, "NIFTY", 40.0).await;
        let snap = wait_for(&mut harness, |s| s.breaker.is_some()).await;
        assert!(snap.portfolio.halted);

        let at = send_tick(&harness, "BANKNIFTY", 100.0).await;
        wait_for(&mut harness, |s| s.last_tick_at == Some(at)).await;

        harness.commands.send(ControlCommand::Shutdown).await.unwrap();
        assert_eq!(harness.handle.await.unwrap(), SessionOutcome::Halted);

        let records = drain_journal(&mut harness.journal);
        assert!(records.iter().any(|r| matches!(r, JournalRecord::BreakerTripped { .. })));
        assert!(records.iter().any(|r| matches!(
            r,
            JournalRecord::RiskDecision { approved: false, reason: Some(RejectReason::CircuitBreakerTripped), .. }
        )));
        let submitted = records
            .iter()
            .filter(|r| matches!(r, JournalRecord::OrderTransition { order, .. } if order.state == OrderState::Submitted))
            .count();
        assert_eq!(submitted, 1, "nothing reaches the broker after the trip");
    }

    #[tokio::test]
    async fn test_kill_reset_and_reload_commands() {
        let mut harness = start(make_limits());

        let (reply, rx) = oneshot::channel();
        harness.commands.send(ControlCommand::Kill { reason: "operator".into(), reply }).await.unwrap();
        assert_eq!(rx.await.unwrap(), KillReport { tripped: true, cancelled: 0 });
        wait_for(&mut harness, |s| s.breaker.is_some()).await;

        let (reply, rx) = oneshot::channel();
        harness.commands.send(ControlCommand::Reset { reply }).await.unwrap();
        assert!(rx.await.unwrap());
        wait_for(&mut harness, |s| s.breaker.is_none()).await;

        let bad = RiskLimits { max_concurrent_positions: 0, ..make_limits() };
        let (reply, rx) = oneshot::channel();
        harness.commands.send(ControlCommand::ReloadLimits { limits: bad, reply }).await.unwrap();
        assert!(rx.await.unwrap().is_err());

        let good = RiskLimits { max_concurrent_positions: 2, ..make_limits() };
        let (reply, rx) = oneshot::channel();
        harness.commands.send(ControlCommand::ReloadLimits { limits: good, reply }).await.unwrap();
        assert!(rx.await.unwrap().is_ok());
        let snap = wait_for(&mut harness, |s| s.limits.max_concurrent_positions == 2).await;
        assert!(!snap.portfolio.halted);

        harness.commands.send(ControlCommand::Shutdown).await.unwrap();
        assert_eq!(harness.handle.await.unwrap(), SessionOutcome::Clean);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(SessionOutcome::Clean.exit_code(), 0);
        assert_eq!(SessionOutcome::Halted.exit_code(), 2);
    }
}
