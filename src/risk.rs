//! # risk: Risk Gatekeeper
//!
//! Last line before an order exists. Every signal passes through
//! [`Gatekeeper::evaluate`], which is pure relative to its inputs.
//!
//! ## Entry checks (first failure wins)
//! 1. **Circuit breaker**        halted session rejects everything
//! 2. **Sanity**                 quantity > 0, finite positive price
//! 3. **Trading window**         exchange hours, weekdays only
//! 4. **Daily loss**             realized + unrealized loss vs limit
//! 5. **Trades per day**         filled + live entries vs limit
//! 6. **One per key**            (instrument, strategy) already open or pending
//! 7. **Concurrent positions**   open + pending vs limit
//! 8. **Per-trade notional cap** quantity × reference price vs capital × pct
//! 9. **Per-trade risk cap**     loss at stop vs capital × pct
//! 10. **Stop bounds**           stop-loss percent within [min, max]
//! 11. **Aggregate exposure**    open + pending + proposed vs aggregate cap
//!
//! Exits skip 3..=11: they fail only on a halted session or when there is no
//! position to close.
//!
//! Caps are fractions of the portfolio's capital, which the ledger compounds
//! at every day rollover. `RiskLimits::capital` only seeds the first day.

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

use crate::config::{env_bool, env_f64, env_parse, env_pct, env_u32, env_usize};
use crate::error::ConfigError;
use crate::models::{
    Direction, PendingEntry, PortfolioState, PositionKey, Signal, SignalKind, StrategyId,
};

// ─── Trading window ───────────────────────────────────────────────────────────

/// Exchange session at a fixed UTC offset (IST = +330 minutes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingWindow {
    pub open:              NaiveTime,
    pub close:             NaiveTime,
    pub utc_offset_minutes: i32,
}

impl TradingWindow {
    pub fn from_env() -> Result<Self, ConfigError> {
        let open = parse_time("MARKET_OPEN", "09:15")?;
        let close = parse_time("MARKET_CLOSE", "15:30")?;
        let utc_offset_minutes = env_parse("MARKET_UTC_OFFSET_MIN", 330i32)?;
        if close <= open {
            return Err(ConfigError::Invalid {
                key:    "MARKET_CLOSE",
                reason: "must be after MARKET_OPEN".into(),
            });
        }
        if utc_offset_minutes.abs() >= 24 * 60 {
            return Err(ConfigError::Invalid {
                key:    "MARKET_UTC_OFFSET_MIN",
                reason: "offset out of range".into(),
            });
        }
        Ok(Self { open, close, utc_offset_minutes })
    }

    /// `true` on weekdays between open and close (inclusive), local time.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let Some(offset) = FixedOffset::east_opt(self.utc_offset_minutes * 60) else {
            return false;
        };
        let local = at.with_timezone(&offset);
        let weekday = !matches!(local.weekday(), Weekday::Sat | Weekday::Sun);
        let time = local.time();
        weekday && time >= self.open && time <= self.close
    }
}

fn parse_time(key: &'static str, default: &str) -> Result<NaiveTime, ConfigError> {
    let raw = crate::config::env_string(key, default);
    NaiveTime::parse_from_str(&raw, "%H:%M").map_err(|_| ConfigError::Unparsable { key, value: raw })
}

// ─── Limits ───────────────────────────────────────────────────────────────────

/// Risk configuration. Read-only once loaded; a reload replaces it whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Opening capital of the session.
    pub capital:                  f64,
    /// Max notional of a single position as a fraction of capital.
    pub max_position_pct:         f64,
    /// Max loss at the stop for a single trade as a fraction of capital.
    pub risk_per_trade_pct:       f64,
    pub max_daily_loss_pct:       f64,
    pub max_concurrent_positions: usize,
    pub min_stop_pct:             f64,
    pub max_stop_pct:             f64,
    /// 0 = unlimited.
    pub max_trades_per_day:       u32,
    pub breaker_drawdown_pct:     f64,
    pub trading_window:           Option<TradingWindow>,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            capital:                  100_000.0,
            max_position_pct:         0.10,
            risk_per_trade_pct:       0.02,
            max_daily_loss_pct:       0.10,
            max_concurrent_positions: 5,
            min_stop_pct:             0.01,
            max_stop_pct:             0.30,
            max_trades_per_day:       10,
            breaker_drawdown_pct:     0.20,
            trading_window:           None,
        }
    }
}

impl RiskLimits {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let limits = Self {
            capital:                  env_f64("CAPITAL", defaults.capital)?,
            max_position_pct:         env_pct("RISK_MAX_POSITION_PCT", defaults.max_position_pct)?,
            risk_per_trade_pct:       env_pct("RISK_PER_TRADE_PCT", defaults.risk_per_trade_pct)?,
            max_daily_loss_pct:       env_pct("RISK_MAX_DAILY_LOSS_PCT", defaults.max_daily_loss_pct)?,
            max_concurrent_positions: env_usize("RISK_MAX_CONCURRENT", defaults.max_concurrent_positions)?,
            min_stop_pct:             env_pct("RISK_MIN_STOP_PCT", defaults.min_stop_pct)?,
            max_stop_pct:             env_pct("RISK_MAX_STOP_PCT", defaults.max_stop_pct)?,
            max_trades_per_day:       env_u32("RISK_MAX_TRADES_PER_DAY", defaults.max_trades_per_day)?,
            breaker_drawdown_pct:     env_pct("BREAKER_DRAWDOWN_PCT", defaults.breaker_drawdown_pct)?,
            trading_window:           if env_bool("MARKET_HOURS_ENABLED", true)? {
                Some(TradingWindow::from_env()?)
            } else {
                None
            },
        };
        limits.validate()?;
        Ok(limits)
    }

    /// Cross-field invariants; also applied to operator reloads.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.capital.is_finite() && self.capital > 0.0) {
            return Err(ConfigError::Invalid { key: "CAPITAL", reason: "must be positive".into() });
        }
        if self.max_concurrent_positions == 0 {
            return Err(ConfigError::Invalid {
                key:    "RISK_MAX_CONCURRENT",
                reason: "must allow at least one position".into(),
            });
        }
        let fractions = [
            ("RISK_MAX_POSITION_PCT", self.max_position_pct),
            ("RISK_PER_TRADE_PCT", self.risk_per_trade_pct),
            ("RISK_MAX_DAILY_LOSS_PCT", self.max_daily_loss_pct),
            ("RISK_MIN_STOP_PCT", self.min_stop_pct),
            ("RISK_MAX_STOP_PCT", self.max_stop_pct),
            ("BREAKER_DRAWDOWN_PCT", self.breaker_drawdown_pct),
        ];
        for (key, value) in fractions {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Invalid { key, reason: format!("{value} is not in (0, 1]") });
            }
        }
        if self.min_stop_pct > self.max_stop_pct {
            return Err(ConfigError::Invalid {
                key:    "RISK_MIN_STOP_PCT",
                reason: "greater than RISK_MAX_STOP_PCT".into(),
            });
        }
        Ok(())
    }

    #[inline]
    pub fn per_position_cap(&self, capital: f64) -> f64 {
        capital * self.max_position_pct
    }

    #[inline]
    pub fn per_trade_risk_cap(&self, capital: f64) -> f64 {
        capital * self.risk_per_trade_pct
    }

    #[inline]
    pub fn daily_loss_cap(&self, capital: f64) -> f64 {
        capital * self.max_daily_loss_pct
    }

    /// capital × max position % × max concurrent positions.
    #[inline]
    pub fn aggregate_cap(&self, capital: f64) -> f64 {
        self.per_position_cap(capital) * self.max_concurrent_positions as f64
    }
}

// ─── Decision ─────────────────────────────────────────────────────────────────

/// Why the gatekeeper refused a signal. An expected outcome, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    CircuitBreakerTripped,
    InvalidSignal { detail: String },
    OutsideTradingWindow,
    DailyLossLimitExceeded { loss: f64, limit: f64 },
    MaxTradesPerDay { count: u32, limit: u32 },
    PositionAlreadyOpen,
    MaxConcurrentPositions { open: usize, limit: usize },
    PerTradeCapExceeded { notional: f64, cap: f64 },
    PerTradeRiskExceeded { risk: f64, cap: f64 },
    StopLossOutOfBounds { stop_pct: f64, min: f64, max: f64 },
    AggregateExposureExceeded { projected: f64, cap: f64 },
    DuplicateInstrumentExposure,
    NoPositionToExit,
    /// An exit order for the position is already live.
    ExitAlreadyPending,
    /// Replacement re-check: price moved too far from the signal.
    PriceDrifted { reference: f64, current: f64 },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::CircuitBreakerTripped => write!(f, "circuit breaker tripped"),
            RejectReason::InvalidSignal { detail } => write!(f, "invalid signal: {detail}"),
            RejectReason::OutsideTradingWindow => write!(f, "outside trading window"),
            RejectReason::DailyLossLimitExceeded { loss, limit } => {
                write!(f, "daily loss {loss:.2} >= limit {limit:.2}")
            }
            RejectReason::MaxTradesPerDay { count, limit } => {
                write!(f, "daily trade limit reached: {count}/{limit}")
            }
            RejectReason::PositionAlreadyOpen => write!(f, "position already open for strategy"),
            RejectReason::MaxConcurrentPositions { open, limit } => {
                write!(f, "concurrent positions {open}/{limit}")
            }
            RejectReason::PerTradeCapExceeded { notional, cap } => {
                write!(f, "notional {notional:.2} > per-trade cap {cap:.2}")
            }
            RejectReason::PerTradeRiskExceeded { risk, cap } => {
                write!(f, "risk at stop {risk:.2} > per-trade risk cap {cap:.2}")
            }
            RejectReason::StopLossOutOfBounds { stop_pct, min, max } => {
                write!(f, "stop {stop_pct:.4} outside [{min:.4}, {max:.4}]")
            }
            RejectReason::AggregateExposureExceeded { projected, cap } => {
                write!(f, "aggregate exposure {projected:.2} > cap {cap:.2}")
            }
            RejectReason::DuplicateInstrumentExposure => {
                write!(f, "instrument already approved this cycle")
            }
            RejectReason::NoPositionToExit => write!(f, "no position to exit"),
            RejectReason::ExitAlreadyPending => write!(f, "exit order already live"),
            RejectReason::PriceDrifted { reference, current } => {
                write!(f, "price drifted from {reference:.2} to {current:.2}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Approved,
    Rejected(RejectReason),
}

impl RiskDecision {
    #[inline]
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskDecision::Approved)
    }
}

// ─── Gatekeeper ───────────────────────────────────────────────────────────────

pub struct Gatekeeper;

impl Gatekeeper {
    /// Evaluates one signal against a portfolio copy and the active limits.
    pub fn evaluate(signal: &Signal, state: &PortfolioState, limits: &RiskLimits) -> RiskDecision {
        match Self::check(signal, state, limits, false) {
            Ok(()) => RiskDecision::Approved,
            Err(reason) => RiskDecision::Rejected(reason),
        }
    }

    /// Re-check for the remainder of an expired order.
    ///
    /// The trade was already counted against the daily limit, and a partial
    /// fill may already have opened the position it is topping up, so
    /// checks 5 and 6 are skipped and 7 only applies when nothing is open yet.
    pub fn evaluate_replacement(
        signal: &Signal,
        state: &PortfolioState,
        limits: &RiskLimits,
    ) -> RiskDecision {
        match Self::check(signal, state, limits, true) {
            Ok(()) => RiskDecision::Approved,
            Err(reason) => RiskDecision::Rejected(reason),
        }
    }

    fn check(
        signal: &Signal,
        state: &PortfolioState,
        limits: &RiskLimits,
        replacement: bool,
    ) -> Result<(), RejectReason> {
        // [1] Circuit breaker
        if state.halted {
            return Err(RejectReason::CircuitBreakerTripped);
        }

        // [2] Sanity
        if signal.quantity == 0 || !signal.reference_price.is_finite() || signal.reference_price <= 0.0 {
            return Err(RejectReason::InvalidSignal {
                detail: format!("quantity {} at {}", signal.quantity, signal.reference_price),
            });
        }

        let plan = match signal.kind {
            SignalKind::Exit { .. } => return Self::check_exit(signal, state),
            SignalKind::Entry { plan } => plan,
        };

        // [3] Trading window
        if let Some(window) = &limits.trading_window {
            if !window.contains(signal.created_at) {
                return Err(RejectReason::OutsideTradingWindow);
            }
        }

        let capital = state.capital;

        // [4] Daily loss
        let loss = state.loss_today();
        let limit = limits.daily_loss_cap(capital);
        if loss >= limit {
            return Err(RejectReason::DailyLossLimitExceeded { loss, limit });
        }

        let has_position = state.position(&signal.symbol, &signal.strategy_id).is_some();

        // [5] Trades per day
        let committed = state.committed_trades();
        if !replacement && limits.max_trades_per_day > 0 && committed >= limits.max_trades_per_day {
            return Err(RejectReason::MaxTradesPerDay {
                count: committed,
                limit: limits.max_trades_per_day,
            });
        }

        // [6] One position per (instrument, strategy)
        if !replacement
            && (has_position || state.has_pending_entry(&signal.symbol, &signal.strategy_id))
        {
            return Err(RejectReason::PositionAlreadyOpen);
        }

        // [7] Concurrent positions
        let open = state.committed_positions();
        if !(replacement && has_position) && open >= limits.max_concurrent_positions {
            return Err(RejectReason::MaxConcurrentPositions {
                open,
                limit: limits.max_concurrent_positions,
            });
        }

        // [8] Per-trade notional cap
        let notional = signal.notional();
        let cap = limits.per_position_cap(capital);
        if notional > cap {
            return Err(RejectReason::PerTradeCapExceeded { notional, cap });
        }

        // [9] Per-trade risk cap
        let stop_pct = plan.stop_loss.as_fraction(signal.reference_price);
        let risk = notional * stop_pct;
        let cap = limits.per_trade_risk_cap(capital);
        if risk > cap {
            return Err(RejectReason::PerTradeRiskExceeded { risk, cap });
        }

        // [10] Stop bounds
        if stop_pct < limits.min_stop_pct || stop_pct > limits.max_stop_pct {
            return Err(RejectReason::StopLossOutOfBounds {
                stop_pct,
                min: limits.min_stop_pct,
                max: limits.max_stop_pct,
            });
        }

        // [11] Aggregate exposure
        let projected = state.open_notional + state.pending_notional() + notional;
        let cap = limits.aggregate_cap(capital);
        if projected > cap {
            return Err(RejectReason::AggregateExposureExceeded { projected, cap });
        }

        Ok(())
    }

    fn check_exit(signal: &Signal, state: &PortfolioState) -> Result<(), RejectReason> {
        let Some(position) = state.position(&signal.symbol, &signal.strategy_id) else {
            return Err(RejectReason::NoPositionToExit);
        };
        // An exit must trade against the position.
        if position.side() != Some(signal.direction.opposite()) {
            return Err(RejectReason::NoPositionToExit);
        }
        if signal.quantity > position.quantity.unsigned_abs() {
            return Err(RejectReason::InvalidSignal {
                detail: format!(
                    "exit quantity {} exceeds position {}",
                    signal.quantity,
                    position.quantity.unsigned_abs()
                ),
            });
        }
        Ok(())
    }

    /// Evaluates one cycle's signals in a deterministic order.
    ///
    /// Exits come first, then strategies by ascending `priority`, stable by
    /// arrival. Each approval is folded into the working state so later
    /// signals in the same cycle see it.
    pub fn evaluate_cycle(
        mut signals: Vec<Signal>,
        state: &PortfolioState,
        limits: &RiskLimits,
        priority: impl Fn(&StrategyId) -> u32,
    ) -> Vec<(Signal, RiskDecision)> {
        signals.sort_by_key(|s| (!s.is_exit(), priority(&s.strategy_id)));

        let mut working = state.clone();
        let mut entered: HashSet<String> = HashSet::new();
        let mut exiting: HashSet<PositionKey> = HashSet::new();
        let mut decisions = Vec::with_capacity(signals.len());

        for signal in signals {
            let decision = if signal.is_exit() {
                let key = PositionKey::new(signal.symbol.clone(), signal.strategy_id.clone());
                let decision = Self::evaluate(&signal, &working, limits);
                if decision.is_approved() && !exiting.insert(key) {
                    RiskDecision::Rejected(RejectReason::ExitAlreadyPending)
                } else {
                    decision
                }
            } else if !working.halted && entered.contains(&signal.symbol) {
                RiskDecision::Rejected(RejectReason::DuplicateInstrumentExposure)
            } else {
                let decision = Self::evaluate(&signal, &working, limits);
                if decision.is_approved() {
                    entered.insert(signal.symbol.clone());
                    working.pending_entries.push(PendingEntry {
                        symbol:           signal.symbol.clone(),
                        strategy_id:      signal.strategy_id.clone(),
                        notional:         signal.notional(),
                        partially_filled: false,
                    });
                }
                decision
            };

            if let RiskDecision::Rejected(reason) = &decision {
                debug!(
                    symbol   = %signal.symbol,
                    strategy = %signal.strategy_id,
                    %reason,
                    "Signal rejected"
                );
            }
            decisions.push((signal, decision));
        }

        decisions
    }
}

/// Direction check used by strategies and the replacement path alike.
pub fn adverse_move(side: Direction, reference: f64, current: f64) -> f64 {
    match side {
        Direction::Buy => (current - reference) / reference,
        Direction::Sell => (reference - current) / reference,
    }
}
