//! # strategy::scalping
//!
//! **Scalping**: time-driven, quick in and out on short bursts.
//!
//! Ticks only feed the price windows and the stop/target checks. Entry
//! decisions are made on the timer at a fixed cadence (default 5 s):
//!
//! ```text
//! every `interval`
//!     ├─ time exits for owned positions
//!     └─ per instrument (no position, outside re-entry interval)
//!          ├─ price inside [min_price, max_price]
//!          ├─ |momentum over N periods| > threshold (points)
//!          └─ volatility of returns ≥ threshold
//!                → entry, stop in percent, target in points
//! ```

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::{env_bool, env_f64, env_pct, env_u32, env_u64, env_usize};
use crate::error::ConfigError;
use crate::models::{Direction, ExitPlan, ExitRule, PortfolioState, Signal, StrategyId, Tick};
use crate::strategy::exit::{check_exit, exit_signal};
use crate::strategy::indicators::PriceWindow;
use crate::strategy::Strategy;

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ScalpingConfig {
    pub id:                   StrategyId,
    pub priority:             u32,
    /// Cadence of entry evaluation.
    pub interval:             Duration,
    pub momentum_periods:     usize,
    /// Points.
    pub momentum_threshold:   f64,
    pub volatility_window:    usize,
    pub volatility_threshold: f64,
    pub min_price:            f64,
    pub max_price:            f64,
    pub min_entry_interval:   Duration,
    pub max_hold:             Duration,
    pub quantity:             u64,
    pub stop_loss_pct:        f64,
    pub target_points:        f64,
    pub allow_short:          bool,
}

impl Default for ScalpingConfig {
    fn default() -> Self {
        Self {
            id:                   StrategyId::new("scalping"),
            priority:             2,
            interval:             Duration::seconds(5),
            momentum_periods:     5,
            momentum_threshold:   5.0,
            volatility_window:    10,
            volatility_threshold: 0.02,
            min_price:            20.0,
            max_price:            200.0,
            min_entry_interval:   Duration::seconds(60),
            max_hold:             Duration::minutes(15),
            quantity:             25,
            stop_loss_pct:        0.15,
            target_points:        15.0,
            allow_short:          false,
        }
    }
}

impl ScalpingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            id:                   d.id,
            priority:             env_u32("SCALPING_PRIORITY", d.priority)?,
            interval:             Duration::seconds(env_u64("SCALPING_INTERVAL_SECS", 5)? as i64),
            momentum_periods:     env_usize("SCALPING_MOMENTUM_PERIODS", d.momentum_periods)?,
            momentum_threshold:   env_f64("SCALPING_MOMENTUM_POINTS", d.momentum_threshold)?,
            volatility_window:    env_usize("SCALPING_VOLATILITY_WINDOW", d.volatility_window)?,
            volatility_threshold: env_f64("SCALPING_MIN_VOLATILITY", d.volatility_threshold)?,
            min_price:            env_f64("SCALPING_MIN_PRICE", d.min_price)?,
            max_price:            env_f64("SCALPING_MAX_PRICE", d.max_price)?,
            min_entry_interval:   Duration::seconds(env_u64("SCALPING_MIN_ENTRY_INTERVAL_SECS", 60)? as i64),
            max_hold:             Duration::seconds(env_u64("SCALPING_MAX_HOLD_SECS", 15 * 60)? as i64),
            quantity:             env_u64("SCALPING_QUANTITY", d.quantity)?,
            stop_loss_pct:        env_pct("SCALPING_STOP_LOSS_PCT", d.stop_loss_pct)?,
            target_points:        env_f64("SCALPING_TARGET_POINTS", d.target_points)?,
            allow_short:          env_bool("SCALPING_ALLOW_SHORT", d.allow_short)?,
        };
        if config.momentum_periods < 2 || config.volatility_window < 3 {
            return Err(ConfigError::Invalid {
                key:    "SCALPING_MOMENTUM_PERIODS",
                reason: "momentum needs 2+ periods and volatility 3+ prices".into(),
            });
        }
        if config.min_price >= config.max_price {
            return Err(ConfigError::Invalid {
                key:    "SCALPING_MIN_PRICE",
                reason: "must be below SCALPING_MAX_PRICE".into(),
            });
        }
        Ok(config)
    }

    fn plan(&self) -> ExitPlan {
        ExitPlan {
            stop_loss: ExitRule::Percent(self.stop_loss_pct),
            target:    ExitRule::Points(self.target_points),
        }
    }
}

// ─── Per-instrument state ─────────────────────────────────────────────────────

#[derive(Debug)]
struct Instrument {
    prices:     PriceWindow,
    last_entry: Option<DateTime<Utc>>,
}

// ─── Strategy ─────────────────────────────────────────────────────────────────

pub struct Scalping {
    config:      ScalpingConfig,
    instruments: BTreeMap<String, Instrument>,
    last_run:    Option<DateTime<Utc>>,
}

impl Scalping {
    pub fn new(config: ScalpingConfig) -> Self {
        Self {
            config,
            instruments: BTreeMap::new(),
            last_run: None,
        }
    }

    fn entry_for(&self, symbol: &str, inst: &Instrument, now: DateTime<Utc>) -> Option<Signal> {
        let cfg = &self.config;
        if let Some(last) = inst.last_entry {
            if now - last < cfg.min_entry_interval {
                return None;
            }
        }

        let price = inst.prices.last()?;
        if price < cfg.min_price || price > cfg.max_price {
            return None;
        }

        let momentum = inst.prices.momentum(cfg.momentum_periods)?;
        if momentum.abs() <= cfg.momentum_threshold {
            return None;
        }

        let volatility = inst.prices.volatility(cfg.volatility_window)?;
        if volatility < cfg.volatility_threshold {
            return None;
        }

        let direction = if momentum > 0.0 {
            Direction::Buy
        } else if cfg.allow_short {
            Direction::Sell
        } else {
            return None;
        };

        debug!(symbol, momentum, volatility, %direction, "⚡ Scalping entry");
        Some(Signal::entry(
            cfg.id.clone(),
            symbol,
            direction,
            cfg.quantity,
            price,
            cfg.plan(),
            format!("scalp: momentum {momentum:+.2} pts, volatility {volatility:.4}"),
            now,
        ))
    }
}

impl Strategy for Scalping {
    fn id(&self) -> &StrategyId {
        &self.config.id
    }

    fn priority(&self) -> u32 {
        self.config.priority
    }

    fn on_tick(&mut self, tick: &Tick, portfolio: &PortfolioState) -> Option<Signal> {
        let capacity = (self.config.momentum_periods.max(self.config.volatility_window)) * 5;
        self.instruments
            .entry(tick.symbol.clone())
            .or_insert_with(|| Instrument {
                prices:     PriceWindow::new(capacity),
                last_entry: None,
            })
            .prices
            .push(tick.ltp);

        let position = portfolio.position(&tick.symbol, &self.config.id)?;
        let reason = check_exit(position, tick.ltp, tick.time, self.config.max_hold)?;
        exit_signal(position, tick.ltp, reason, tick.time)
    }

    fn on_timer(&mut self, now: DateTime<Utc>, portfolio: &PortfolioState) -> Option<Signal> {
        if let Some(last) = self.last_run {
            if now - last < self.config.interval {
                return None;
            }
        }
        self.last_run = Some(now);

        // Time exits first; stops and targets are handled on ticks.
        for position in portfolio.positions_for(&self.config.id) {
            if let Some(reason) = check_exit(position, position.mark_price, now, self.config.max_hold) {
                return exit_signal(position, position.mark_price, reason, now);
            }
        }

        let candidate = self
            .instruments
            .iter()
            .filter(|(symbol, _)| portfolio.position(symbol, &self.config.id).is_none())
            .find_map(|(symbol, inst)| self.entry_for(symbol, inst, now));

        if let Some(signal) = &candidate {
            if let Some(inst) = self.instruments.get_mut(&signal.symbol) {
                inst.last_entry = Some(now);
            }
        }
        candidate
    }

    fn on_order_rejected(&mut self, symbol: &str, reason: &str, at: DateTime<Utc>) {
        debug!(symbol, reason, "Scalping backing off after rejection");
        if let Some(inst) = self.instruments.get_mut(symbol) {
            inst.last_entry = Some(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::models::{ExitReason, Position, PositionKey, SignalKind};

    const BURST: [f64; 10] = [100.0, 108.0, 104.0, 112.0, 108.0, 116.0, 112.0, 120.0, 116.0, 124.0];

    fn empty_portfolio() -> PortfolioState {
        Ledger::new(100_000.0, Utc::now().date_naive()).snapshot(Utc::now())
    }

    fn feed(strategy: &mut Scalping, symbol: &str, prices: &[f64], portfolio: &PortfolioState) {
        for &p in prices {
            assert!(strategy.on_tick(&Tick::new(symbol, p, Utc::now()), portfolio).is_none());
        }
    }

    #[test]
    fn test_entry_on_timer_after_burst() {
        let mut strategy = Scalping::new(ScalpingConfig::default());
        let portfolio = empty_portfolio();
        feed(&mut strategy, "NIFTY24OCT25000CE", &BURST, &portfolio);

        let signal = strategy.on_timer(Utc::now(), &portfolio).expect("entry expected");
        assert_eq!(signal.direction, Direction::Buy);
        assert_eq!(signal.quantity, 25);
        assert_eq!(signal.reference_price, 124.0);
        assert_eq!(
            signal.kind,
            SignalKind::Entry {
                plan: ExitPlan { stop_loss: ExitRule::Percent(0.15), target: ExitRule::Points(15.0) }
            }
        );
    }

    #[test]
    fn test_cadence_and_reentry_interval() {
        let mut strategy = Scalping::new(ScalpingConfig::default());
        let portfolio = empty_portfolio();
        feed(&mut strategy, "NIFTY24OCT25000CE", &BURST, &portfolio);

        let now = Utc::now();
        assert!(strategy.on_timer(now, &portfolio).is_some());
        // Inside the 5 s cadence: nothing is evaluated.
        assert!(strategy.on_timer(now + Duration::seconds(2), &portfolio).is_none());
        // Past cadence but inside the 60 s re-entry interval.
        assert!(strategy.on_timer(now + Duration::seconds(10), &portfolio).is_none());
        assert!(strategy.on_timer(now + Duration::seconds(70), &portfolio).is_some());
    }

    #[test]
    fn test_price_band_and_flat_market() {
        let mut strategy = Scalping::new(ScalpingConfig::default());
        let portfolio = empty_portfolio();
        let expensive: Vec<f64> = BURST.iter().map(|p| p * 3.0).collect();
        feed(&mut strategy, "EXPENSIVE", &expensive, &portfolio);
        feed(&mut strategy, "FLAT", &[100.0; 10], &portfolio);
        assert!(strategy.on_timer(Utc::now(), &portfolio).is_none());
    }

    #[test]
    fn test_downward_burst_needs_shorting() {
        let falling: Vec<f64> = BURST.iter().map(|p| 230.0 - p).collect();
        let portfolio = empty_portfolio();

        let mut long_only = Scalping::new(ScalpingConfig::default());
        feed(&mut long_only, "X", &falling, &portfolio);
        assert!(long_only.on_timer(Utc::now(), &portfolio).is_none());

        let mut shorting = Scalping::new(ScalpingConfig { allow_short: true, ..ScalpingConfig::default() });
        feed(&mut shorting, "X", &falling, &portfolio);
        let signal = shorting.on_timer(Utc::now(), &portfolio).expect("short entry");
        assert_eq!(signal.direction, Direction::Sell);
    }

    #[test]
    fn test_stop_loss_tick_emits_exit() {
        let mut strategy = Scalping::new(ScalpingConfig::default());
        let mut portfolio = empty_portfolio();
        let key = PositionKey::new("NIFTY", StrategyId::new("scalping"));
        let plan = ScalpingConfig::default().plan();
        portfolio.positions.push(Position::open(&key, 25, 100.0, Some(plan), Utc::now()));
        portfolio.open_positions = 1;

        assert!(strategy.on_tick(&Tick::new("NIFTY", 90.0, Utc::now()), &portfolio).is_none());
        let exit = strategy
            .on_tick(&Tick::new("NIFTY", 85.0, Utc::now()), &portfolio)
            .expect("stop-loss exit");
        assert_eq!(exit.kind, SignalKind::Exit { reason: ExitReason::StopLoss });
        assert_eq!(exit.direction, Direction::Sell);
        assert_eq!(exit.quantity, 25);
    }

    #[test]
    fn test_time_exit_on_timer() {
        let mut strategy = Scalping::new(ScalpingConfig::default());
        let mut portfolio = empty_portfolio();
        let key = PositionKey::new("NIFTY", StrategyId::new("scalping"));
        let opened = Utc::now() - Duration::minutes(20);
        portfolio.positions.push(Position::open(&key, 25, 100.0, Some(ScalpingConfig::default().plan()), opened));
        portfolio.open_positions = 1;

        let exit = strategy.on_timer(Utc::now(), &portfolio).expect("time exit");
        assert_eq!(exit.kind, SignalKind::Exit { reason: ExitReason::TimeExit });
    }

    #[test]
    fn test_rejection_restarts_interval() {
        let mut strategy = Scalping::new(ScalpingConfig::default());
        let portfolio = empty_portfolio();
        feed(&mut strategy, "NIFTY24OCT25000CE", &BURST, &portfolio);
        let now = Utc::now();
        strategy.on_order_rejected("NIFTY24OCT25000CE", "margin", now);
        assert!(strategy.on_timer(now + Duration::seconds(30), &portfolio).is_none());
    }
}
