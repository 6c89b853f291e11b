//! # strategy::momentum
//!
//! **Momentum**: tick-driven trend follower.
//!
//! An entry needs every filter to agree on the latest tick:
//! 1. |momentum over `lookback` ticks| > threshold (points)
//! 2. trend strength |momentum| / price > `min_trend_strength_pct`
//! 3. SMA(short) above SMA(long) for longs, below for shorts
//! 4. `rsi_lower` < RSI < `rsi_upper`
//! 5. volatility of returns > `min_volatility`
//! 6. cooldown since the last signal on the instrument elapsed
//!
//! Open positions exit on momentum reversal (against the position by more
//! than half the threshold), then stop-loss, target and holding time.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::config::{env_bool, env_f64, env_pct, env_u32, env_u64, env_usize};
use crate::error::ConfigError;
use crate::models::{
    Direction, ExitPlan, ExitReason, ExitRule, PortfolioState, Position, Signal, StrategyId, Tick,
};
use crate::strategy::exit::{check_exit, exit_signal};
use crate::strategy::indicators::PriceWindow;
use crate::strategy::Strategy;

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MomentumConfig {
    pub id:                     StrategyId,
    pub priority:               u32,
    pub sma_short:              usize,
    pub sma_long:               usize,
    pub rsi_period:             usize,
    pub rsi_lower:              f64,
    pub rsi_upper:              f64,
    pub lookback:               usize,
    /// Points.
    pub momentum_threshold:     f64,
    /// Percent of price, e.g. `0.5` = 0.5%.
    pub min_trend_strength_pct: f64,
    pub volatility_window:      usize,
    pub min_volatility:         f64,
    /// Ticks required before any entry is considered.
    pub min_history:            usize,
    pub cooldown:               Duration,
    pub max_hold:               Duration,
    pub quantity:               u64,
    pub stop_loss_pct:          f64,
    pub target_pct:             f64,
    pub allow_short:            bool,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        Self {
            id:                     StrategyId::new("momentum"),
            priority:               1,
            sma_short:              5,
            sma_long:               20,
            rsi_period:             14,
            rsi_lower:              30.0,
            rsi_upper:              70.0,
            lookback:               10,
            momentum_threshold:     10.0,
            min_trend_strength_pct: 0.5,
            volatility_window:      20,
            min_volatility:         0.01,
            min_history:            30,
            cooldown:               Duration::seconds(300),
            max_hold:               Duration::hours(2),
            quantity:               50,
            stop_loss_pct:          0.25,
            target_pct:             0.50,
            allow_short:            false,
        }
    }
}

impl MomentumConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            id:                     d.id,
            priority:               env_u32("MOMENTUM_PRIORITY", d.priority)?,
            sma_short:              env_usize("MOMENTUM_SMA_SHORT", d.sma_short)?,
            sma_long:               env_usize("MOMENTUM_SMA_LONG", d.sma_long)?,
            rsi_period:             env_usize("MOMENTUM_RSI_PERIOD", d.rsi_period)?,
            rsi_lower:              env_f64("MOMENTUM_RSI_LOWER", d.rsi_lower)?,
            rsi_upper:              env_f64("MOMENTUM_RSI_UPPER", d.rsi_upper)?,
            lookback:               env_usize("MOMENTUM_LOOKBACK", d.lookback)?,
            momentum_threshold:     env_f64("MOMENTUM_THRESHOLD_POINTS", d.momentum_threshold)?,
            min_trend_strength_pct: env_f64("MOMENTUM_MIN_TREND_PCT", d.min_trend_strength_pct)?,
            volatility_window:      env_usize("MOMENTUM_VOLATILITY_WINDOW", d.volatility_window)?,
            min_volatility:         env_f64("MOMENTUM_MIN_VOLATILITY", d.min_volatility)?,
            min_history:            env_usize("MOMENTUM_MIN_HISTORY", d.min_history)?,
            cooldown:               Duration::seconds(env_u64("MOMENTUM_COOLDOWN_SECS", d.cooldown.num_seconds() as u64)? as i64),
            max_hold:               Duration::seconds(env_u64("MOMENTUM_MAX_HOLD_SECS", d.max_hold.num_seconds() as u64)? as i64),
            quantity:               env_u64("MOMENTUM_QUANTITY", d.quantity)?,
            stop_loss_pct:          env_pct("MOMENTUM_STOP_LOSS_PCT", d.stop_loss_pct)?,
            target_pct:             env_pct("MOMENTUM_TARGET_PCT", d.target_pct)?,
            allow_short:            env_bool("MOMENTUM_ALLOW_SHORT", d.allow_short)?,
        };
        if config.sma_short == 0 || config.sma_short >= config.sma_long {
            return Err(ConfigError::Invalid {
                key:    "MOMENTUM_SMA_SHORT",
                reason: "must be positive and below MOMENTUM_SMA_LONG".into(),
            });
        }
        if config.rsi_lower >= config.rsi_upper {
            return Err(ConfigError::Invalid {
                key:    "MOMENTUM_RSI_LOWER",
                reason: "must be below MOMENTUM_RSI_UPPER".into(),
            });
        }
        Ok(config)
    }

    fn plan(&self) -> ExitPlan {
        ExitPlan {
            stop_loss: ExitRule::Percent(self.stop_loss_pct),
            target:    ExitRule::Percent(self.target_pct),
        }
    }

    fn window_capacity(&self) -> usize {
        [self.min_history, self.sma_long, self.rsi_period + 1, self.lookback, self.volatility_window]
            .into_iter()
            .max()
            .unwrap_or(self.min_history)
            .max(1)
            * 2
    }
}

// ─── Per-instrument state ─────────────────────────────────────────────────────

#[derive(Debug)]
struct Instrument {
    prices:      PriceWindow,
    last_signal: Option<DateTime<Utc>>,
}

// ─── Strategy ─────────────────────────────────────────────────────────────────

pub struct Momentum {
    config:      MomentumConfig,
    instruments: HashMap<String, Instrument>,
}

impl Momentum {
    pub fn new(config: MomentumConfig) -> Self {
        Self {
            config,
            instruments: HashMap::new(),
        }
    }

    fn manage_position(&self, position: &Position, inst: &Instrument, tick: &Tick) -> Option<Signal> {
        let cfg = &self.config;
        if let (Some(momentum), Some(side)) = (inst.prices.momentum(cfg.lookback), position.side()) {
            let against = -(side.sign() as f64) * momentum;
            if against > cfg.momentum_threshold / 2.0 {
                return exit_signal(position, tick.ltp, ExitReason::MomentumReversal, tick.time);
            }
        }
        let reason = check_exit(position, tick.ltp, tick.time, cfg.max_hold)?;
        exit_signal(position, tick.ltp, reason, tick.time)
    }

    fn entry_for(&self, inst: &Instrument, tick: &Tick) -> Option<Signal> {
        let cfg = &self.config;
        if !inst.prices.holds(cfg.min_history) {
            return None;
        }
        if let Some(last) = inst.last_signal {
            if tick.time - last < cfg.cooldown {
                return None;
            }
        }

        let price = tick.ltp;
        let momentum = inst.prices.momentum(cfg.lookback)?;
        let strength_pct = momentum.abs() / price * 100.0;
        if momentum.abs() <= cfg.momentum_threshold || strength_pct <= cfg.min_trend_strength_pct {
            return None;
        }

        let short = inst.prices.sma(cfg.sma_short)?;
        let long = inst.prices.sma(cfg.sma_long)?;
        let aligned = if momentum > 0.0 { short > long } else { short < long };
        if !aligned {
            return None;
        }

        let rsi = inst.prices.rsi(cfg.rsi_period)?;
        if rsi <= cfg.rsi_lower || rsi >= cfg.rsi_upper {
            return None;
        }

        let volatility = inst.prices.volatility(cfg.volatility_window)?;
        if volatility <= cfg.min_volatility {
            return None;
        }

        let direction = if momentum > 0.0 {
            Direction::Buy
        } else if cfg.allow_short {
            Direction::Sell
        } else {
            return None;
        };

        debug!(
            symbol = %tick.symbol,
            momentum,
            strength_pct,
            rsi,
            volatility,
            %direction,
            "📈 Momentum entry"
        );
        Some(Signal::entry(
            cfg.id.clone(),
            tick.symbol.clone(),
            direction,
            cfg.quantity,
            price,
            cfg.plan(),
            format!(
                "momentum {momentum:+.2} pts ({strength_pct:.2}%), SMA {short:.2}/{long:.2}, RSI {rsi:.1}"
            ),
            tick.time,
        ))
    }
}

impl Strategy for Momentum {
    fn id(&self) -> &StrategyId {
        &self.config.id
    }

    fn priority(&self) -> u32 {
        self.config.priority
    }

    fn on_tick(&mut self, tick: &Tick, portfolio: &PortfolioState) -> Option<Signal> {
        let capacity = self.config.window_capacity();
        self.instruments
            .entry(tick.symbol.clone())
            .or_insert_with(|| Instrument {
                prices:      PriceWindow::new(capacity),
                last_signal: None,
            })
            .prices
            .push(tick.ltp);

        let inst = self.instruments.get(&tick.symbol)?;
        if let Some(position) = portfolio.position(&tick.symbol, &self.config.id) {
            return self.manage_position(position, inst, tick);
        }

        let signal = self.entry_for(inst, tick)?;
        if let Some(inst) = self.instruments.get_mut(&tick.symbol) {
            inst.last_signal = Some(tick.time);
        }
        Some(signal)
    }

    /// Holding-time exits for instruments that stopped ticking.
    fn on_timer(&mut self, now: DateTime<Utc>, portfolio: &PortfolioState) -> Option<Signal> {
        portfolio
            .positions_for(&self.config.id)
            .find(|p| now - p.opened_at > self.config.max_hold)
            .and_then(|p| exit_signal(p, p.mark_price, ExitReason::TimeExit, now))
    }

    fn on_order_rejected(&mut self, symbol: &str, reason: &str, at: DateTime<Utc>) {
        debug!(symbol, reason, "Momentum cooling down after rejection");
        if let Some(inst) = self.instruments.get_mut(symbol) {
            inst.last_signal = Some(at);
        }
    }
}
