//! # strategy
//!
//! Pluggable signal generators. Each strategy owns its indicator state and
//! sees the portfolio only through the snapshot handed to it, so it can be
//! driven by the control loop or by a test without any I/O.

pub mod exit;
pub mod indicators;
pub mod momentum;
pub mod scalping;

use chrono::{DateTime, Utc};

use crate::config::AppConfig;
use crate::models::{PortfolioState, Signal, StrategyId, Tick};

pub use momentum::{Momentum, MomentumConfig};
pub use scalping::{Scalping, ScalpingConfig};

pub trait Strategy: Send {
    fn id(&self) -> &StrategyId;

    /// Lower runs first when signals compete for the same capacity.
    fn priority(&self) -> u32;

    fn on_tick(&mut self, tick: &Tick, portfolio: &PortfolioState) -> Option<Signal>;

    fn on_timer(&mut self, now: DateTime<Utc>, portfolio: &PortfolioState) -> Option<Signal>;

    /// The gatekeeper or broker refused a signal from this strategy.
    fn on_order_rejected(&mut self, _symbol: &str, _reason: &str, _at: DateTime<Utc>) {}
}

/// Every enabled strategy, highest priority first.
pub fn build_strategies(config: &AppConfig) -> Vec<Box<dyn Strategy>> {
    let mut strategies: Vec<Box<dyn Strategy>> = Vec::new();
    if let Some(momentum) = &config.momentum {
        strategies.push(Box::new(Momentum::new(momentum.clone())));
    }
    if let Some(scalping) = &config.scalping {
        strategies.push(Box::new(Scalping::new(scalping.clone())));
    }
    strategies.sort_by_key(|s| s.priority());
    strategies
}
