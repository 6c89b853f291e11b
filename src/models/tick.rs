//! # models::tick
//!
//! Defines [`Tick`], the point-in-time market observation produced by the
//! external feed and consumed by every strategy.
//!
//! Ticks are immutable once built; the control loop hands out shared
//! references only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single market observation for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Instrument identifier, e.g. `"NIFTY24OCT25000CE"`.
    pub symbol: String,

    /// Last traded price.
    pub ltp: f64,

    /// Best bid. Feeds that only publish LTP may omit it.
    #[serde(default)]
    pub bid: Option<f64>,

    /// Best ask.
    #[serde(default)]
    pub ask: Option<f64>,

    /// Volume traded at this tick (may be 0 for quote-only updates).
    #[serde(default)]
    pub volume: f64,

    /// UTC timestamp assigned by the exchange or feed.
    pub time: DateTime<Utc>,
}

impl Tick {
    pub fn new(symbol: impl Into<String>, ltp: f64, time: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            ltp,
            bid: None,
            ask: None,
            volume: 0.0,
            time,
        }
    }

    /// Mid price when both sides of the book are known, LTP otherwise.
    #[inline]
    pub fn mid(&self) -> f64 {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) if bid > 0.0 && ask > 0.0 => (bid + ask) / 2.0,
            _ => self.ltp,
        }
    }

    /// A tick is usable when its price is finite and positive.
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.symbol.is_empty() && self.ltp.is_finite() && self.ltp > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mid_falls_back_to_ltp() {
        let mut tick = Tick::new("NIFTY", 100.0, Utc::now());
        assert_eq!(tick.mid(), 100.0);

        tick.bid = Some(99.0);
        tick.ask = Some(101.0);
        assert_eq!(tick.mid(), 100.0);

        tick.ask = Some(0.0);
        assert_eq!(tick.mid(), 100.0);
    }

    #[test]
    fn test_rejects_non_positive_prices() {
        assert!(!Tick::new("NIFTY", 0.0, Utc::now()).is_valid());
        assert!(!Tick::new("NIFTY", f64::NAN, Utc::now()).is_valid());
        assert!(!Tick::new("", 10.0, Utc::now()).is_valid());
        assert!(Tick::new("NIFTY", 10.0, Utc::now()).is_valid());
    }
}
