//! # engine::breaker
//!
//! Drawdown circuit breaker. Two states: armed or tripped. It trips on
//! drawdown ≥ threshold or on an operator kill, and only an explicit operator
//! reset re-arms it. There is no automatic recovery.

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::error::CircuitBreakerTrip;

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: f64,
    trip:      Option<CircuitBreakerTrip>,
}

impl CircuitBreaker {
    pub fn new(threshold: f64) -> Self {
        Self { threshold, trip: None }
    }

    #[inline]
    pub fn is_tripped(&self) -> bool {
        self.trip.is_some()
    }

    pub fn trip_info(&self) -> Option<&CircuitBreakerTrip> {
        self.trip.as_ref()
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Takes effect on the next check.
    pub fn set_threshold(&mut self, threshold: f64) {
        self.threshold = threshold;
    }

    /// Returns the trip when this check is the one that trips the breaker.
    pub fn check(&mut self, drawdown: f64, now: DateTime<Utc>) -> Option<CircuitBreakerTrip> {
        if self.is_tripped() || drawdown < self.threshold {
            return None;
        }
        let reason = format!(
            "drawdown {:.2}% reached threshold {:.2}%",
            drawdown * 100.0,
            self.threshold * 100.0
        );
        self.trip_with(reason, drawdown, now)
    }

    /// Operator kill. `None` when already tripped.
    pub fn trip_manual(
        &mut self,
        reason: impl Into<String>,
        drawdown: f64,
        now: DateTime<Utc>,
    ) -> Option<CircuitBreakerTrip> {
        if self.is_tripped() {
            return None;
        }
        self.trip_with(reason.into(), drawdown, now)
    }

    fn trip_with(&mut self, reason: String, drawdown: f64, now: DateTime<Utc>) -> Option<CircuitBreakerTrip> {
        let trip = CircuitBreakerTrip { reason, drawdown, at: now };
        error!(reason = %trip.reason, drawdown, "🛑 CIRCUIT BREAKER TRIPPED: trading halted");
        self.trip = Some(trip.clone());
        Some(trip)
    }

    /// Re-arms. Returns `false` when it was not tripped.
    pub fn reset(&mut self) -> bool {
        match self.trip.take() {
            Some(trip) => {
                info!(reason = %trip.reason, "🟢 Circuit breaker reset by operator");
                true
            }
            None => false,
        }
    }
}
