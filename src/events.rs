//! # events
//!
//! [`WsEvent`]: everything the session broadcasts to dashboard clients on
//! `/ws/monitor`.
//!
//! Events travel over a `tokio::sync::broadcast::Sender<String>` as
//! pre-serialized JSON, so slow clients never hold up the control loop.

use serde::Serialize;
use uuid::Uuid;

use crate::error::{CircuitBreakerTrip, ReconciliationError};
use crate::models::{ClosedPosition, Order, OrderState, Position, Signal, StrategyId};
use crate::risk::{RejectReason, RiskLimits};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WsEvent {
    /// A strategy produced a signal (before gating).
    SignalEmitted { signal: Box<Signal> },

    SignalRejected {
        signal_id:   Uuid,
        strategy_id: StrategyId,
        symbol:      String,
        reason:      RejectReason,
    },

    OrderUpdated { order: Box<Order>, from: OrderState },

    PositionUpdated { position: Box<Position> },

    PositionClosed { closed: Box<ClosedPosition> },

    ReconciliationFailed { error: ReconciliationError },

    BreakerTripped { trip: CircuitBreakerTrip },

    BreakerReset,

    LimitsReloaded { limits: Box<RiskLimits> },

    /// No tick for longer than the configured staleness window.
    FeedStale { silent_secs: u64 },

    FeedRecovered,

    Alert { level: AlertLevel, message: String },

    SessionEnded { halted: bool },
}

impl WsEvent {
    #[inline]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"event":"SERIALIZATION_ERROR"}"#.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tag_is_screaming_snake() {
        let json = WsEvent::FeedStale { silent_secs: 31 }.to_json();
        assert_eq!(json, r#"{"event":"FEED_STALE","silent_secs":31}"#);

        let json = WsEvent::Alert { level: AlertLevel::Critical, message: "x".into() }.to_json();
        assert!(json.contains(r#""level":"CRITICAL""#));
    }
}
