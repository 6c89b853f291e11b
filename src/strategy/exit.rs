//! # strategy::exit
//!
//! Exit rules shared by every strategy: stop-loss, target and maximum holding
//! time, checked in that order.

use chrono::{DateTime, Duration, Utc};

use crate::models::{ExitReason, Position, Signal};

/// First exit condition the position meets at `price`, if any.
pub fn check_exit(
    position: &Position,
    price: f64,
    now: DateTime<Utc>,
    max_hold: Duration,
) -> Option<ExitReason> {
    if position.stop_breached(price) {
        return Some(ExitReason::StopLoss);
    }
    if position.target_reached(price) {
        return Some(ExitReason::TargetHit);
    }
    if now - position.opened_at > max_hold {
        return Some(ExitReason::TimeExit);
    }
    None
}

/// Exit signal that flattens `position` at `price`.
pub fn exit_signal(position: &Position, price: f64, reason: ExitReason, now: DateTime<Utc>) -> Option<Signal> {
    let side = position.side()?;
    Some(Signal::exit(
        position.strategy_id.clone(),
        position.symbol.clone(),
        side.opposite(),
        position.quantity.unsigned_abs(),
        price,
        reason,
        now,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, ExitPlan, ExitRule, PositionKey, StrategyId};

    fn make_position(opened_at: DateTime<Utc>) -> Position {
        let key = PositionKey::new("NIFTY", StrategyId::new("scalping"));
        let plan = ExitPlan { stop_loss: ExitRule::Percent(0.15), target: ExitRule::Points(15.0) };
        Position::open(&key, 25, 100.0, Some(plan), opened_at)
    }

    #[test]
    fn test_stop_beats_time() {
        let opened = Utc::now() - Duration::hours(1);
        let pos = make_position(opened);
        let now = Utc::now();
        assert_eq!(check_exit(&pos, 85.0, now, Duration::minutes(15)), Some(ExitReason::StopLoss));
        assert_eq!(check_exit(&pos, 100.0, now, Duration::minutes(15)), Some(ExitReason::TimeExit));
        assert_eq!(check_exit(&pos, 115.0, now, Duration::hours(2)), Some(ExitReason::TargetHit));
        assert_eq!(check_exit(&pos, 100.0, now, Duration::hours(2)), None);
    }

    #[test]
    fn test_exit_signal_flattens() {
        let pos = make_position(Utc::now());
        let signal = exit_signal(&pos, 85.0, ExitReason::StopLoss, Utc::now()).unwrap();
        assert_eq!(signal.direction, Direction::Sell);
        assert_eq!(signal.quantity, 25);
        assert!(signal.is_exit());
    }
}
