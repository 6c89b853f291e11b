//! Domain models shared across the trading control core.

pub mod order;
pub mod position;
pub mod signal;
pub mod tick;

pub use order::{
    Fill, IdempotencyKey, Order, OrderEvent, OrderIntent, OrderState, OrderSummary, OrderType,
};
pub use position::{ClosedPosition, PendingEntry, PortfolioState, Position, PositionKey, StrategyStats};
pub use signal::{Direction, ExitPlan, ExitReason, ExitRule, Signal, SignalKind, StrategyId};
pub use tick::Tick;
