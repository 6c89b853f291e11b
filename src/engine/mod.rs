pub mod breaker;
pub mod control;
pub mod executor;
pub mod merge;
pub mod orders;

pub use breaker::CircuitBreaker;
pub use control::{
    ControlCommand, ControlConfig, ControlLoop, KillReport, LoopInputs, LoopOutputs, LoopSettings,
    SessionOutcome, SessionSnapshot,
};
pub use executor::Executor;
pub use merge::{Arrival, EventMerger, LoopEvent};
pub use orders::{CancelOutcome, OrderCommand, OrderConfig, OrderManager, OrderUpdate, ReplaceOutcome};
