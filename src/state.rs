//! # state
//!
//! Shared state injected into every axum handler.
//!
//! Handlers never touch the ledger or the orders directly. Reads come from the
//! latest [`SessionSnapshot`] published by the control loop; writes travel as
//! messages:
//!
//! | Handle         | Goes to                                       |
//! |----------------|-----------------------------------------------|
//! | `feed_tx`      | push feed → feed runner → control loop        |
//! | `order_events` | control loop (broker status callbacks)        |
//! | `commands`     | control loop, answered over a oneshot         |
//! | `broadcast_tx` | every `/ws/monitor` client                    |

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::engine::{Arrival, ControlCommand, SessionSnapshot};
use crate::error::AppError;
use crate::events::WsEvent;
use crate::models::{OrderEvent, Tick};

pub struct AppState {
    pub snapshot_rx:  watch::Receiver<SessionSnapshot>,
    pub commands:     mpsc::Sender<ControlCommand>,
    pub feed_tx:      mpsc::Sender<Tick>,
    pub order_events: mpsc::Sender<Arrival<OrderEvent>>,
    /// Pre-serialized JSON so receivers need no `Clone` on event types.
    pub broadcast_tx: broadcast::Sender<String>,
    pub started_at:   DateTime<Utc>,
    pub tick_count:   AtomicU64,
}

impl AppState {
    pub fn new(
        snapshot_rx: watch::Receiver<SessionSnapshot>,
        commands: mpsc::Sender<ControlCommand>,
        feed_tx: mpsc::Sender<Tick>,
        order_events: mpsc::Sender<Arrival<OrderEvent>>,
        broadcast_tx: broadcast::Sender<String>,
    ) -> Self {
        Self {
            snapshot_rx,
            commands,
            feed_tx,
            order_events,
            broadcast_tx,
            started_at: Utc::now(),
            tick_count: AtomicU64::new(0),
        }
    }

    /// Latest published snapshot (owned copy).
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn broadcast(&self, event: &WsEvent) {
        // No subscribers is not an error.
        let _ = self.broadcast_tx.send(event.to_json());
    }

    /// Adds `n` accepted ticks; returns the running total.
    pub fn count_ticks(&self, n: u64) -> u64 {
        self.tick_count.fetch_add(n, Ordering::Relaxed) + n
    }

    /// Sends a command built around a fresh reply channel and waits for the answer.
    pub async fn command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControlCommand,
    ) -> Result<T, AppError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| AppError::Unavailable("control loop stopped".into()))?;
        rx.await
            .map_err(|_| AppError::Unavailable("control loop stopped before replying".into()))
    }
}

pub type SharedState = Arc<AppState>;
