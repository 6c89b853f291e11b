//! # routes::monitor
//!
//! Read-only dashboard endpoints. Everything here is served from the latest
//! [`SessionSnapshot`](crate::engine::SessionSnapshot); nothing waits on the
//! control loop.
//!
//! | Method    | Path                    | Description                              |
//! |-----------|-------------------------|------------------------------------------|
//! | GET (WS)  | `/ws/monitor`           | snapshot on connect, then live events    |
//! | GET       | `/api/monitor/snapshot` | portfolio, orders, breaker, limits       |
//! | GET       | `/api/monitor/orders`   | orders, filterable                       |

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::models::{Order, StrategyId};
use crate::state::SharedState;

// ─── WebSocket ────────────────────────────────────────────────────────────────

pub async fn ws_monitor(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    // Subscribe before reading the snapshot so nothing falls in between.
    let mut rx = state.broadcast_tx.subscribe();
    let (mut sender, mut receiver) = socket.split();

    info!("🔌 WebSocket client connected");

    let snapshot = json!({
        "event":    "SNAPSHOT",
        "snapshot": state.snapshot(),
    })
    .to_string();
    if sender.send(Message::Text(snapshot)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if sender.send(Message::Text(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("WS client lagged, skipped {n} events");
                    }
                    Err(_) => break,
                }
            }

            result = receiver.next() => {
                match result {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sender.send(Message::Pong(data)).await;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("🔌 WebSocket client disconnected");
}

// ─── REST ─────────────────────────────────────────────────────────────────────

/// GET /api/monitor/snapshot
pub async fn get_snapshot(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "ok":       true,
        "snapshot": state.snapshot(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct OrderFilter {
    pub strategy: Option<String>,
    pub symbol:   Option<String>,
    /// Only orders that can still change.
    #[serde(default)]
    pub live:     bool,
}

impl OrderFilter {
    fn matches(&self, order: &Order) -> bool {
        self.strategy.as_deref().map_or(true, |s| order.strategy_id == StrategyId::new(s))
            && self.symbol.as_deref().map_or(true, |s| order.symbol == s)
            && (!self.live || order.is_live())
    }
}

/// GET /api/monitor/orders?strategy=momentum&symbol=NIFTY&live=true
pub async fn get_orders(
    State(state): State<SharedState>,
    Query(filter): Query<OrderFilter>,
) -> impl IntoResponse {
    let snapshot = state.snapshot();
    let orders: Vec<&Order> = snapshot.orders.iter().filter(|o| filter.matches(o)).collect();
    Json(json!({
        "ok":      true,
        "count":   orders.len(),
        "summary": snapshot.order_summary,
        "orders":  orders,
    }))
}
