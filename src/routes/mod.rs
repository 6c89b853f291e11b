//! # routes
//!
//! HTTP surface. Every handler is a thin adapter over [`SharedState`]: it
//! forwards input to the control loop or reads the latest snapshot, and holds
//! no trading logic of its own.
//!
//! | Method    | Path                        | Handler                      |
//! |-----------|-----------------------------|------------------------------|
//! | GET       | `/health`                   | liveness, no auth            |
//! | POST      | `/api/feed/tick`            | [`feed::push_tick`]          |
//! | POST      | `/api/broker/events`        | [`broker::order_event`]      |
//! | GET       | `/api/monitor/snapshot`     | [`monitor::get_snapshot`]    |
//! | GET       | `/api/monitor/orders`       | [`monitor::get_orders`]      |
//! | GET (WS)  | `/ws/monitor`               | [`monitor::ws_monitor`]      |
//! | POST      | `/api/risk/kill`            | [`risk::kill`]               |
//! | POST      | `/api/risk/reset`           | [`risk::reset`]              |
//! | PUT       | `/api/risk/limits`          | [`risk::reload_limits`]      |
//! | GET       | `/api/risk/status`          | [`risk::status`]             |
//! | POST      | `/api/risk/shutdown`        | [`risk::shutdown`]           |
//! | GET       | `/api/orders/:key`          | [`orders::get_order`]        |
//! | POST      | `/api/orders/:key/cancel`   | [`orders::cancel_order`]     |

pub mod broker;
pub mod feed;
pub mod monitor;
pub mod orders;
pub mod risk;

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use std::sync::atomic::Ordering;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::auth::require_api_key;
use crate::state::SharedState;

pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health",                  get(health))
        // ── Inputs ────────────────────────────────────────────────────────────
        .route("/api/feed/tick",           post(feed::push_tick))
        .route("/api/broker/events",       post(broker::order_event))
        // ── Dashboard ─────────────────────────────────────────────────────────
        .route("/api/monitor/snapshot",    get(monitor::get_snapshot))
        .route("/api/monitor/orders",      get(monitor::get_orders))
        .route("/ws/monitor",              get(monitor::ws_monitor))
        // ── Operator ──────────────────────────────────────────────────────────
        .route("/api/risk/kill",           post(risk::kill))
        .route("/api/risk/reset",          post(risk::reset))
        .route("/api/risk/limits",         put(risk::reload_limits))
        .route("/api/risk/status",         get(risk::status))
        .route("/api/risk/shutdown",       post(risk::shutdown))
        .route("/api/orders/:key",         get(orders::get_order))
        .route("/api/orders/:key/cancel",  post(orders::cancel_order))
        // ── Middleware ────────────────────────────────────────────────────────
        .layer(axum::middleware::from_fn(require_api_key))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// GET /health
pub async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let snapshot = state.snapshot();
    Json(json!({
        "ok":             true,
        "running":        snapshot.running,
        "halted":         snapshot.breaker.is_some(),
        "uptime_secs":    (Utc::now() - state.started_at).num_seconds(),
        "ticks_received": state.tick_count.load(Ordering::Relaxed),
    }))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Router fixtures: a state whose channels end in receivers the test owns.

    use axum::body::Body;
    use axum::http::{Request, Response};
    use chrono::Utc;
    use std::sync::Arc;
    use tokio::sync::{broadcast, mpsc, watch};

    use crate::engine::{Arrival, ControlCommand, SessionSnapshot};
    use crate::models::{OrderEvent, Tick};
    use crate::state::{AppState, SharedState};

    pub struct Fixture {
        pub state:        SharedState,
        pub snapshot_tx:  watch::Sender<SessionSnapshot>,
        pub commands:     mpsc::Receiver<ControlCommand>,
        pub ticks:        mpsc::Receiver<Tick>,
        pub order_events: mpsc::Receiver<Arrival<OrderEvent>>,
    }

    pub fn make_fixture() -> Fixture {
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::empty(Utc::now()));
        let (command_tx, commands) = mpsc::channel(8);
        let (feed_tx, ticks) = mpsc::channel(8);
        let (order_tx, order_events) = mpsc::channel(8);
        let (broadcast_tx, _) = broadcast::channel(16);
        let state = Arc::new(AppState::new(snapshot_rx, command_tx, feed_tx, order_tx, broadcast_tx));
        Fixture { state, snapshot_tx, commands, ticks, order_events }
    }

    pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    pub async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}
