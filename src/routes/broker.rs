//! # routes::broker
//!
//! Status callback for the HTTP broker bridge. The bridge posts
//! acknowledgments, fills, rejections, cancels and expiries keyed by the
//! idempotency key it received on submission.
//!
//! `SUBMISSION_FAILED` and `CANCEL_FAILED` describe our side of the wire and
//! are refused here.

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use tracing::debug;

use crate::engine::Arrival;
use crate::error::AppError;
use crate::models::OrderEvent;
use crate::state::SharedState;

/// POST /api/broker/events
///
/// ```json
/// { "type": "FILL", "key": "…uuid…",
///   "fill": { "fill_id": "F-1", "quantity": 25, "price": 112.5, "time": "2024-10-21T04:00:00Z" } }
/// ```
pub async fn order_event(
    State(state): State<SharedState>,
    Json(event): Json<OrderEvent>,
) -> Result<impl IntoResponse, AppError> {
    if matches!(event, OrderEvent::SubmissionFailed { .. } | OrderEvent::CancelFailed { .. }) {
        return Err(AppError::BadRequest("event type is not accepted from the broker".into()));
    }

    let key = event.key();
    debug!(%key, "📨 Broker event received");
    state
        .order_events
        .send(Arrival::now(event))
        .await
        .map_err(|_| AppError::Unavailable("control loop stopped".into()))?;

    Ok(Json(json!({ "ok": true, "key": key })))
}

#[cfg(test)]
mod tests {
    use crate::models::{IdempotencyKey, OrderEvent};
    use crate::routes::build_router;
    use crate::routes::testing::*;
    use axum::http::StatusCode;
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_fill_is_forwarded_to_the_loop() {
        let mut fixture = make_fixture();
        let key = IdempotencyKey::generate();
        let body = json!({
            "type": "FILL",
            "key":  key,
            "fill": { "fill_id": "F-1", "quantity": 25, "price": 112.5, "time": "2024-10-21T04:00:00Z" }
        });
        let response = build_router(fixture.state.clone())
            .oneshot(json_request("POST", "/api/broker/events", body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let arrival = fixture.order_events.try_recv().unwrap();
        assert!(matches!(arrival.item, OrderEvent::Fill { key: k, ref fill } if k == key && fill.quantity == 25));
    }

    #[tokio::test]
    async fn test_internal_event_types_are_refused() {
        let mut fixture = make_fixture();
        let body = json!({
            "type":     "SUBMISSION_FAILED",
            "key":      IdempotencyKey::generate(),
            "attempts": 3,
            "error":    "spoofed"
        });
        let response = build_router(fixture.state.clone())
            .oneshot(json_request("POST", "/api/broker/events", body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(fixture.order_events.try_recv().is_err());
    }
}
