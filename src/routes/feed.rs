//! # routes::feed
//!
//! Push ingress for market data. The external feed adapter posts ticks here;
//! they go to the feed runner through a bounded channel.

use axum::{extract::State, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::AppError;
use crate::models::Tick;
use crate::state::SharedState;

/// One tick or a batch, applied in array order.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum TickBody {
    One(Tick),
    Batch(Vec<Tick>),
}

/// POST /api/feed/tick
///
/// ```json
/// { "symbol": "NIFTY24OCT25000CE", "ltp": 112.5, "time": "2024-10-21T04:00:00Z" }
/// ```
pub async fn push_tick(
    State(state): State<SharedState>,
    Json(body): Json<TickBody>,
) -> Result<impl IntoResponse, AppError> {
    let ticks = match body {
        TickBody::One(tick) => vec![tick],
        TickBody::Batch(ticks) => ticks,
    };
    if let Some(bad) = ticks.iter().find(|t| !t.is_valid()) {
        return Err(AppError::BadRequest(format!(
            "invalid tick for {}: ltp {}",
            bad.symbol, bad.ltp
        )));
    }

    let accepted = ticks.len();
    for tick in ticks {
        state
            .feed_tx
            .send(tick)
            .await
            .map_err(|_| AppError::Unavailable("feed runner stopped".into()))?;
    }
    let total = state.count_ticks(accepted as u64);
    debug!(accepted, total, "Ticks accepted");

    Ok(Json(json!({
        "ok":       true,
        "accepted": accepted,
    })))
}

#[cfg(test)]
mod tests {
    use crate::routes::build_router;
    use crate::routes::testing::*;
    use axum::http::StatusCode;
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_tick_reaches_feed_channel() {
        let mut fixture = make_fixture();
        let body = json!({ "symbol": "NIFTY", "ltp": 101.5, "time": "2024-10-21T04:00:00Z" });
        let response = build_router(fixture.state.clone())
            .oneshot(json_request("POST", "/api/feed/tick", body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["accepted"], 1);
        let tick = fixture.ticks.try_recv().unwrap();
        assert_eq!(tick.symbol, "NIFTY");
        assert_eq!(tick.ltp, 101.5);
    }

    #[tokio::test]
    async fn test_batch_with_bad_price_is_refused_whole() {
        let mut fixture = make_fixture();
        let body = json!([
            { "symbol": "NIFTY", "ltp": 101.5, "time": "2024-10-21T04:00:00Z" },
            { "symbol": "NIFTY", "ltp": -1.0, "time": "2024-10-21T04:00:01Z" }
        ]);
        let response = build_router(fixture.state.clone())
            .oneshot(json_request("POST", "/api/feed/tick", body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["ok"], false);
        assert!(fixture.ticks.try_recv().is_err());
    }
}
