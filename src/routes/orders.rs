//! # routes::orders
//!
//! | Method | Path                       | Description                  |
//! |--------|----------------------------|------------------------------|
//! | GET    | `/api/orders/:key`         | one order by idempotency key |
//! | POST   | `/api/orders/:key/cancel`  | operator cancel              |

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;

use crate::engine::{CancelOutcome, ControlCommand};
use crate::error::AppError;
use crate::models::IdempotencyKey;
use crate::state::SharedState;

fn parse_key(raw: &str) -> Result<IdempotencyKey, AppError> {
    raw.parse()
        .map_err(|e| AppError::BadRequest(format!("invalid order key {raw:?}: {e}")))
}

/// GET /api/orders/:key
pub async fn get_order(
    State(state): State<SharedState>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let key = parse_key(&raw)?;
    let snapshot = state.snapshot();
    let order = snapshot
        .orders
        .into_iter()
        .find(|o| o.key == key)
        .ok_or_else(|| AppError::NotFound(format!("order {key}")))?;

    Ok(Json(json!({ "ok": true, "order": order })))
}

/// POST /api/orders/:key/cancel
pub async fn cancel_order(
    State(state): State<SharedState>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let key = parse_key(&raw)?;
    let outcome = state
        .command(|reply| ControlCommand::CancelOrder { key, reply })
        .await?;

    let (outcome, order_state) = match outcome {
        CancelOutcome::Unknown => return Err(AppError::NotFound(format!("order {key}"))),
        CancelOutcome::CancelledLocally => ("CANCELLED_LOCALLY", None),
        CancelOutcome::Requested => ("REQUESTED", None),
        CancelOutcome::AlreadyRequested => ("ALREADY_REQUESTED", None),
        CancelOutcome::AlreadyTerminal(s) => ("ALREADY_TERMINAL", Some(s)),
    };

    Ok(Json(json!({
        "ok":      true,
        "key":     key,
        "outcome": outcome,
        "state":   order_state,
    })))
}
