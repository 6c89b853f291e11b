//! # routes::risk
//!
//! Operator controls.
//!
//! | Method | Path                  | Description                                   |
//! |--------|-----------------------|-----------------------------------------------|
//! | POST   | `/api/risk/kill`      | trip the breaker, cancel every open order     |
//! | POST   | `/api/risk/reset`     | re-arm the breaker                            |
//! | PUT    | `/api/risk/limits`    | replace the risk limits                       |
//! | GET    | `/api/risk/status`    | breaker, limits and drawdown                  |
//! | POST   | `/api/risk/shutdown`  | graceful shutdown                             |

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::engine::ControlCommand;
use crate::error::AppError;
use crate::events::{AlertLevel, WsEvent};
use crate::risk::RiskLimits;
use crate::state::SharedState;

#[derive(Deserialize)]
pub struct KillBody {
    pub reason: Option<String>,
}

/// POST /api/risk/kill
pub async fn kill(
    State(state): State<SharedState>,
    Json(body): Json<Option<KillBody>>,
) -> Result<impl IntoResponse, AppError> {
    let reason = body
        .and_then(|b| b.reason)
        .unwrap_or_else(|| "Manual kill via API".to_string());
    warn!(%reason, "🛑 Kill requested");

    let report = state
        .command(|reply| ControlCommand::Kill { reason: reason.clone(), reply })
        .await?;

    Ok((StatusCode::OK, Json(json!({
        "ok":        true,
        "tripped":   report.tripped,
        "cancelled": report.cancelled,
        "message":   format!("Kill switch activated: {reason}"),
    }))))
}

/// POST /api/risk/reset
pub async fn reset(State(state): State<SharedState>) -> Result<impl IntoResponse, AppError> {
    let reset = state.command(|reply| ControlCommand::Reset { reply }).await?;
    let message = if reset {
        "Breaker re-armed, trading enabled"
    } else {
        "Breaker was not tripped"
    };
    Ok(Json(json!({
        "ok":      true,
        "reset":   reset,
        "message": message,
    })))
}

/// PUT /api/risk/limits
///
/// The whole [`RiskLimits`] object; partial updates are not supported.
pub async fn reload_limits(
    State(state): State<SharedState>,
    Json(limits): Json<RiskLimits>,
) -> Result<impl IntoResponse, AppError> {
    state
        .command(|reply| ControlCommand::ReloadLimits { limits: limits.clone(), reply })
        .await?
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    Ok(Json(json!({ "ok": true, "limits": limits })))
}

/// GET /api/risk/status
pub async fn status(State(state): State<SharedState>) -> impl IntoResponse {
    let snapshot = state.snapshot();
    Json(json!({
        "ok": true,
        "risk": {
            "halted":       snapshot.breaker.is_some(),
            "breaker":      snapshot.breaker,
            "drawdown":     snapshot.portfolio.drawdown,
            "equity":       snapshot.portfolio.equity,
            "peak_equity":  snapshot.portfolio.peak_equity,
            "loss_today":   snapshot.portfolio.loss_today(),
            "trades_today": snapshot.portfolio.trades_today,
            "limits":       snapshot.limits,
        },
    }))
}

/// POST /api/risk/shutdown
pub async fn shutdown(State(state): State<SharedState>) -> Result<impl IntoResponse, AppError> {
    state
        .commands
        .send(ControlCommand::Shutdown)
        .await
        .map_err(|_| AppError::Unavailable("control loop stopped".into()))?;
    warn!("Shutdown requested via API");
    state.broadcast(&WsEvent::Alert {
        level:   AlertLevel::Warning,
        message: "shutdown requested by operator".into(),
    });

    Ok((StatusCode::ACCEPTED, Json(json!({
        "ok":      true,
        "message": "Shutting down: cancelling open orders and draining",
    }))))
}
