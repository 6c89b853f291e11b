//! # error
//!
//! Error taxonomy for the control core plus the HTTP-facing [`AppError`].
//!
//! | Type                    | Scope                         | Handling                               |
//! |-------------------------|-------------------------------|----------------------------------------|
//! | [`FeedError`]           | market data                   | retried by the feed runner             |
//! | [`ReconciliationError`] | one order                     | logged + alert, session continues      |
//! | [`SubmissionError`]     | one submission attempt        | bounded retry, then terminal `Rejected`|
//! | [`CircuitBreakerTrip`]  | session                       | entries halted until operator reset    |
//! | [`ConfigError`]         | startup                       | exit code 1                            |
//!
//! Risk rejections are not errors; see `risk::RejectReason`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::models::IdempotencyKey;

// ─── HTTP ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AppError {
    /// The request payload was syntactically correct but semantically invalid.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The control loop is gone (shutting down) or not accepting input.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Catch-all for unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {err}"),
            ),
        };

        let body = Json(json!({
            "ok":    false,
            "error": message,
        }));

        (status, body).into_response()
    }
}

// ─── Market data ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FeedError {
    #[error("feed disconnected: {0}")]
    Disconnected(String),

    #[error("feed read timed out")]
    Timeout,

    #[error("malformed tick: {0}")]
    Malformed(String),

    /// The source has ended for good; the runner stops.
    #[error("feed closed")]
    Closed,
}

impl FeedError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, FeedError::Closed)
    }
}

// ─── Reconciliation ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationError {
    /// Fill for a key the ledger never had registered.
    #[error("fill for unknown order {key}")]
    UnknownOrder { key: IdempotencyKey },

    /// Fill would take the order past its quantity.
    #[error("overfill on {key}: {filled} already filled + {incoming} > {ordered}")]
    Overfill {
        key:      IdempotencyKey,
        ordered:  u64,
        filled:   u64,
        incoming: u64,
    },

    #[error("invalid fill on {key}: {reason}")]
    InvalidFill { key: IdempotencyKey, reason: String },
}

// ─── Submission ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubmissionError {
    /// Broker refused the order. Terminal, never retried.
    #[error("rejected by broker: {0}")]
    Rejected(String),

    /// Network or broker-side transient failure. Retried with the same key.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Emergency stop observed between retries.
    #[error("submission aborted by stop signal")]
    Aborted,
}

impl SubmissionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmissionError::Transport(_))
    }
}

// ─── Circuit breaker ──────────────────────────────────────────────────────────

/// Session-level halt. Blocks every signal until an operator reset.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[error("circuit breaker tripped: {reason} (drawdown {drawdown:.4})")]
pub struct CircuitBreakerTrip {
    pub reason:   String,
    pub drawdown: f64,
    pub at:       DateTime<Utc>,
}

// ─── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}")]
    Unparsable { key: &'static str, value: String },

    #[error("{key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
