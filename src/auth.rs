//! # auth: API key middleware
//!
//! - `API_KEY` unset or empty: every request passes (dev mode)
//! - `API_KEY` set: every request needs `X-API-Key: <key>`
//!
//! `/health` is always open.
//!
//! ```bash
//! curl -H "X-API-Key: $API_KEY" -X POST http://localhost:3000/api/risk/kill
//! ```

use axum::{
    body::Body,
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

pub const API_KEY_HEADER: &str = "X-API-Key";

/// Read at request time so the key can be rotated without a restart.
pub async fn require_api_key(request: Request<Body>, next: Next) -> Response {
    let expected = std::env::var("API_KEY").unwrap_or_default();
    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    if is_authorized(&expected, request.uri().path(), provided) {
        next.run(request).await
    } else {
        let path = request.uri().path().to_string();
        warn!(%path, has_key = provided.is_some(), "❌ Rejected request without a valid API key");
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "ok":    false,
                "error": format!("{API_KEY_HEADER} header missing or wrong"),
                "hint":  "every route except /health needs the value of API_KEY",
            })),
        )
            .into_response()
    }
}

fn is_authorized(expected: &str, path: &str, provided: Option<&str>) -> bool {
    expected.is_empty() || path == "/health" || provided == Some(expected)
}
