//! # broker::http
//!
//! Order submission to an HTTP broker bridge.
//!
//! ## Bridge contract
//! `POST {base}/orders` with header `Idempotency-Key: <uuid>` and body
//! [`OrderRequest`]; answers
//! ```json
//! { "accepted": true, "broker_order_id": "B-1029", "reason": null }
//! ```
//! `DELETE {base}/orders/{key}` cancels. Fills and later status changes are
//! posted back to `POST /api/broker/events`.
//!
//! 4xx answers are refusals and are never retried; 408, 429, 5xx and
//! network errors are transport failures.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerAck};
use crate::error::SubmissionError;
use crate::models::{Direction, IdempotencyKey, Order, OrderType};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct OrderRequest<'a> {
    pub idempotency_key: IdempotencyKey,
    pub symbol:          &'a str,
    pub side:            Direction,
    pub quantity:        u64,
    pub order_type:      OrderType,
    pub price:           f64,
    pub strategy_id:     &'a str,
}

impl<'a> From<&'a Order> for OrderRequest<'a> {
    fn from(order: &'a Order) -> Self {
        Self {
            idempotency_key: order.key,
            symbol:          &order.symbol,
            side:            order.side,
            quantity:        order.quantity,
            order_type:      order.order_type,
            price:           order.price,
            strategy_id:     order.strategy_id.as_str(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OrderResponse {
    pub accepted:        bool,
    pub broker_order_id: Option<String>,
    pub reason:          Option<String>,
}

// ─── Client ───────────────────────────────────────────────────────────────────

pub struct HttpBroker {
    client:   reqwest::Client,
    base_url: String,
}

impl HttpBroker {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn classify(status: StatusCode, body: String) -> SubmissionError {
        let retryable = status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS;
        if retryable {
            SubmissionError::Transport(format!("HTTP {status}: {body}"))
        } else {
            SubmissionError::Rejected(format!("HTTP {status}: {body}"))
        }
    }
}

#[async_trait]
impl Broker for HttpBroker {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn submit(&self, order: &Order) -> Result<BrokerAck, SubmissionError> {
        let url = format!("{}/orders", self.base_url);

        info!(
            key    = %order.key,
            symbol = %order.symbol,
            side   = %order.side,
            qty    = order.quantity,
            price  = order.price,
            url    = %url,
            "🚀 [BROKER] Sending order"
        );

        let response = self
            .client
            .post(&url)
            // retries reuse the key; the bridge dedups on it
            .header(IDEMPOTENCY_HEADER, order.key.to_string())
            .json(&OrderRequest::from(order))
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Broker unreachable");
                SubmissionError::Transport(format!("broker unreachable: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(http_status = %status, body = %body, "Broker returned HTTP error");
            return Err(Self::classify(status, body));
        }

        let parsed: OrderResponse = response.json().await.map_err(|e| {
            error!(error = %e, "Broker response parse failed");
            SubmissionError::Transport(format!("broker response parse error: {e}"))
        })?;

        match (parsed.accepted, parsed.broker_order_id) {
            (true, Some(broker_order_id)) => {
                info!(key = %order.key, %broker_order_id, "✅ [BROKER] Order accepted");
                Ok(BrokerAck { broker_order_id })
            }
            (true, None) => Err(SubmissionError::Transport(
                "broker accepted without an order id".into(),
            )),
            (false, _) => Err(SubmissionError::Rejected(
                parsed.reason.unwrap_or_else(|| "rejected without reason".into()),
            )),
        }
    }

    async fn cancel(&self, key: IdempotencyKey) -> Result<(), SubmissionError> {
        let url = format!("{}/orders/{key}", self.base_url);
        let response = self
            .client
            .delete(&url)
            .header(IDEMPOTENCY_HEADER, key.to_string())
            .send()
            .await
            .map_err(|e| SubmissionError::Transport(format!("broker unreachable: {e}")))?;

        if response.status().is_success() {
            info!(%key, "🛑 [BROKER] Cancel confirmed");
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(Self::classify(status, body))
    }
}
