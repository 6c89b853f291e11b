//! # broker
//!
//! The order-submission sink. The control core talks to a broker only through
//! [`Broker`]; status and fills flow back asynchronously as
//! [`OrderEvent`](crate::models::OrderEvent)s keyed by idempotency key.
//!
//! | Mode    | Implementation        | Status stream                          |
//! |---------|-----------------------|----------------------------------------|
//! | `paper` | [`paper::PaperBroker`]| pushed in-process on submit            |
//! | `http`  | [`http::HttpBroker`]  | `POST /api/broker/events` callbacks    |

pub mod http;
pub mod paper;

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::{env_string, env_u64};
use crate::engine::merge::Arrival;
use crate::error::{ConfigError, SubmissionError};
use crate::models::{IdempotencyKey, Order, OrderEvent};

pub use http::HttpBroker;
pub use paper::PaperBroker;

// ─── Trait ────────────────────────────────────────────────────────────────────

/// Broker accepted the order for working.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAck {
    pub broker_order_id: String,
}

#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Submits `order` under its idempotency key. Submitting the same key
    /// again must not create a second live order at the broker.
    async fn submit(&self, order: &Order) -> Result<BrokerAck, SubmissionError>;

    /// `Ok` means the broker confirmed the cancel.
    async fn cancel(&self, key: IdempotencyKey) -> Result<(), SubmissionError>;
}

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerMode {
    Paper,
    Http,
}

impl BrokerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Http => "http",
        }
    }
}

impl fmt::Display for BrokerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BrokerMode {
    type Err = &'static str;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "paper" | "mock" => Ok(Self::Paper),
            "http" | "live" => Ok(Self::Http),
            _ => Err("expected paper|http"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub mode:     BrokerMode,
    /// Base URL of the HTTP broker bridge.
    pub base_url: String,
    /// Per-request timeout for the HTTP broker.
    pub timeout:  Duration,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw = env_string("BROKER_MODE", "paper");
        let mode = raw
            .parse()
            .map_err(|_| ConfigError::Unparsable { key: "BROKER_MODE", value: raw })?;
        let config = Self {
            mode,
            base_url: env_string("BROKER_BASE_URL", "http://localhost:8081"),
            timeout:  Duration::from_millis(env_u64("BROKER_TIMEOUT_MS", 5_000)?),
        };
        if config.mode == BrokerMode::Http
            && !(config.base_url.starts_with("http://") || config.base_url.starts_with("https://"))
        {
            return Err(ConfigError::Invalid {
                key:    "BROKER_BASE_URL",
                reason: format!("{} is not an http(s) URL", config.base_url),
            });
        }
        Ok(config)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode:     BrokerMode::Paper,
            base_url: "http://localhost:8081".into(),
            timeout:  Duration::from_secs(5),
        }
    }
}

/// Builds the configured broker. The paper broker reports into `events`.
pub fn build_broker(
    config: &BrokerConfig,
    events: mpsc::Sender<Arrival<OrderEvent>>,
) -> anyhow::Result<Arc<dyn Broker>> {
    let broker: Arc<dyn Broker> = match config.mode {
        BrokerMode::Paper => Arc::new(PaperBroker::new(events)),
        BrokerMode::Http => Arc::new(HttpBroker::new(&config.base_url, config.timeout)?),
    };
    info!(mode = %config.mode, broker = broker.name(), "🏦 Broker ready");
    Ok(broker)
}
