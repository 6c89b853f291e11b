//! # config
//!
//! Environment-driven configuration. `.env` is loaded by `main` via `dotenvy`
//! before [`AppConfig::from_env`] runs; every section has its own `from_env`
//! next to the type it configures.
//!
//! Unlike a silent fallback, a value that is present but unparsable or out of
//! range fails startup with a [`ConfigError`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::broker::BrokerConfig;
use crate::engine::control::ControlConfig;
use crate::engine::orders::OrderConfig;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::risk::RiskLimits;
use crate::strategy::{MomentumConfig, ScalpingConfig};

// ─── Helpers ──────────────────────────────────────────────────────────────────

/// Reads `key`, falling back to `default` when unset or empty.
pub fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| ConfigError::Unparsable {
            key,
            value: raw,
        }),
        _ => Ok(default),
    }
}

pub fn env_u32(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    env_parse(key, default)
}

pub fn env_u64(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    env_parse(key, default)
}

pub fn env_usize(key: &'static str, default: usize) -> Result<usize, ConfigError> {
    env_parse(key, default)
}

pub fn env_f64(key: &'static str, default: f64) -> Result<f64, ConfigError> {
    let value: f64 = env_parse(key, default)?;
    if !value.is_finite() {
        return Err(ConfigError::Invalid { key, reason: "must be finite".into() });
    }
    Ok(value)
}

/// A fraction in `(0, 1]`, e.g. `0.05` for 5%.
pub fn env_pct(key: &'static str, default: f64) -> Result<f64, ConfigError> {
    let value = env_f64(key, default)?;
    if value <= 0.0 || value > 1.0 {
        return Err(ConfigError::Invalid {
            key,
            reason: format!("{value} is not a fraction in (0, 1]"),
        });
    }
    Ok(value)
}

pub fn env_bool(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Unparsable { key, value: raw }),
        },
        Err(_) => Ok(default),
    }
}

pub fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

// ─── AppConfig ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub limits:       RiskLimits,
    pub scalping:     Option<ScalpingConfig>,
    pub momentum:     Option<MomentumConfig>,
    pub orders:       OrderConfig,
    pub control:      ControlConfig,
    pub broker:       BrokerConfig,
    pub feed_retry:   RetryPolicy,
    pub journal_path: PathBuf,
    /// Postgres journal target; only used with the `postgres` feature.
    pub database_url: Option<String>,
    pub bind_addr:    SocketAddr,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let scalping = if env_bool("SCALPING_ENABLED", true)? {
            Some(ScalpingConfig::from_env()?)
        } else {
            None
        };
        let momentum = if env_bool("MOMENTUM_ENABLED", true)? {
            Some(MomentumConfig::from_env()?)
        } else {
            None
        };

        let bind_raw = env_string("BIND_ADDR", "0.0.0.0:3000");
        let bind_addr = bind_raw.parse().map_err(|_| ConfigError::Unparsable {
            key:   "BIND_ADDR",
            value: bind_raw,
        })?;

        Ok(Self {
            limits:       RiskLimits::from_env()?,
            scalping,
            momentum,
            orders:       OrderConfig::from_env()?,
            control:      ControlConfig::from_env()?,
            broker:       BrokerConfig::from_env()?,
            feed_retry:   RetryPolicy::feed_from_env()?,
            journal_path: PathBuf::from(env_string("JOURNAL_PATH", "journal/session.jsonl")),
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            bind_addr,
        })
    }
}
