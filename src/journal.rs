//! # journal
//!
//! Append-only session journal. The control loop hands records to a
//! [`Journal`] handle without awaiting; a background writer task fans them
//! out to every configured [`JournalSink`].
//!
//! | Sink          | Enabled by                         |
//! |---------------|------------------------------------|
//! | [`JsonlSink`] | always (`JOURNAL_PATH`)            |
//! | `PgSink`      | `postgres` feature + `DATABASE_URL`|

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{CircuitBreakerTrip, ReconciliationError};
use crate::models::{ClosedPosition, Fill, IdempotencyKey, Order, OrderState, OrderSummary, PortfolioState, Signal, StrategyId};
use crate::risk::{RejectReason, RiskLimits};

// ─── Records ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JournalRecord {
    Signal { signal: Signal },
    RiskDecision {
        signal_id:   Uuid,
        strategy_id: StrategyId,
        symbol:      String,
        approved:    bool,
        reason:      Option<RejectReason>,
    },
    OrderTransition { order: Order, from: OrderState },
    Fill { key: IdempotencyKey, fill: Fill },
    PositionClosed { closed: ClosedPosition },
    Reconciliation { error: ReconciliationError },
    Alert { message: String },
    BreakerTripped { trip: CircuitBreakerTrip },
    BreakerReset,
    LimitsReloaded { limits: RiskLimits },
    FinalSnapshot { portfolio: PortfolioState, orders: OrderSummary, halted: bool },
}

impl JournalRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            JournalRecord::Signal { .. } => "SIGNAL",
            JournalRecord::RiskDecision { .. } => "RISK_DECISION",
            JournalRecord::OrderTransition { .. } => "ORDER_TRANSITION",
            JournalRecord::Fill { .. } => "FILL",
            JournalRecord::PositionClosed { .. } => "POSITION_CLOSED",
            JournalRecord::Reconciliation { .. } => "RECONCILIATION",
            JournalRecord::Alert { .. } => "ALERT",
            JournalRecord::BreakerTripped { .. } => "BREAKER_TRIPPED",
            JournalRecord::BreakerReset => "BREAKER_RESET",
            JournalRecord::LimitsReloaded { .. } => "LIMITS_RELOADED",
            JournalRecord::FinalSnapshot { .. } => "FINAL_SNAPSHOT",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub at:     DateTime<Utc>,
    #[serde(flatten)]
    pub record: JournalRecord,
}

// ─── Sinks ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait JournalSink: Send {
    fn name(&self) -> &'static str;

    async fn write(&mut self, entry: &JournalEntry) -> anyhow::Result<()>;

    async fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One JSON object per line.
pub struct JsonlSink {
    writer: BufWriter<tokio::fs::File>,
}

impl JsonlSink {
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create journal directory {}", dir.display()))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to open journal {}", path.display()))?;
        info!(path = %path.display(), "📓 Journal opened");
        Ok(Self { writer: BufWriter::new(file) })
    }
}

#[async_trait]
impl JournalSink for JsonlSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn write(&mut self, entry: &JournalEntry) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(feature = "postgres")]
pub use pg::PgSink;

#[cfg(feature = "postgres")]
mod pg {
    use super::*;
    use sqlx::{postgres::PgPoolOptions, Executor, PgPool};

    pub struct PgSink {
        pool: PgPool,
    }

    impl PgSink {
        /// Connects and applies `migrations/001_init.sql`.
        pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
            info!("Connecting to PostgreSQL...");
            let pool = PgPoolOptions::new()
                .max_connections(4)
                .acquire_timeout(std::time::Duration::from_secs(5))
                .connect(database_url)
                .await
                .context("Failed to connect to PostgreSQL")?;

            // Plain &str runs over the simple protocol, so several statements are fine.
            pool.execute(include_str!("../migrations/001_init.sql"))
                .await
                .context("Failed to run migration 001_init.sql")?;

            info!("✅ PostgreSQL journal ready");
            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl JournalSink for PgSink {
        fn name(&self) -> &'static str {
            "postgres"
        }

        async fn write(&mut self, entry: &JournalEntry) -> anyhow::Result<()> {
            let payload = serde_json::to_string(entry)?;
            sqlx::query("INSERT INTO journal (at, kind, payload) VALUES ($1, $2, $3::jsonb)")
                .bind(entry.at)
                .bind(entry.record.kind())
                .bind(payload)
                .execute(&self.pool)
                .await
                .context("journal insert failed")?;
            Ok(())
        }
    }
}

// ─── Handle ───────────────────────────────────────────────────────────────────

/// Cheap, non-blocking handle. Dropping every clone ends the writer task
/// after it has flushed.
#[derive(Clone)]
pub struct Journal {
    tx: mpsc::UnboundedSender<JournalEntry>,
}

impl Journal {
    /// Spawns the writer task over `sinks`.
    pub fn spawn(mut sinks: Vec<Box<dyn JournalSink>>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<JournalEntry>();
        let handle = tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                for sink in sinks.iter_mut() {
                    if let Err(e) = sink.write(&entry).await {
                        error!(sink = sink.name(), kind = entry.record.kind(), error = %e, "Journal write failed");
                    }
                }
            }
            for sink in sinks.iter_mut() {
                if let Err(e) = sink.flush().await {
                    error!(sink = sink.name(), error = %e, "Journal flush failed");
                }
            }
            info!("📓 Journal closed");
        });
        (Self { tx }, handle)
    }

    /// Handle whose entries land on the returned receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JournalEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn record(&self, record: JournalRecord) {
        let entry = JournalEntry { at: Utc::now(), record };
        if self.tx.send(entry).is_err() {
            error!("Journal writer gone, record dropped");
        }
    }
}
