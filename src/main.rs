//! # trading-control: service entry point
//!
//! Wires the control loop to its adapters and serves the HTTP surface.
//!
//! ## Environment Variables
//!
//! | Variable            | Default                  | Description                         |
//! |---------------------|--------------------------|-------------------------------------|
//! | `BIND_ADDR`         | `0.0.0.0:3000`           | Address Axum listens on             |
//! | `BROKER_MODE`       | `paper`                  | `paper` or `http`                   |
//! | `BROKER_BASE_URL`   | `http://localhost:8081`  | Broker bridge for `http` mode       |
//! | `JOURNAL_PATH`      | `journal/session.jsonl`  | JSONL journal file                  |
//! | `DATABASE_URL`      | unset                    | Postgres journal (`postgres` build) |
//! | `API_KEY`           | unset                    | Required `x-api-key` when set       |
//! | `RUST_LOG`          | `trading_control=debug`  | Tracing filter                      |
//!
//! Risk, strategy, order and loop settings are documented on their `from_env`
//! constructors.
//!
//! ## Exit codes
//!
//! `0` clean shutdown, `1` startup failure, `2` session ended halted.

use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trading_control::{
    broker::build_broker,
    config::AppConfig,
    engine::{ControlLoop, Executor, LoopInputs, LoopOutputs, LoopSettings, SessionOutcome},
    feed::{ChannelFeed, FeedRunner},
    journal::{Journal, JournalSink, JsonlSink},
    routes::build_router,
    shutdown::StopSignal,
    state::AppState,
    strategy::build_strategies,
};

#[cfg(feature = "postgres")]
use trading_control::journal::PgSink;

// ─── Entry Point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    // ── 1. Load .env (optional, CI/prod can use real env vars) ───────────────
    dotenvy::dotenv().ok();

    // ── 2. Initialise structured logging ─────────────────────────────────────
    if let Err(e) = init_tracing() {
        eprintln!("failed to initialise logging: {e}");
        return ExitCode::from(1);
    }

    info!(
        r#"

  ╔═══════════════════════════════════════════════╗
  ║        TRADING CONTROL · Session Core         ║
  ║     Strategies · Risk · Orders · Ledger       ║
  ╚═══════════════════════════════════════════════╝"#
    );

    // ── 3. Configuration ─────────────────────────────────────────────────────
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "❌ Invalid configuration");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(outcome) => {
            info!(?outcome, code = outcome.exit_code(), "👋 Session ended");
            ExitCode::from(outcome.exit_code())
        }
        Err(e) => {
            error!(error = %e, "❌ Startup failed");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env()
            .add_directive("trading_control=debug".parse()?)
            .add_directive("tower_http=info".parse()?))
        .init();
    Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<SessionOutcome> {
    let capacity = config.control.channel_capacity;

    // ── 4. Channels ──────────────────────────────────────────────────────────
    let (order_events_tx, order_events_rx) = mpsc::channel(capacity);
    let (ticks_tx, ticks_rx) = mpsc::channel(capacity);
    let (commands_tx, commands_rx) = mpsc::channel(32);
    let (broadcast_tx, _) = broadcast::channel::<String>(256);
    let (feed_tx, feed) = ChannelFeed::new(capacity);
    let stop = StopSignal::new();

    // ── 5. Broker, journal, strategies ───────────────────────────────────────
    let broker = build_broker(&config.broker, order_events_tx.clone())?;
    let executor = Executor::new(broker, config.orders.retry, stop.clone(), order_events_tx.clone());

    let sinks = open_sinks(&config).await?;
    let (journal, journal_writer) = Journal::spawn(sinks);

    let strategies = build_strategies(&config);
    if strategies.is_empty() {
        warn!("No strategies enabled; the session will only manage operator commands");
    }

    // ── 6. Control loop ──────────────────────────────────────────────────────
    let (control_loop, snapshot_rx) = ControlLoop::new(
        LoopSettings::from(&config),
        strategies,
        LoopOutputs {
            executor,
            journal:      journal.clone(),
            broadcast_tx: broadcast_tx.clone(),
        },
        LoopInputs {
            ticks:        ticks_rx,
            order_events: order_events_rx,
            commands:     commands_rx,
            stop:         stop.clone(),
        },
    );
    drop(journal);
    let loop_handle = tokio::spawn(control_loop.run());

    // ── 7. Feed runner ───────────────────────────────────────────────────────
    let runner = FeedRunner::new(
        feed,
        ticks_tx,
        config.feed_retry,
        config.control.feed_stale_after,
        broadcast_tx.clone(),
        stop.clone(),
    );
    tokio::spawn(runner.run());

    // ── 8. Ctrl-C → stop ─────────────────────────────────────────────────────
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("🛑 Ctrl-C received, shutting down");
                stop.trigger();
            }
        });
    }

    // ── 9. HTTP ──────────────────────────────────────────────────────────────
    let state = Arc::new(AppState::new(snapshot_rx, commands_tx, feed_tx, order_events_tx, broadcast_tx));
    let app = build_router(state);

    info!(addr = ?config.bind_addr, "🚀 Trading control server starting");
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let server = {
        let stop = stop.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.triggered().await })
                .await
        })
    };

    // ── 10. Wait for the session to end ──────────────────────────────────────
    let outcome = loop_handle.await?;
    stop.trigger();

    // Open WebSocket clients would hold the server forever.
    match tokio::time::timeout(config.control.shutdown_grace, server).await {
        Ok(Ok(Err(e))) => error!(error = %e, "HTTP server error"),
        Ok(_) => {}
        Err(_) => warn!("HTTP server did not stop within the grace period"),
    }

    if let Err(e) = journal_writer.await {
        error!(error = %e, "Journal writer panicked");
    }
    Ok(outcome)
}

async fn open_sinks(config: &AppConfig) -> anyhow::Result<Vec<Box<dyn JournalSink>>> {
    let jsonl: Box<dyn JournalSink> = Box::new(JsonlSink::open(&config.journal_path).await?);

    #[cfg(feature = "postgres")]
    let sinks = match config.database_url.as_deref() {
        Some(url) => vec![jsonl, Box::new(PgSink::connect(url).await?) as Box<dyn JournalSink>],
        None => vec![jsonl],
    };

    #[cfg(not(feature = "postgres"))]
    let sinks = {
        if config.database_url.is_some() {
            warn!("DATABASE_URL is set but this build has no `postgres` feature; journaling to JSONL only");
        }
        vec![jsonl]
    };

    Ok(sinks)
}
