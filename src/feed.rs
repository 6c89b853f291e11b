//! # feed
//!
//! Market data ingress. A [`MarketFeed`] yields ticks; the [`FeedRunner`]
//! stamps each one with its arrival instant and forwards it to the control
//! loop.
//!
//! The runner owns the failure handling:
//! - transient [`FeedError`]s are retried with [`RetryPolicy`] backoff, forever
//! - a reconnect emits nothing but `FEED_RECOVERED`; instruments are never
//!   reported closed because the connection dropped
//! - no tick for `stale_after` → one `FEED_STALE` warning until ticks resume

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::merge::Arrival;
use crate::error::FeedError;
use crate::events::WsEvent;
use crate::models::Tick;
use crate::retry::RetryPolicy;
use crate::shutdown::StopSignal;

#[async_trait]
pub trait MarketFeed: Send {
    fn name(&self) -> &'static str;

    /// Waits for the next tick. Must be cancel-safe.
    async fn next_tick(&mut self) -> Result<Tick, FeedError>;

    /// Called after a transient error, before reading again.
    async fn reconnect(&mut self) -> Result<(), FeedError> {
        Ok(())
    }
}

// ─── Channel feed ─────────────────────────────────────────────────────────────

/// Push feed: whoever holds the sender (the HTTP tick route) produces ticks.
pub struct ChannelFeed {
    rx: mpsc::Receiver<Tick>,
}

impl ChannelFeed {
    pub fn new(capacity: usize) -> (mpsc::Sender<Tick>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl MarketFeed for ChannelFeed {
    fn name(&self) -> &'static str {
        "push"
    }

    async fn next_tick(&mut self) -> Result<Tick, FeedError> {
        self.rx.recv().await.ok_or(FeedError::Closed)
    }
}

// ─── Runner ───────────────────────────────────────────────────────────────────

pub struct FeedRunner<F: MarketFeed> {
    feed:         F,
    ticks:        mpsc::Sender<Arrival<Tick>>,
    policy:       RetryPolicy,
    stale_after:  Duration,
    broadcast_tx: broadcast::Sender<String>,
    stop:         StopSignal,
}

impl<F: MarketFeed> FeedRunner<F> {
    pub fn new(
        feed: F,
        ticks: mpsc::Sender<Arrival<Tick>>,
        policy: RetryPolicy,
        stale_after: Duration,
        broadcast_tx: broadcast::Sender<String>,
        stop: StopSignal,
    ) -> Self {
        Self { feed, ticks, policy, stale_after, broadcast_tx, stop }
    }

    /// Runs until the stop signal, a closed feed, or the control loop going away.
    pub async fn run(mut self) {
        let feed = self.feed.name();
        info!(feed, stale_after_secs = self.stale_after.as_secs(), "📈 Feed runner started");

        let mut failures = 0u32;
        let mut last_tick = Instant::now();
        let mut stale = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.stop.triggered() => break,
                next = tokio::time::timeout(self.stale_after, self.feed.next_tick()) => next,
            };

            match next {
                Err(_elapsed) => {
                    if !stale {
                        stale = true;
                        let silent_secs = last_tick.elapsed().as_secs();
                        warn!(feed, silent_secs, "📉 Feed stale: no ticks");
                        self.broadcast(&WsEvent::FeedStale { silent_secs });
                    }
                }

                Ok(Ok(tick)) => {
                    failures = 0;
                    last_tick = Instant::now();
                    if stale {
                        stale = false;
                        info!(feed, "📈 Feed recovered");
                        self.broadcast(&WsEvent::FeedRecovered);
                    }
                    if !tick.is_valid() {
                        warn!(feed, symbol = %tick.symbol, ltp = tick.ltp, "Malformed tick skipped");
                        continue;
                    }
                    if self.ticks.send(Arrival::now(tick)).await.is_err() {
                        debug!(feed, "Control loop gone, feed runner exiting");
                        break;
                    }
                }

                Ok(Err(FeedError::Closed)) => {
                    info!(feed, "Feed closed");
                    break;
                }

                Ok(Err(e)) => {
                    failures = failures.saturating_add(1);
                    let delay = self.policy.delay_for(failures - 1);
                    warn!(feed, error = %e, failures, ?delay, "🔁 Feed error, reconnecting");
                    tokio::select! {
                        biased;
                        _ = self.stop.triggered() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if let Err(e) = self.feed.reconnect().await {
                        warn!(feed, error = %e, "Reconnect failed");
                    }
                }
            }
        }

        info!(feed, "Feed runner stopped");
    }

    fn broadcast(&self, event: &WsEvent) {
        let _ = self.broadcast_tx.send(event.to_json());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::VecDeque;

    /// Replays a script of results, then reports the feed closed.
    struct ScriptedFeed {
        script:     VecDeque<Result<Tick, FeedError>>,
        reconnects: u32,
    }

    #[async_trait]
    impl MarketFeed for ScriptedFeed {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn next_tick(&mut self) -> Result<Tick, FeedError> {
            self.script.pop_front().unwrap_or(Err(FeedError::Closed))
        }

        async fn reconnect(&mut self) -> Result<(), FeedError> {
            self.reconnects += 1;
            Ok(())
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: u32::MAX,
            base_delay:   Duration::from_millis(1),
            max_delay:    Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let feed = ScriptedFeed {
            script: VecDeque::from(vec![
                Err(FeedError::Disconnected("reset by peer".into())),
                Err(FeedError::Timeout),
                Ok(Tick::new("NIFTY", 100.0, Utc::now())),
                Ok(Tick::new("NIFTY", f64::NAN, Utc::now())),
                Ok(Tick::new("NIFTY", 101.0, Utc::now())),
            ]),
            reconnects: 0,
        };
        let (tx, mut rx) = mpsc::channel(8);
        let (broadcast_tx, _) = broadcast::channel(8);
        let runner = FeedRunner::new(feed, tx, fast_policy(), Duration::from_secs(5), broadcast_tx, StopSignal::new());

        tokio::time::timeout(Duration::from_secs(2), runner.run()).await.unwrap();

        let prices: Vec<f64> = std::iter::from_fn(|| rx.try_recv().ok()).map(|a| a.item.ltp).collect();
        assert_eq!(prices, vec![100.0, 101.0]);
    }

    #[tokio::test]
    async fn test_stale_warning_then_recovery() {
        let (push, feed) = ChannelFeed::new(8);
        let (tx, mut rx) = mpsc::channel(8);
        let (broadcast_tx, mut events) = broadcast::channel(8);
        let stop = StopSignal::new();
        let runner = FeedRunner::new(feed, tx, fast_policy(), Duration::from_millis(30), broadcast_tx, stop.clone());
        let handle = tokio::spawn(runner.run());

        let first = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert!(first.contains("FEED_STALE"));

        push.send(Tick::new("BANKNIFTY", 250.0, Utc::now())).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert!(second.contains("FEED_RECOVERED"));
        assert_eq!(rx.recv().await.unwrap().item.symbol, "BANKNIFTY");

        stop.trigger();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
