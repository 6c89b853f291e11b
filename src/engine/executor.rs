//! # engine::executor
//!
//! **Order Executor**: runs broker I/O in spawned worker tasks so the control
//! loop never awaits the network. Every outcome comes back to the loop as an
//! [`OrderEvent`].
//!
//! ## Submission worker
//! ```text
//! attempt 1 ─▶ Ok(ack)            → ACKNOWLEDGED
//!           ─▶ Err(Rejected)      → REJECTED             (never retried)
//!           ─▶ Err(Transport)     → sleep base × 2^n ─▶ attempt n+1 (same key)
//!                                   budget exhausted   → SUBMISSION_FAILED
//!                                   stop signal        → SUBMISSION_FAILED (aborted)
//! ```

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::engine::merge::Arrival;
use crate::engine::orders::OrderCommand;
use crate::error::SubmissionError;
use crate::models::{IdempotencyKey, Order, OrderEvent};
use crate::retry::RetryPolicy;
use crate::shutdown::StopSignal;

#[derive(Clone)]
pub struct Executor {
    broker: Arc<dyn Broker>,
    policy: RetryPolicy,
    stop:   StopSignal,
    events: mpsc::Sender<Arrival<OrderEvent>>,
}

impl Executor {
    pub fn new(
        broker: Arc<dyn Broker>,
        policy: RetryPolicy,
        stop: StopSignal,
        events: mpsc::Sender<Arrival<OrderEvent>>,
    ) -> Self {
        Self { broker, policy, stop, events }
    }

    /// Spawns one worker per command.
    pub fn dispatch(&self, command: OrderCommand) -> JoinHandle<()> {
        match command {
            OrderCommand::Submit(order) => self.spawn_submit(order),
            OrderCommand::Cancel(key) => self.spawn_cancel(key),
        }
    }

    pub fn spawn_submit(&self, order: Order) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let event = this.submit_with_retry(&order).await;
            this.report(event).await;
        })
    }

    pub fn spawn_cancel(&self, key: IdempotencyKey) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let event = match this.broker.cancel(key).await {
                Ok(()) => OrderEvent::Cancelled { key },
                Err(e) => {
                    warn!(%key, error = %e, "Cancel request failed");
                    OrderEvent::CancelFailed { key, error: e.to_string() }
                }
            };
            this.report(event).await;
        })
    }

    async fn submit_with_retry(&self, order: &Order) -> OrderEvent {
        let key = order.key;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.broker.submit(order).await {
                Ok(ack) => {
                    return OrderEvent::Acknowledged {
                        key,
                        broker_order_id: ack.broker_order_id,
                        attempts,
                    }
                }
                Err(SubmissionError::Rejected(reason)) => {
                    warn!(%key, %reason, "❌ Broker rejected order");
                    return OrderEvent::Rejected { key, reason };
                }
                Err(e) if e.is_retryable() && self.policy.should_retry(attempts) => {
                    let delay = self.policy.delay_for(attempts - 1);
                    warn!(%key, attempts, ?delay, error = %e, "🔁 Submission failed, retrying with same key");
                    tokio::select! {
                        biased;
                        _ = self.stop.triggered() => {
                            return OrderEvent::SubmissionFailed {
                                key,
                                attempts,
                                error: SubmissionError::Aborted.to_string(),
                            };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    error!(%key, attempts, error = %e, "🚨 Submission retries exhausted");
                    return OrderEvent::SubmissionFailed {
                        key,
                        attempts,
                        error: e.to_string(),
                    };
                }
            }
        }
    }

    async fn report(&self, event: OrderEvent) {
        let key = event.key();
        if self.events.send(Arrival::now(event)).await.is_err() {
            info!(%key, "Order event dropped: control loop already stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerAck, PaperBroker};
    use crate::models::{Direction, ExitPlan, ExitRule, Signal, StrategyId};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    fn make_order() -> Order {
        let signal = Signal::entry(
            StrategyId::new("momentum"),
            "BANKNIFTY",
            Direction::Buy,
            50,
            120.0,
            ExitPlan { stop_loss: ExitRule::Percent(0.25), target: ExitRule::Percent(0.5) },
            "test",
            Utc::now(),
        );
        Order::from_signal(&signal, 50, Utc::now())
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay:  Duration::from_millis(4),
        }
    }

    /// Always fails with a transport error; remembers the keys it saw.
    struct DownBroker {
        keys: Mutex<Vec<IdempotencyKey>>,
    }

    #[async_trait]
    impl Broker for DownBroker {
        fn name(&self) -> &'static str {
            "down"
        }

        async fn submit(&self, order: &Order) -> Result<BrokerAck, SubmissionError> {
            if let Ok(mut keys) = self.keys.lock() {
                keys.push(order.key);
            }
            Err(SubmissionError::Transport("connection refused".into()))
        }

        async fn cancel(&self, _key: IdempotencyKey) -> Result<(), SubmissionError> {
            Err(SubmissionError::Transport("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_retries_reuse_key_and_broker_holds_one_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let broker = Arc::new(PaperBroker::new(tx.clone()).without_fills().failing_transport(2));
        let executor = Executor::new(broker.clone(), fast_policy(3), StopSignal::new(), tx);
        let order = make_order();

        executor.spawn_submit(order.clone()).await.unwrap();

        match rx.recv().await.unwrap().item {
            OrderEvent::Acknowledged { key, attempts, .. } => {
                assert_eq!(key, order.key);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(broker.submissions(), 3);
        assert_eq!(broker.live_orders(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_budget_reports_failure() {
        let (tx, mut rx) = mpsc::channel(8);
        let broker = Arc::new(DownBroker { keys: Mutex::new(Vec::new()) });
        let executor = Executor::new(broker.clone(), fast_policy(3), StopSignal::new(), tx);
        let order = make_order();

        executor.spawn_submit(order.clone()).await.unwrap();

        assert!(matches!(
            rx.recv().await.unwrap().item,
            OrderEvent::SubmissionFailed { attempts: 3, .. }
        ));
        let keys = broker.keys.lock().unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys.iter().collect::<HashSet<_>>().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_signal_aborts_between_retries() {
        let (tx, mut rx) = mpsc::channel(8);
        let broker = Arc::new(DownBroker { keys: Mutex::new(Vec::new()) });
        let stop = StopSignal::new();
        stop.trigger();
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay:   Duration::from_secs(60),
            max_delay:    Duration::from_secs(60),
        };
        let executor = Executor::new(broker.clone(), policy, stop, tx);

        tokio::time::timeout(Duration::from_secs(2), executor.spawn_submit(make_order()))
            .await
            .expect("worker should not sleep through a stop")
            .unwrap();

        match rx.recv().await.unwrap().item {
            OrderEvent::SubmissionFailed { attempts, error, .. } => {
                assert_eq!(attempts, 1);
                assert!(error.contains("aborted"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_failure_is_reported() {
        let (tx, mut rx) = mpsc::channel(8);
        let broker = Arc::new(DownBroker { keys: Mutex::new(Vec::new()) });
        let executor = Executor::new(broker, fast_policy(1), StopSignal::new(), tx);
        let key = IdempotencyKey::generate();

        executor.spawn_cancel(key).await.unwrap();
        assert!(matches!(rx.recv().await.unwrap().item, OrderEvent::CancelFailed { key: k, .. } if k == key));
    }
}
