//! # broker::paper
//!
//! In-process simulated broker. Acknowledges every new key and fills it in
//! full at the order's reference price. Resubmitting a known key returns the
//! original acknowledgment and never fills twice.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::broker::{Broker, BrokerAck};
use crate::engine::merge::Arrival;
use crate::error::SubmissionError;
use crate::models::{Fill, IdempotencyKey, Order, OrderEvent};

#[derive(Debug, Clone)]
struct PaperOrder {
    broker_order_id: String,
    filled:          bool,
    cancelled:       bool,
}

pub struct PaperBroker {
    events:          mpsc::Sender<Arrival<OrderEvent>>,
    orders:          Mutex<HashMap<IdempotencyKey, PaperOrder>>,
    next_id:         AtomicU64,
    auto_fill:       bool,
    /// Remaining submissions to fail with a transport error.
    transport_fails: AtomicU32,
    submissions:     AtomicU64,
}

impl PaperBroker {
    pub fn new(events: mpsc::Sender<Arrival<OrderEvent>>) -> Self {
        Self {
            events,
            orders:          Mutex::new(HashMap::new()),
            next_id:         AtomicU64::new(1),
            auto_fill:       true,
            transport_fails: AtomicU32::new(0),
            submissions:     AtomicU64::new(0),
        }
    }

    /// Acknowledge only; fills are left to the caller.
    pub fn without_fills(mut self) -> Self {
        self.auto_fill = false;
        self
    }

    /// Fail the next `n` submissions with a transport error.
    pub fn failing_transport(self, n: u32) -> Self {
        self.transport_fails.store(n, Ordering::SeqCst);
        self
    }

    /// Submission calls received, including duplicates and failures.
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Orders the broker considers live (acknowledged, not filled or cancelled).
    pub fn live_orders(&self) -> usize {
        self.orders
            .lock()
            .map(|orders| orders.values().filter(|o| !o.filled && !o.cancelled).count())
            .unwrap_or(0)
    }

    async fn emit(&self, event: OrderEvent) {
        if self.events.send(Arrival::now(event)).await.is_err() {
            warn!("Paper broker event dropped: control loop gone");
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn submit(&self, order: &Order) -> Result<BrokerAck, SubmissionError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .transport_fails
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SubmissionError::Transport("simulated network failure".into()));
        }

        let (ack, fresh) = {
            let mut orders = self
                .orders
                .lock()
                .map_err(|_| SubmissionError::Transport("paper book poisoned".into()))?;
            match orders.get(&order.key) {
                Some(existing) => (existing.broker_order_id.clone(), false),
                None => {
                    let id = format!("PAPER-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
                    orders.insert(
                        order.key,
                        PaperOrder {
                            broker_order_id: id.clone(),
                            filled:          false,
                            cancelled:       false,
                        },
                    );
                    (id, true)
                }
            }
        };

        if !fresh {
            info!(key = %order.key, broker_order_id = %ack, "🧾 [PAPER] Duplicate submission, returning original ack");
            return Ok(BrokerAck { broker_order_id: ack });
        }

        info!(
            key    = %order.key,
            symbol = %order.symbol,
            side   = %order.side,
            qty    = order.quantity,
            price  = order.price,
            "🎭 [PAPER] Order accepted"
        );

        if self.auto_fill {
            if let Ok(mut orders) = self.orders.lock() {
                if let Some(o) = orders.get_mut(&order.key) {
                    o.filled = true;
                }
            }
            let fill = Fill {
                fill_id:  format!("{ack}-1"),
                quantity: order.quantity,
                price:    order.price,
                time:     Utc::now(),
            };
            self.emit(OrderEvent::Fill { key: order.key, fill }).await;
        }

        Ok(BrokerAck { broker_order_id: ack })
    }

    async fn cancel(&self, key: IdempotencyKey) -> Result<(), SubmissionError> {
        let mut orders = self
            .orders
            .lock()
            .map_err(|_| SubmissionError::Transport("paper book poisoned".into()))?;
        match orders.get_mut(&key) {
            None => Err(SubmissionError::Rejected(format!("unknown order {key}"))),
            Some(o) if o.filled => Err(SubmissionError::Rejected("order already filled".into())),
            Some(o) => {
                o.cancelled = true;
                info!(%key, "🎭 [PAPER] Order cancelled");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, ExitPlan, ExitRule, Signal, StrategyId};

    fn make_order() -> Order {
        let signal = Signal::entry(
            StrategyId::new("scalping"),
            "NIFTY",
            Direction::Buy,
            25,
            100.0,
            ExitPlan { stop_loss: ExitRule::Percent(0.15), target: ExitRule::Points(15.0) },
            "test",
            Utc::now(),
        );
        Order::from_signal(&signal, 25, Utc::now())
    }

    #[tokio::test]
    async fn test_submit_acks_and_fills_once() {
        let (tx, mut rx) = mpsc::channel(8);
        let broker = PaperBroker::new(tx);
        let order = make_order();

        let first = broker.submit(&order).await.unwrap();
        let again = broker.submit(&order).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(broker.submissions(), 2);

        let event = rx.recv().await.unwrap().item;
        match event {
            OrderEvent::Fill { key, fill } => {
                assert_eq!(key, order.key);
                assert_eq!(fill.quantity, 25);
                assert_eq!(fill.price, 100.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transport_failures_then_success() {
        let (tx, _rx) = mpsc::channel(8);
        let broker = PaperBroker::new(tx).without_fills().failing_transport(2);
        let order = make_order();

        assert!(matches!(broker.submit(&order).await, Err(SubmissionError::Transport(_))));
        assert!(matches!(broker.submit(&order).await, Err(SubmissionError::Transport(_))));
        assert!(broker.submit(&order).await.is_ok());
        assert_eq!(broker.live_orders(), 1);

        broker.cancel(order.key).await.unwrap();
        assert_eq!(broker.live_orders(), 0);
    }

    #[tokio::test]
    async fn test_cancel_filled_order_is_refused() {
        let (tx, _rx) = mpsc::channel(8);
        let broker = PaperBroker::new(tx);
        let order = make_order();
        broker.submit(&order).await.unwrap();
        assert!(matches!(broker.cancel(order.key).await, Err(SubmissionError::Rejected(_))));
    }
}
