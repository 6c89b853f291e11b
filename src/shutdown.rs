//! # shutdown
//!
//! [`StopSignal`]: emergency-stop token built on `tokio::sync::watch`.
//!
//! The control loop checks it every iteration; submission workers check it
//! between retries. Tripping is one-way for the lifetime of a session.

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Requests a stop. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the stop has been requested.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        // wait_for only errors if the sender is gone; we hold one.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_clones_observe_trigger() {
        let stop = StopSignal::new();
        let observer = stop.clone();
        assert!(!observer.is_triggered());

        let waiter = tokio::spawn(async move { observer.triggered().await });
        stop.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .expect("task should not panic");
        assert!(stop.is_triggered());
    }
}
