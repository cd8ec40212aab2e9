//! Backpressure gate: a single-slot, auto-resetting wake signal.
//!
//! `signal` releases at most one waiter, current or future, and the gate
//! then returns to unsignaled. Signals issued while nobody waits collapse
//! into one stored permit; the gate says "at least one wake was requested",
//! never how many.

use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Gate {
    notify: Notify,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until signaled.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Wait until signaled or `timeout` elapses. Returns whether we were signaled.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok()
    }

    /// Release one waiter, or leave a single permit for the next one.
    pub fn signal(&self) {
        self.notify.notify_one();
    }
}
