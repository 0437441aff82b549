//! Advisory coordination between the poller and the webhook channel.
//!
//! While a poll cycle is running, webhook deliveries wait for it to finish so
//! that a single pushed write does not race the poller's bulk writes. The
//! wait is bounded: after the timeout the webhook proceeds anyway. This
//! narrows race windows but does not eliminate them.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

/// Shared "poll cycle in progress" flag with a bounded wait.
#[derive(Debug)]
pub struct PollGate {
    running: watch::Sender<bool>,
}

impl Default for PollGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PollGate {
    pub fn new() -> Self {
        let (running, _) = watch::channel(false);
        PollGate { running }
    }

    /// Returns `true` while a poll cycle is in progress.
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Marks a poll cycle as running until the returned guard is dropped.
    ///
    /// Dropping the guard wakes every waiter, including when the cycle
    /// fails or panics.
    pub fn enter(&self) -> RunningGuard<'_> {
        self.running.send_replace(true);
        RunningGuard { gate: self }
    }

    /// Waits until no poll cycle is running, or until `timeout` elapses.
    ///
    /// Returns `true` if the gate was (or became) idle, `false` on timeout.
    /// Callers proceed in both cases.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.running.subscribe();
        if !*rx.borrow_and_update() {
            return true;
        }

        debug!(timeout_ms = timeout.as_millis() as u64, "Poll cycle running, waiting");
        match tokio::time::timeout(timeout, rx.wait_for(|running| !*running)).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for poll cycle, proceeding"
                );
                false
            }
        }
    }
}

/// Clears the running flag on drop.
#[derive(Debug)]
pub struct RunningGuard<'a> {
    gate: &'a PollGate,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.gate.running.send_replace(false);
    }
}
