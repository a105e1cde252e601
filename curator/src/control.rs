use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Run-level stop signal: an optional deadline plus an explicit stop request
/// (Ctrl-C). Once either fires, pending calls and pauses are interrupted.
#[derive(Debug, Default)]
pub struct RunControl {
    deadline: Option<Instant>,
    stopped: AtomicBool,
    notify: Notify,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(budget: Option<Duration>) -> Self {
        Self {
            deadline: budget.map(|b| Instant::now() + b),
            ..Self::default()
        }
    }

    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// True once a stop was requested or the deadline passed.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves when the run must stop.
    pub async fn stopped(&self) {
        let requested = async {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        };

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = requested => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => requested.await,
        }
    }

    /// Drive `fut` unless the run stops first.
    pub async fn guard<F: Future>(&self, fut: F) -> Option<F::Output> {
        if self.is_stopped() {
            return None;
        }
        tokio::select! {
            out = fut => Some(out),
            _ = self.stopped() => None,
        }
    }

    /// Sleep for `duration`; false when the pause was cut short by a stop.
    pub async fn pause(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return !self.is_stopped();
        }
        self.guard(tokio::time::sleep(duration)).await.is_some()
    }
}
