//! A single cancellation token threaded through every external call.
//!
//! Every container invocation, forge API call (including retry sleeps), and
//! subprocess invocation observes this token. When it fires: in-flight
//! subprocesses are terminated, retry sleeps return immediately, and the
//! current iteration unwinds.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct CancellationToken(Arc<Inner>);

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled. Safe to await repeatedly or
    /// concurrently from multiple tasks.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            let notified = self.0.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
    }

    /// Sleep for `duration`, returning early with `Err(())` if cancelled.
    pub async fn cancellable_sleep(&self, duration: std::time::Duration) -> Result<(), ()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(()),
        }
    }
}
