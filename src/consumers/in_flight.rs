//! Tracking of delivery-processor invocations currently executing.
//!
//! The count is used only to bound the drain performed on shutdown and
//! reconnect; it plays no role in admission control.
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

#[derive(Default)]
pub(crate) struct InFlight {
    active: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    /// Register one in-flight invocation. The count is decremented when the
    /// returned guard drops, on every exit path.
    pub(crate) fn track(&self) -> InFlightGuard<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        InFlightGuard { in_flight: self }
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait until no invocation is in flight.
    ///
    /// Callers bound this with a timeout; the drain is best-effort, not a
    /// correctness guarantee.
    pub(crate) async fn wait_idle(&self) {
        loop {
            // Register interest before reading the count, so a decrement
            // racing with this check cannot be missed.
            let notified = self.idle.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.in_flight.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}
