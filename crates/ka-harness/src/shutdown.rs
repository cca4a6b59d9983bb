use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Level-triggered shutdown coordinator.
///
/// Unlike a broadcast channel, a component that starts listening *after*
/// `trigger()` was called still observes the shutdown, so the scheduler
/// cannot miss a signal that arrives while it is being spawned.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
///
/// tokio::select! {
///     _ = shutdown.cancelled() => { /* stop */ }
///     _ = do_work() => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    state: Arc<watch::Sender<bool>>,
    drained: Arc<watch::Sender<usize>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        let (drained, _) = watch::channel(0);
        Self {
            state: Arc::new(state),
            drained: Arc::new(drained),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.state.borrow()
    }

    /// Trigger shutdown for every current and future listener. Idempotent.
    pub fn trigger(&self) {
        let first = self.state.send_if_modified(|down| {
            if *down {
                false
            } else {
                *down = true;
                true
            }
        });
        if first {
            info!("shutdown signal triggered");
        } else {
            warn!("shutdown already triggered");
        }
    }

    /// Resolves once shutdown has been triggered.
    pub async fn cancelled(&self) {
        let mut rx = self.state.subscribe();
        // `wait_for` checks the current value first, so a past trigger resolves
        // immediately. The sender lives in `self`, so it cannot be dropped here.
        let _ = rx.wait_for(|down| *down).await;
    }

    /// Record that one component finished its shutdown work.
    pub fn confirm_drained(&self) {
        self.drained.send_modify(|count| *count += 1);
    }

    /// Wait until `expected` components have confirmed, or `timeout` expires.
    pub async fn wait_for_drain(&self, expected: usize, timeout: Duration) -> DrainResult {
        let mut rx = self.drained.subscribe();
        let finished = tokio::time::timeout(timeout, rx.wait_for(|count| *count >= expected))
            .await
            .is_ok();
        let confirmed = *rx.borrow();
        if finished {
            info!(count = confirmed, "all components drained");
            DrainResult::Complete(confirmed)
        } else {
            warn!(confirmed, expected, "drain timeout, continuing shutdown");
            DrainResult::Timeout {
                confirmed,
                expected,
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// DrainResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete(usize),
    Timeout { confirmed: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

// ---------------------------------------------------------------------------
// ShutdownGuard
// ---------------------------------------------------------------------------

/// Confirms drain on drop. Hand one to each long-running component.
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl ShutdownGuard {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self { signal }
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_sets_flag_and_is_idempotent() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutting_down());
        signal.trigger();
        signal.trigger();
        assert!(signal.is_shutting_down());
    }

    #[test]
    fn clones_share_state() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        clone.trigger();
        assert!(signal.is_shutting_down());
    }

    #[tokio::test]
    async fn cancelled_resolves_after_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        tokio::task::yield_now().await;
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("waiter woke up")
            .expect("waiter did not panic");
    }

    #[tokio::test]
    async fn late_listener_sees_past_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(50), signal.cancelled())
            .await
            .expect("already-triggered signal resolves immediately");
    }

    #[tokio::test]
    async fn drain_completes_when_guards_drop() {
        let signal = ShutdownSignal::new();
        let g1 = ShutdownGuard::new(signal.clone());
        let g2 = ShutdownGuard::new(signal.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(g1);
            drop(g2);
        });

        let result = signal.wait_for_drain(2, Duration::from_secs(1)).await;
        assert_eq!(result, DrainResult::Complete(2));
    }

    #[tokio::test]
    async fn drain_times_out_when_guard_is_held() {
        let signal = ShutdownSignal::new();
        let _held = ShutdownGuard::new(signal.clone());

        let result = signal.wait_for_drain(1, Duration::from_millis(30)).await;
        assert_eq!(
            result,
            DrainResult::Timeout {
                confirmed: 0,
                expected: 1
            }
        );
        assert!(!result.is_complete());
    }
}
