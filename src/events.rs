use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::watch;

/// Raised once at least one interface holds a dynamically assigned address.
pub const NETWORK_READY: u32 = 1 << 0;

/// Raised when the update client or a supervisor requests a restart.
pub const RESTART_REQUESTED: u32 = 1 << 1;

/// Sticky, OR-composable event flags shared between the orchestration task
/// and its producers (network watcher, update-client callbacks).
///
/// A raised bit stays set until explicitly cleared, so a producer that fires
/// before the consumer starts waiting is never lost. Backed by a `watch`
/// channel: `wait_for` inspects the current value before suspending, which
/// gives the raise-before-wait guarantee without extra locking.
#[derive(Clone)]
pub struct EventLatch {
    bits: watch::Sender<u32>,
}

impl EventLatch {
    pub fn new() -> Self {
        let (bits, _) = watch::channel(0);
        Self { bits }
    }

    /// Set the given flags. Safe to call from any task; idempotent.
    pub fn raise(&self, flags: u32) {
        self.bits.send_modify(|b| *b |= flags);
    }

    /// Clear the given flags. Not used by the orchestration loop itself,
    /// which relies on the device rebooting before a bit would need reuse.
    pub fn clear(&self, flags: u32) {
        self.bits.send_modify(|b| *b &= !flags);
    }

    /// Whether all given flags are currently set.
    pub fn is_set(&self, flags: u32) -> bool {
        *self.bits.borrow() & flags == flags
    }

    /// Block until all requested flags are simultaneously set.
    ///
    /// `timeout` of `None` waits forever, the default for the orchestrator's
    /// two top-level waits. A `Some` duration is the watchdog hook: expiry
    /// returns an error and the caller decides how to shut down.
    pub async fn wait_all(&self, flags: u32, timeout: Option<Duration>) -> Result<()> {
        let mut rx = self.bits.subscribe();
        let wait = rx.wait_for(|b| b & flags == flags);

        match timeout {
            None => {
                wait.await.context("event latch closed")?;
            }
            Some(duration) => {
                tokio::time::timeout(duration, wait)
                    .await
                    .with_context(|| {
                        format!("timed out waiting {duration:?} for event flags {flags:#04x}")
                    })?
                    .context("event latch closed")?;
            }
        }

        Ok(())
    }
}

impl Default for EventLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn raise_before_wait_is_not_lost() {
        let latch = EventLatch::new();
        latch.raise(NETWORK_READY);

        latch
            .wait_all(NETWORK_READY, Some(Duration::from_millis(100)))
            .await
            .expect("should observe flag raised before the wait");
    }

    #[tokio::test]
    async fn wait_blocks_until_all_flags_present() {
        let latch = EventLatch::new();
        latch.raise(NETWORK_READY);

        // only one of two requested bits is set
        let result = latch
            .wait_all(
                NETWORK_READY | RESTART_REQUESTED,
                Some(Duration::from_millis(50)),
            )
            .await;
        assert!(result.is_err());

        latch.raise(RESTART_REQUESTED);
        latch
            .wait_all(
                NETWORK_READY | RESTART_REQUESTED,
                Some(Duration::from_millis(100)),
            )
            .await
            .expect("should observe both flags");
    }

    #[tokio::test]
    async fn raise_from_another_task_wakes_waiter() {
        let latch = EventLatch::new();
        let producer = latch.clone();

        let raiser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.raise(RESTART_REQUESTED);
        });

        latch
            .wait_all(RESTART_REQUESTED, Some(Duration::from_secs(5)))
            .await
            .expect("should be woken by concurrent raise");
        raiser.await.expect("raiser task failed");
    }

    #[tokio::test]
    async fn concurrent_raisers_are_not_lost() {
        let latch = EventLatch::new();

        let a = latch.clone();
        let b = latch.clone();
        let ta = tokio::spawn(async move { a.raise(NETWORK_READY) });
        let tb = tokio::spawn(async move { b.raise(RESTART_REQUESTED) });
        ta.await.expect("raiser task failed");
        tb.await.expect("raiser task failed");

        latch
            .wait_all(
                NETWORK_READY | RESTART_REQUESTED,
                Some(Duration::from_millis(100)),
            )
            .await
            .expect("both concurrently raised flags should be set");
    }

    #[tokio::test]
    async fn flags_are_sticky_across_waits() {
        let latch = EventLatch::new();
        latch.raise(NETWORK_READY);

        for _ in 0..3 {
            latch
                .wait_all(NETWORK_READY, Some(Duration::from_millis(50)))
                .await
                .expect("waits must not consume the flag");
        }
        assert!(latch.is_set(NETWORK_READY));
    }

    #[tokio::test]
    async fn clear_resets_only_requested_flags() {
        let latch = EventLatch::new();
        latch.raise(NETWORK_READY | RESTART_REQUESTED);
        latch.clear(NETWORK_READY);

        assert!(!latch.is_set(NETWORK_READY));
        assert!(latch.is_set(RESTART_REQUESTED));
    }
}
