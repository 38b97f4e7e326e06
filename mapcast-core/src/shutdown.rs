//! Process-wide shutdown coordination (spec §5): a flag polled at every
//! IO boundary, paired with a `Notify` so waiters don't have to busy-poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Signal shutdown to every holder of this handle.
    pub fn trigger(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Wait until `trigger()` is called, or return immediately if it
    /// already has been.
    pub async fn wait(&self) {
        if self.is_stopped() {
            return;
        }
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_immediately_if_already_stopped() {
        let handle = ShutdownHandle::new();
        handle.trigger();
        tokio::time::timeout(Duration::from_millis(50), handle.wait())
            .await
            .expect("should not time out");
    }

    #[tokio::test]
    async fn wait_unblocks_on_trigger() {
        let handle = ShutdownHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move {
            waiter.wait().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.trigger();
        tokio::time::timeout(Duration::from_millis(200), task)
            .await
            .expect("task should complete after trigger")
            .unwrap();
    }
}
