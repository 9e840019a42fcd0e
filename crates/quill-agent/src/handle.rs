//! A cloneable handle for observing and stopping a session from external code.

use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use tokio_util::sync::CancellationToken;

/// A cloneable handle for observing and stopping a session's read loop.
///
/// All fields are `Arc`-wrapped, so cloning is cheap.
#[derive(Clone)]
pub struct SessionHandle {
    pub(crate) cancel: Arc<Mutex<CancellationToken>>,
    pub(crate) idle_notify: Arc<tokio::sync::Notify>,
    /// Read loops still running; an old loop may outlive a reset
    pub(crate) running: Arc<AtomicUsize>,
}

impl SessionHandle {
    pub(crate) fn new() -> Self {
        Self {
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            idle_notify: Arc::new(tokio::sync::Notify::new()),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Stop reading the current stream and release its connection.
    pub fn abort(&self) {
        self.cancel.lock().cancel();
    }

    /// Install a fresh token for a new session and return it.
    pub(crate) fn renew(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        token
    }

    /// Count a read loop as running until the returned guard drops.
    pub(crate) fn enter(&self) -> RunningGuard {
        self.running.fetch_add(1, Ordering::AcqRel);
        RunningGuard {
            handle: self.clone(),
        }
    }

    /// Wait until every read loop has stopped.
    pub async fn wait_for_idle(&self) {
        let notified = self.idle_notify.notified();
        tokio::pin!(notified);
        loop {
            notified.as_mut().enable();
            if !self.is_running() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.idle_notify.notified());
        }
    }

    /// Wait until the read loop stops, with a timeout.
    /// Returns `true` if idle was reached, `false` on timeout.
    pub async fn wait_for_idle_timeout(&self, timeout: std::time::Duration) -> bool {
        if !self.is_running() {
            return true;
        }
        tokio::time::timeout(timeout, self.wait_for_idle())
            .await
            .is_ok()
    }

    /// Whether any read loop is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) > 0
    }
}

/// Releases one running read loop on every exit path
pub(crate) struct RunningGuard {
    handle: SessionHandle,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if self.handle.running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.handle.idle_notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_idle_only_after_every_loop_exits() {
        let handle = SessionHandle::new();
        assert!(handle.wait_for_idle_timeout(Duration::from_millis(10)).await);

        let old = handle.enter();
        let current = handle.enter();
        drop(old);
        assert!(handle.is_running());
        assert!(!handle.wait_for_idle_timeout(Duration::from_millis(20)).await);

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for_idle().await })
        };
        tokio::task::yield_now().await;
        drop(current);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(!handle.is_running());
    }
}
