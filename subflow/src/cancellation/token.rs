//! Cancellation token for cooperative cancellation.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    reason: RwLock<Option<String>>,
    children: RwLock<Vec<Weak<Inner>>>,
    notify: Notify,
}

impl Inner {
    fn cancel(&self, reason: &str) {
        // First reason wins
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        *self.reason.write() = Some(reason.to_string());
        self.notify.notify_waiters();

        let children: Vec<_> = std::mem::take(&mut *self.children.write());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel(reason);
        }
    }
}

/// A token for cooperative cancellation.
///
/// Clones share state. Cancellation is idempotent: only the first reason is
/// kept. Cancelling a token cancels every child created from it, never the
/// other way round.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a child token that is cancelled together with this one.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::new();
        {
            // The flag is read under the lock `Inner::cancel` drains, so a
            // concurrent cancel either sees this child or is seen here.
            let mut children = self.inner.children.write();
            if !self.is_cancelled() {
                children.retain(|c| c.strong_count() > 0);
                children.push(Arc::downgrade(&child.inner));
                return child;
            }
        }
        child.cancel(self.reason().unwrap_or_default());
        child
    }

    /// Requests cancellation with a reason.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.inner.cancel(&reason.into());
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.read().clone()
    }

    /// Waits until the token is cancelled and returns the reason.
    pub async fn cancelled(&self) -> String {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent cancel is not missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return self.reason().unwrap_or_default();
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}
