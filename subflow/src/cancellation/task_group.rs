//! Structured task group for managing related async tasks.

use super::CancellationToken;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A group of related background tasks with structured cancellation.
///
/// If any task errors or panics, the remaining tasks are cancelled.
pub struct StructuredTaskGroup {
    cancel_token: CancellationToken,
    handles: Mutex<Vec<(String, JoinHandle<Result<(), String>>)>>,
    first_error: RwLock<Option<String>>,
}

impl StructuredTaskGroup {
    /// Creates a new task group with its own token.
    #[must_use]
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Creates a task group driven by an existing token.
    #[must_use]
    pub fn with_token(cancel_token: CancellationToken) -> Self {
        Self {
            cancel_token,
            handles: Mutex::new(Vec::new()),
            first_error: RwLock::new(None),
        }
    }

    /// Returns the cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Spawns a task in the group.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let name = name.into();
        let token = self.cancel_token.clone();
        debug!(task = %name, "Spawning background task");
        let handle = tokio::spawn(async move { task(token).await });
        self.handles.lock().push((name, handle));
    }

    /// Cancels all tasks in the group.
    pub fn cancel_all(&self, reason: &str) {
        self.cancel_token.cancel(reason);
    }

    /// Waits for all tasks to complete.
    ///
    /// Returns the first error if any occurred.
    pub async fn wait(&self) -> Result<(), String> {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());

        for (name, handle) in handles {
            let failure = match handle.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{name}: {e}")),
                Err(join_error) => Some(format!("{name}: task join error: {join_error}")),
            };
            if let Some(msg) = failure {
                warn!(task = %name, error = %msg, "Background task failed");
                let mut first_error = self.first_error.write();
                if first_error.is_none() {
                    *first_error = Some(msg.clone());
                    self.cancel_token.cancel(msg);
                }
            }
        }

        self.first_error.read().clone().map_or(Ok(()), Err)
    }

    /// Returns the number of tasks not yet awaited.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.handles.lock().len()
    }
}

impl Default for StructuredTaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StructuredTaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructuredTaskGroup")
            .field("task_count", &self.task_count())
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish()
    }
}
