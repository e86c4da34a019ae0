//! Background work tied to the lifetime of an event.
//!
//! A strategy may kick off work that must finish even though the response has
//! already been handed back, e.g. writing a fetched copy into the cache. That
//! work is spawned onto the tokio runtime through [`WaitUntil`], and the host
//! awaits [`WaitUntil::settled`] before it considers the event finished.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tracing::warn;

/// Tracks tasks that extend an event's lifetime.
///
/// Cloning yields another handle onto the same task set.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use offline_router::background::WaitUntil;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let lifetime = WaitUntil::new();
/// let done = Arc::new(AtomicBool::new(false));
/// let flag = Arc::clone(&done);
/// lifetime.wait_until(async move { flag.store(true, Ordering::SeqCst) });
///
/// lifetime.settled().await;
/// assert!(done.load(Ordering::SeqCst));
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct WaitUntil {
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl WaitUntil {
    pub fn new() -> Self {
        Self::default()
    }

    // A panicking task cannot leave the handle list half-updated.
    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawns `work` immediately and keeps the event alive until it completes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn wait_until<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        self.tasks().push(handle);
    }

    /// Number of tasks registered and not yet awaited by [`settled`](Self::settled).
    pub fn pending(&self) -> usize {
        self.tasks().len()
    }

    /// Waits for every registered task, including tasks registered while waiting.
    pub async fn settled(&self) {
        loop {
            let batch = std::mem::take(&mut *self.tasks());
            if batch.is_empty() {
                return;
            }
            for handle in batch {
                if let Err(e) = handle.await {
                    warn!(error = %e, "background task did not complete");
                }
            }
        }
    }
}
