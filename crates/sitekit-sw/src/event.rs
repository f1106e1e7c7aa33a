//! Extendable event lifetimes.

use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use tracing::warn;

/// Lifetime token handed to an event handler.
///
/// Work registered with [`wait_until`](Self::wait_until) runs in the
/// background; the event is only finished once [`settled`](Self::settled)
/// has awaited all of it.
#[derive(Debug, Default)]
pub struct ExtendableEvent {
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl ExtendableEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extend the event's lifetime until `work` completes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn wait_until<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }

    /// Number of registered extensions, finished or not.
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .map(|pending| pending.len())
            .unwrap_or_default()
    }

    /// Wait for every extension to finish.
    pub async fn settled(self) {
        let handles = self
            .pending
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Extended event work panicked");
            }
        }
    }
}
