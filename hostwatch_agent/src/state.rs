//! Shared published state: one lock-guarded slot per sampler.

use std::sync::Arc;
use tokio::sync::RwLock;

/// Copy-on-read view over the latest successful sample.
///
/// Writers hold the exclusive lock only for the assignment itself; readers get
/// an owned copy so nothing borrowed from the slot outlives the guard.
#[derive(Debug)]
pub struct UsageView<T> {
    slot: Arc<RwLock<Option<Vec<T>>>>,
}

impl<T> Clone for UsageView<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for UsageView<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> UsageView<T> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(RwLock::new(None)),
        }
    }

    /// Replace the published sample in a single lock acquisition.
    pub async fn publish(&self, usage: Vec<T>) {
        *self.slot.write().await = Some(usage);
    }
}

impl<T: Clone> UsageView<T> {
    /// `None` until the first publish ("usage not available"), otherwise a copy.
    pub async fn current(&self) -> Option<Vec<T>> {
        self.slot.read().await.clone()
    }
}
