//! Online messages: unsolicited outbound data pushed whenever the stream is free.
//!
//! Producers register an [`OnlineMessageSource`] on a connection. The
//! connection drains registered sources in batches under the stream lock; the
//! [`OnlineQueue`] here owns the hand-off between producers and that drain.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::ConnectionHandle;
use crate::error::AsapError;

/// Producer of unsolicited outbound data.
pub trait OnlineMessageSource: Send + Sync {
    /// Write pending messages to `out`. Called with exclusive stream access.
    fn send_messages(
        &self,
        connection: &ConnectionHandle,
        out: &mut dyn Write,
    ) -> Result<(), AsapError>;
}

/// Registered sources plus whether a drain is running.
pub struct OnlineQueue {
    inner: Mutex<QueueState>,
}

struct QueueState {
    sources: Vec<Arc<dyn OnlineMessageSource>>,
    draining: bool,
}

impl OnlineQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueState {
                sources: Vec::new(),
                draining: false,
            }),
        }
    }

    /// Append `source`. Returns true when the caller must start a drain
    /// (none was running; the queue is now marked as draining).
    pub fn push(&self, source: Arc<dyn OnlineMessageSource>) -> bool {
        let mut state = self.inner.lock();
        state.sources.push(source);
        Self::claim_drain(&mut state)
    }

    /// Claim the drain if sources are waiting and no drain runs. Used when the
    /// stream becomes free.
    pub fn try_claim_drain(&self) -> bool {
        let mut state = self.inner.lock();
        Self::claim_drain(&mut state)
    }

    fn claim_drain(state: &mut QueueState) -> bool {
        if state.draining || state.sources.is_empty() {
            return false;
        }
        state.draining = true;
        true
    }

    /// Remove `source` from the live queue. Sources already swapped into a
    /// running batch are not affected.
    pub fn remove(&self, source: &Arc<dyn OnlineMessageSource>) -> bool {
        let mut state = self.inner.lock();
        let before = state.sources.len();
        state.sources.retain(|s| !Arc::ptr_eq(s, source));
        state.sources.len() != before
    }

    /// Swap the live queue for an empty one and hand back the batch.
    /// An empty queue ends the drain: returns `None` and clears the draining mark.
    pub fn next_batch(&self) -> Option<Vec<Arc<dyn OnlineMessageSource>>> {
        let mut state = self.inner.lock();
        if state.sources.is_empty() {
            state.draining = false;
            return None;
        }
        Some(std::mem::take(&mut state.sources))
    }

    /// Drop every waiting source. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.inner.lock();
        std::mem::take(&mut state.sources).len()
    }

    /// Give up the drain without serving the queue (connection terminated).
    pub fn abandon_drain(&self) {
        self.inner.lock().draining = false;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self) -> bool {
        self.inner.lock().draining
    }
}

impl Default for OnlineQueue {
    fn default() -> Self {
        Self::new()
    }
}
