//! Stream access lock: single-owner exclusion over the shared output stream.
//!
//! Several producers write to one connection (pdu dispatch replies, online
//! message drains, introduction and interest writes). The guard returned by
//! [`StreamLock::acquire`] is the only way to reach the stream, so units written
//! by different producers never interleave.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Identifies a producer competing for the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HolderId(u64);

impl HolderId {
    /// Fresh process-unique holder id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        HolderId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "holder-{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StreamLockError {
    /// The holder already owns the lock.
    #[error("{0} already holds the stream lock")]
    Reentrant(HolderId),
    /// The lock was closed because the connection terminated.
    #[error("stream lock closed")]
    Closed,
}

struct LockState {
    owner: Option<HolderId>,
    waiters: VecDeque<HolderId>,
    closed: bool,
}

/// Exclusive access to an output stream `W`.
pub struct StreamLock<W> {
    state: Mutex<LockState>,
    wake: Condvar,
    stream: Mutex<W>,
}

impl<W: Write> StreamLock<W> {
    pub fn new(stream: W) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LockState {
                owner: None,
                waiters: VecDeque::new(),
                closed: false,
            }),
            wake: Condvar::new(),
            stream: Mutex::new(stream),
        })
    }

    /// Take ownership for `holder`, waiting in FIFO order behind other holders.
    ///
    /// After every wake-up the holder re-checks ownership instead of assuming it.
    pub fn acquire(self: &Arc<Self>, holder: HolderId) -> Result<StreamGuard<W>, StreamLockError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StreamLockError::Closed);
        }
        if state.owner == Some(holder) {
            return Err(StreamLockError::Reentrant(holder));
        }
        if state.owner.is_none() && state.waiters.is_empty() {
            state.owner = Some(holder);
            return Ok(self.guard(holder));
        }

        state.waiters.push_back(holder);
        tracing::debug!(%holder, waiters = state.waiters.len(), "waiting for stream access");
        loop {
            self.wake.wait(&mut state);
            if state.closed {
                state.waiters.retain(|h| *h != holder);
                return Err(StreamLockError::Closed);
            }
            if state.owner.is_none() && state.waiters.front() == Some(&holder) {
                state.waiters.pop_front();
                state.owner = Some(holder);
                tracing::debug!(%holder, "got stream access after waiting");
                return Ok(self.guard(holder));
            }
        }
    }

    /// Current owner, if any.
    pub fn owner(&self) -> Option<HolderId> {
        self.state.lock().owner
    }

    /// Number of holders waiting.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Wake all waiters with `Closed` and refuse later acquisitions.
    /// The current owner keeps its guard until it drops it.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.wake.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn guard(self: &Arc<Self>, holder: HolderId) -> StreamGuard<W> {
        StreamGuard {
            lock: self.clone(),
            holder,
        }
    }

    fn release(&self, holder: HolderId) {
        let mut state = self.state.lock();
        if state.owner == Some(holder) {
            state.owner = None;
            if !state.waiters.is_empty() {
                tracing::debug!(%holder, "wake waiting stream holder");
                self.wake.notify_all();
            }
        }
    }
}

/// Ownership of the stream. Writes go straight to the stream; dropping releases the lock.
pub struct StreamGuard<W: Write> {
    lock: Arc<StreamLock<W>>,
    holder: HolderId,
}

impl<W: Write> StreamGuard<W> {
    pub fn holder(&self) -> HolderId {
        self.holder
    }
}

impl<W: Write> Write for StreamGuard<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock.stream.lock().write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.lock.stream.lock().write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock.stream.lock().flush()
    }
}

impl<W: Write> Drop for StreamGuard<W> {
    fn drop(&mut self) {
        self.lock.release(self.holder);
    }
}
