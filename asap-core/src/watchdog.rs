//! Watchdog executor: run a unit of work on its own thread and wait for it with a soft deadline.
//!
//! A timeout only ends the wait. The work is never preempted: it keeps running and
//! its side effects stay valid, the caller just stops observing it. The caller
//! decides whether a timeout is fatal.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Why an observed wait ended without a result.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WatchdogError {
    #[error("{task} exceeded max execution time of {} ms", .max.as_millis())]
    Timeout { task: &'static str, max: Duration },
    #[error("wait for {task} was interrupted")]
    Interrupted { task: &'static str },
    #[error("{task} panicked")]
    Panicked { task: &'static str },
    #[error("could not start {task}: {reason}")]
    Spawn { task: &'static str, reason: String },
}

struct WatchState {
    interrupted: bool,
}

struct Shared {
    state: Mutex<WatchState>,
    wake: Condvar,
}

impl Shared {
    /// Completion signal: wake whoever waits on this watchdog.
    fn signal(&self) {
        let _state = self.state.lock();
        self.wake.notify_all();
    }
}

type Slot<T> = Arc<Mutex<Option<thread::Result<T>>>>;

/// A unit of work started by [`Watchdog::spawn`]. Can be observed several times
/// until it delivers its result.
pub struct Observed<T> {
    task: &'static str,
    slot: Slot<T>,
    handle: Option<JoinHandle<()>>,
}

impl<T> Observed<T> {
    /// Label of the unit of work.
    pub fn task(&self) -> &'static str {
        self.task
    }

    /// True once the unit of work has delivered a result that was not taken yet.
    pub fn is_finished(&self) -> bool {
        self.slot.lock().is_some()
    }

    fn take(&mut self) -> Option<thread::Result<T>> {
        let result = self.slot.lock().take();
        if result.is_some() {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
        result
    }
}

/// Soft-deadline supervisor. One per connection; waits must not overlap.
#[derive(Clone)]
pub struct Watchdog {
    shared: Arc<Shared>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(WatchState { interrupted: false }),
                wake: Condvar::new(),
            }),
        }
    }

    /// Start `work` on a new thread. The thread signals this watchdog when it is done.
    pub fn spawn<T, F>(&self, task: &'static str, work: F) -> Result<Observed<T>, WatchdogError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let slot: Slot<T> = Arc::new(Mutex::new(None));
        let thread_slot = slot.clone();
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("asap-{}", task.replace(' ', "-")))
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(work));
                *thread_slot.lock() = Some(result);
                shared.signal();
            })
            .map_err(|e| WatchdogError::Spawn {
                task,
                reason: e.to_string(),
            })?;
        Ok(Observed {
            task,
            slot,
            handle: Some(handle),
        })
    }

    /// Wait up to `max` for `observed` to finish.
    ///
    /// On `Timeout` the work is still running and `observed` may be waited on again.
    pub fn observe<T>(
        &self,
        observed: &mut Observed<T>,
        max: Duration,
    ) -> Result<T, WatchdogError> {
        let task = observed.task;
        let deadline = Instant::now() + max;
        let mut state = self.shared.state.lock();
        loop {
            // slot is filled before the worker takes the state lock, so no wake-up is lost
            if observed.is_finished() {
                break;
            }
            if state.interrupted {
                return Err(WatchdogError::Interrupted { task });
            }
            if self.shared.wake.wait_until(&mut state, deadline).timed_out() {
                if observed.is_finished() {
                    break;
                }
                if state.interrupted {
                    return Err(WatchdogError::Interrupted { task });
                }
                tracing::debug!(task, max_ms = max.as_millis() as u64, "watchdog deadline passed");
                return Err(WatchdogError::Timeout { task, max });
            }
        }
        drop(state);
        match observed.take() {
            Some(Ok(value)) => Ok(value),
            Some(Err(_)) => Err(WatchdogError::Panicked { task }),
            None => Err(WatchdogError::Interrupted { task }),
        }
    }

    /// Start `work` and wait up to `max` for it. A timed-out unit keeps running detached.
    pub fn run_observed<T, F>(
        &self,
        task: &'static str,
        work: F,
        max: Duration,
    ) -> Result<T, WatchdogError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let mut observed = self.spawn(task, work)?;
        self.observe(&mut observed, max)
    }

    /// Release the current wait and make every later wait return `Interrupted`.
    pub fn interrupt(&self) {
        let mut state = self.shared.state.lock();
        state.interrupted = true;
        self.shared.wake.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        self.shared.state.lock().interrupted
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    #[test]
    fn completes_before_deadline() {
        let watchdog = Watchdog::new();
        let started = Instant::now();
        let value = watchdog
            .run_observed(
                "quick",
                || {
                    thread::sleep(Duration::from_millis(20));
                    42
                },
                Duration::from_secs(5),
            )
            .unwrap();
        assert_eq!(value, 42);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn timeout_does_not_stop_the_work() {
        let watchdog = Watchdog::new();
        let done = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let work_done = done.clone();
        let err = watchdog
            .run_observed(
                "slow",
                move || {
                    thread::sleep(Duration::from_millis(200));
                    work_done.store(true, Ordering::SeqCst);
                    let _ = tx.send(());
                },
                Duration::from_millis(20),
            )
            .unwrap_err();
        assert!(matches!(err, WatchdogError::Timeout { task: "slow", .. }));
        assert!(!done.load(Ordering::SeqCst));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn timed_out_work_can_be_observed_again() {
        let watchdog = Watchdog::new();
        let mut observed = watchdog
            .spawn("reader", || {
                thread::sleep(Duration::from_millis(100));
                "pdu"
            })
            .unwrap();
        let first = watchdog.observe(&mut observed, Duration::from_millis(10));
        assert!(matches!(first, Err(WatchdogError::Timeout { .. })));
        let second = watchdog.observe(&mut observed, Duration::from_secs(5));
        assert_eq!(second, Ok("pdu"));
    }

    #[test]
    fn interrupt_releases_waiter() {
        let watchdog = Watchdog::new();
        let waiter = watchdog.clone();
        let handle = thread::spawn(move || {
            waiter.run_observed(
                "blocked",
                || thread::sleep(Duration::from_millis(500)),
                Duration::from_secs(30),
            )
        });
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        watchdog.interrupt();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(WatchdogError::Interrupted { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));

        // later waits are interrupted too
        let again = watchdog.run_observed("after", || 1, Duration::from_secs(1));
        assert!(matches!(
            again,
            Err(WatchdogError::Interrupted { .. }) | Ok(1)
        ));
        assert!(watchdog.is_interrupted());
    }

    #[test]
    fn panic_is_reported() {
        let watchdog = Watchdog::new();
        let result: Result<(), _> =
            watchdog.run_observed("boom", || panic!("boom"), Duration::from_secs(5));
        assert_eq!(result, Err(WatchdogError::Panicked { task: "boom" }));
    }
}
