//! Persistent connection: one duplex stream to one peer, kept open until killed.
//!
//! Lifecycle: introduction offer, interests, then a read loop. Every received PDU
//! is handed to the engine and its dispatch task runs under the stream lock with
//! a soft deadline. Online message sources are drained whenever the stream is free.

use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{AsapError, AsapResult};
use crate::online::{OnlineMessageSource, OnlineQueue};
use crate::protocol::Pdu;
use crate::stream_lock::{HolderId, StreamGuard, StreamLock};
use crate::watchdog::{Observed, Watchdog, WatchdogError};
use crate::wire;

/// Default soft deadline for reading and dispatching one PDU.
pub const DEFAULT_MAX_EXECUTION_TIME: Duration = Duration::from_secs(30);

const READ_TASK: &str = "pdu reader";
const DISPATCH_TASK: &str = "pdu dispatch";

type Output = Box<dyn Write + Send>;

/// Observer of connection lifecycle events.
pub trait ConnectionListener: Send + Sync {
    /// The remote peer was identified by its first PDU. Fired once per connection.
    fn connection_started(&self, remote_peer: &str, connection: &ConnectionHandle);

    /// The connection terminated with `cause`. Fired once per connection.
    fn connection_terminated(&self, cause: &AsapError, connection: &ConnectionHandle);
}

/// Notified once when a connection's threads are done with it.
pub trait ThreadFinishedListener: Send + Sync {
    fn finished(&self, connection: &ConnectionHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Introducing,
    ExchangingInterests,
    Reading,
    Dispatching,
    Terminated,
}

struct Shared {
    id: Uuid,
    remote_peer: OnceLock<String>,
    terminated: AtomicBool,
    state: Mutex<ConnectionState>,
    stream: Arc<StreamLock<Output>>,
    watchdog: Watchdog,
    online: OnlineQueue,
    listener: Option<Arc<dyn ConnectionListener>>,
    thread_finished: Option<Arc<dyn ThreadFinishedListener>>,
    max_execution_time: Duration,
}

/// Cloneable handle on a running connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    /// Process-unique connection id.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Peer name taken from the first PDU received. `None` until then.
    pub fn remote_peer(&self) -> Option<&str> {
        self.shared.remote_peer.get().map(String::as_str)
    }

    /// Connections are never signed at this layer.
    pub fn is_signed(&self) -> bool {
        false
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn max_execution_time(&self) -> Duration {
        self.shared.max_execution_time
    }

    /// Terminate from outside the connection.
    pub fn kill(&self) {
        self.kill_with(AsapError::killed_from_outside());
    }

    /// Terminate with `cause`. Only the first call has an effect.
    ///
    /// Releases every watchdog and stream lock wait and notifies the listeners.
    /// The underlying stream is left to its owner.
    pub fn kill_with(&self, cause: AsapError) {
        if self
            .shared
            .terminated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(connection = %self.id(), %cause, "already terminated");
            return;
        }
        *self.shared.state.lock() = ConnectionState::Terminated;
        tracing::info!(
            connection = %self.id(),
            peer = self.remote_peer().unwrap_or("unknown"),
            %cause,
            "connection terminated"
        );
        self.shared.watchdog.interrupt();
        self.shared.stream.close();
        self.shared.online.clear();
        if let Some(listener) = &self.shared.listener {
            listener.connection_terminated(&cause, self);
        }
        if let Some(finished) = &self.shared.thread_finished {
            finished.finished(self);
        }
    }

    /// Register `source`; it is served the next time the stream is free.
    pub fn add_online_message_source(&self, source: Arc<dyn OnlineMessageSource>) {
        if self.is_terminated() {
            tracing::debug!(connection = %self.id(), "connection terminated, online source dropped");
            return;
        }
        let claimed = self.shared.online.push(source.clone());
        // killed between the check and the push
        if self.is_terminated() {
            self.shared.online.remove(&source);
            if claimed {
                self.shared.online.abandon_drain();
            }
            return;
        }
        if claimed {
            self.start_drain();
        }
    }

    /// Unregister `source`. Returns whether it was still waiting.
    pub fn remove_online_message_source(&self, source: &Arc<dyn OnlineMessageSource>) -> bool {
        self.shared.online.remove(source)
    }

    pub(crate) fn set_remote_peer(&self, peer: &str) {
        if self.shared.remote_peer.set(peer.to_string()).is_ok() {
            tracing::info!(connection = %self.id(), peer, "remote peer identified");
            if let Some(listener) = &self.shared.listener {
                listener.connection_started(peer, self);
            }
        } else if self.remote_peer() != Some(peer) {
            tracing::debug!(connection = %self.id(), declared = peer, "pdu from other sender than remote peer");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.shared.state.lock();
        if *current != ConnectionState::Terminated {
            *current = state;
        }
    }

    fn acquire_stream(&self) -> AsapResult<StreamGuard<Output>> {
        let guard = self.shared.stream.acquire(HolderId::next())?;
        if self.is_terminated() {
            return Err(AsapError::killed_from_outside());
        }
        Ok(guard)
    }

    fn kick_online(&self) {
        if self.shared.online.try_claim_drain() {
            self.start_drain();
        }
    }

    fn start_drain(&self) {
        let handle = self.clone();
        let spawned = thread::Builder::new()
            .name("asap-online-drain".into())
            .spawn(move || handle.drain_online());
        if let Err(e) = spawned {
            tracing::warn!(connection = %self.id(), error = %e, "could not start online drain");
            self.shared.online.abandon_drain();
        }
    }

    fn drain_online(&self) {
        while let Some(batch) = self.shared.online.next_batch() {
            let mut guard = match self.acquire_stream() {
                Ok(guard) => guard,
                Err(e) => {
                    tracing::debug!(connection = %self.id(), error = %e, "online drain stopped");
                    self.shared.online.abandon_drain();
                    return;
                }
            };
            tracing::debug!(connection = %self.id(), sources = batch.len(), "sending online messages");
            for source in batch {
                match source.send_messages(self, &mut guard) {
                    Ok(()) => {}
                    Err(e) if e.is_transport() => {
                        drop(guard);
                        self.kill_with(e);
                        self.shared.online.abandon_drain();
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(connection = %self.id(), error = %e, "online message source failed");
                    }
                }
            }
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id())
            .field("remote_peer", &self.remote_peer())
            .field("state", &self.state())
            .finish()
    }
}

/// Builder for [`PersistentConnection`].
pub struct ConnectionBuilder {
    engine: Arc<dyn Engine>,
    max_execution_time: Duration,
    listener: Option<Arc<dyn ConnectionListener>>,
    thread_finished: Option<Arc<dyn ThreadFinishedListener>>,
}

impl ConnectionBuilder {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            max_execution_time: DEFAULT_MAX_EXECUTION_TIME,
            listener: None,
            thread_finished: None,
        }
    }

    /// Soft deadline for reading one PDU and for dispatching one PDU.
    pub fn max_execution_time(mut self, max: Duration) -> Self {
        self.max_execution_time = max;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn thread_finished_listener(mut self, listener: Arc<dyn ThreadFinishedListener>) -> Self {
        self.thread_finished = Some(listener);
        self
    }

    /// Bind the connection to a duplex stream split into `input` and `output`.
    pub fn build<R, W>(self, input: R, output: W) -> PersistentConnection<R>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let output: Output = Box::new(output);
        let handle = ConnectionHandle {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                remote_peer: OnceLock::new(),
                terminated: AtomicBool::new(false),
                state: Mutex::new(ConnectionState::Created),
                stream: StreamLock::new(output),
                watchdog: Watchdog::new(),
                online: OnlineQueue::new(),
                listener: self.listener,
                thread_finished: self.thread_finished,
                max_execution_time: self.max_execution_time,
            }),
        };
        PersistentConnection {
            handle,
            engine: self.engine,
            input,
        }
    }
}

/// A connection that has not started running yet.
pub struct PersistentConnection<R> {
    handle: ConnectionHandle,
    engine: Arc<dyn Engine>,
    input: R,
}

type PendingRead<R> = Observed<(R, AsapResult<Pdu>)>;

impl<R: Read + Send + 'static> PersistentConnection<R> {
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Run on a new thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        let id = self.handle.id().simple().to_string();
        thread::Builder::new()
            .name(format!("asap-connection-{}", &id[..8]))
            .spawn(move || self.run())
    }

    /// Run on the calling thread until the connection terminates.
    pub fn run(self) {
        let PersistentConnection {
            handle,
            engine,
            input,
        } = self;
        tracing::debug!(connection = %handle.id(), "connection running");
        if let Err(cause) = start(&handle, engine.as_ref()) {
            handle.kill_with(cause);
            return;
        }
        read_loop(&handle, engine.as_ref(), input);
        tracing::debug!(connection = %handle.id(), "read loop finished");
    }
}

fn start(handle: &ConnectionHandle, engine: &dyn Engine) -> AsapResult<()> {
    if let Some(owner) = engine.owner().filter(|o| !o.is_empty()) {
        handle.set_state(ConnectionState::Introducing);
        let mut guard = handle.acquire_stream()?;
        match wire::write_pdu(&mut guard, &Pdu::introduction(&owner)) {
            Ok(()) => tracing::debug!(connection = %handle.id(), %owner, "introduction sent"),
            Err(e) if e.is_transport() => return Err(e),
            Err(e) => tracing::warn!(connection = %handle.id(), error = %e, "introduction offer rejected"),
        }
    }
    handle.set_state(ConnectionState::ExchangingInterests);
    let mut guard = handle.acquire_stream()?;
    engine.push_interests(&mut guard)
}

fn read_loop<R: Read + Send + 'static>(handle: &ConnectionHandle, engine: &dyn Engine, input: R) {
    let max = handle.max_execution_time();
    let watchdog = handle.shared.watchdog.clone();
    let mut input = Some(input);
    let mut pending: Option<PendingRead<R>> = None;

    while !handle.is_terminated() {
        handle.set_state(ConnectionState::Reading);
        let mut reading = match pending.take() {
            Some(reading) => reading,
            None => {
                let Some(mut stream) = input.take() else {
                    break;
                };
                let spawned = watchdog.spawn(READ_TASK, move || {
                    let result = wire::read_pdu(&mut stream);
                    (stream, result)
                });
                match spawned {
                    Ok(reading) => reading,
                    Err(e) => {
                        handle.kill_with(e.into());
                        break;
                    }
                }
            }
        };

        let pdu = match watchdog.observe(&mut reading, max) {
            Ok((stream, Ok(pdu))) => {
                input = Some(stream);
                pdu
            }
            Ok((_, Err(cause))) => {
                handle.kill_with(cause);
                break;
            }
            Err(WatchdogError::Timeout { .. }) => {
                tracing::debug!(connection = %handle.id(), "no pdu within max execution time, keep waiting");
                pending = Some(reading);
                continue;
            }
            Err(WatchdogError::Interrupted { .. }) => break,
            Err(e) => {
                handle.kill_with(e.into());
                break;
            }
        };
        if handle.is_terminated() {
            break;
        }

        handle.set_remote_peer(pdu.sender());
        tracing::debug!(connection = %handle.id(), kind = pdu.kind(), sender = pdu.sender(), "pdu received");
        let task = engine.executor_task(pdu, handle);

        let guard = match handle.acquire_stream() {
            Ok(guard) => guard,
            Err(_) => break,
        };
        handle.set_state(ConnectionState::Dispatching);
        // the guard moves into the dispatch unit: a timed-out unit keeps the stream until it ends
        let outcome = watchdog.run_observed(
            DISPATCH_TASK,
            move || {
                let mut guard = guard;
                let result = task(&mut guard);
                drop(guard);
                result
            },
            max,
        );
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_transport() => {
                handle.kill_with(e);
                break;
            }
            Ok(Err(e)) => {
                tracing::warn!(connection = %handle.id(), error = %e, "pdu dispatch failed, keep reading");
            }
            Err(WatchdogError::Interrupted { .. }) => break,
            Err(e @ WatchdogError::Panicked { .. }) => {
                tracing::warn!(connection = %handle.id(), error = %e, "pdu dispatch failed, keep reading");
            }
            Err(e) => {
                handle.kill_with(e.into());
                break;
            }
        }

        handle.kick_online();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DispatchTask;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;

    struct Silent;

    impl Engine for Silent {
        fn owner(&self) -> Option<String> {
            None
        }

        fn push_interests(&self, _out: &mut dyn Write) -> AsapResult<()> {
            Ok(())
        }

        fn executor_task(&self, _pdu: Pdu, _connection: &ConnectionHandle) -> DispatchTask {
            Box::new(|_out: &mut dyn Write| -> AsapResult<()> { Ok(()) })
        }
    }

    #[derive(Default)]
    struct Counting {
        started: AtomicUsize,
        terminated: AtomicUsize,
        finished: AtomicUsize,
    }

    impl ConnectionListener for Counting {
        fn connection_started(&self, _remote_peer: &str, _connection: &ConnectionHandle) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn connection_terminated(&self, _cause: &AsapError, _connection: &ConnectionHandle) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl ThreadFinishedListener for Counting {
        fn finished(&self, _connection: &ConnectionHandle) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn idle_connection(counting: &Arc<Counting>) -> PersistentConnection<Cursor<Vec<u8>>> {
        ConnectionBuilder::new(Arc::new(Silent))
            .listener(counting.clone())
            .thread_finished_listener(counting.clone())
            .build(Cursor::new(Vec::<u8>::new()), Vec::<u8>::new())
    }

    #[test]
    fn kill_is_idempotent() {
        let counting = Arc::new(Counting::default());
        let handle = idle_connection(&counting).handle();
        assert_eq!(handle.state(), ConnectionState::Created);
        handle.kill();
        handle.kill();
        handle.kill_with(AsapError::Protocol("late".into()));
        assert!(handle.is_terminated());
        assert_eq!(handle.state(), ConnectionState::Terminated);
        assert_eq!(counting.terminated.load(Ordering::SeqCst), 1);
        assert_eq!(counting.finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remote_peer_is_set_once() {
        let counting = Arc::new(Counting::default());
        let handle = idle_connection(&counting).handle();
        assert_eq!(handle.remote_peer(), None);
        handle.set_remote_peer("Alice");
        handle.set_remote_peer("Mallory");
        assert_eq!(handle.remote_peer(), Some("Alice"));
        assert_eq!(counting.started.load(Ordering::SeqCst), 1);
        assert!(!handle.is_signed());
    }

    #[test]
    fn end_of_input_terminates() {
        let counting = Arc::new(Counting::default());
        let connection = idle_connection(&counting);
        let handle = connection.handle();
        connection.run();
        assert!(handle.is_terminated());
        assert_eq!(counting.terminated.load(Ordering::SeqCst), 1);
        assert_eq!(counting.started.load(Ordering::SeqCst), 0);
    }

    struct Idle;

    impl OnlineMessageSource for Idle {
        fn send_messages(&self, _connection: &ConnectionHandle, _out: &mut dyn Write) -> AsapResult<()> {
            Ok(())
        }
    }

    #[test]
    fn terminated_connection_takes_no_online_sources() {
        let counting = Arc::new(Counting::default());
        let handle = idle_connection(&counting).handle();
        handle.kill();
        for _ in 0..3 {
            handle.add_online_message_source(Arc::new(Idle));
        }
        assert!(handle.shared.online.is_empty());
        assert!(!handle.shared.online.is_draining());
    }

    #[test]
    fn kill_drops_waiting_online_sources() {
        let counting = Arc::new(Counting::default());
        let handle = idle_connection(&counting).handle();
        // queued without a drain, as if the drain thread had not started yet
        handle.shared.online.push(Arc::new(Idle));
        assert_eq!(handle.shared.online.len(), 1);
        handle.kill();
        assert!(handle.shared.online.is_empty());
    }

    #[test]
    fn terminated_state_is_final() {
        let counting = Arc::new(Counting::default());
        let handle = idle_connection(&counting).handle();
        handle.kill();
        handle.set_state(ConnectionState::Reading);
        assert_eq!(handle.state(), ConnectionState::Terminated);
    }
}
