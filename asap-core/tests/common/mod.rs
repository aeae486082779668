#![allow(dead_code)]

use std::io::{self, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use asap_core::{
    AsapError, ChunkStorage, ConnectionBuilder, ConnectionHandle, ConnectionListener,
    StorageEngine, ThreadFinishedListener,
};
use parking_lot::Mutex;

/// Connected loopback TCP pair.
pub fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

/// Records lifecycle events and forwards them to an optional engine.
#[derive(Default)]
pub struct Recorder {
    pub engine: Option<Arc<StorageEngine>>,
    pub started: Mutex<Vec<String>>,
    pub causes: Mutex<Vec<String>>,
    pub finished: AtomicUsize,
}

impl Recorder {
    pub fn forwarding(engine: Arc<StorageEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine: Some(engine),
            ..Default::default()
        })
    }

    pub fn causes(&self) -> Vec<String> {
        self.causes.lock().clone()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl ConnectionListener for Recorder {
    fn connection_started(&self, remote_peer: &str, connection: &ConnectionHandle) {
        self.started.lock().push(remote_peer.to_string());
        if let Some(engine) = &self.engine {
            engine.connection_started(remote_peer, connection);
        }
    }

    fn connection_terminated(&self, cause: &AsapError, connection: &ConnectionHandle) {
        self.causes.lock().push(format!("{:?}", cause));
        if let Some(engine) = &self.engine {
            engine.connection_terminated(cause, connection);
        }
    }
}

impl ThreadFinishedListener for Recorder {
    fn finished(&self, _connection: &ConnectionHandle) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

/// Writer whose bytes stay inspectable after it is moved into a connection.
#[derive(Clone, Default)]
pub struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A node: one chat storage served by a storage engine.
pub struct Node {
    pub storage: Arc<ChunkStorage>,
    pub engine: Arc<StorageEngine>,
}

impl Node {
    pub fn new(dir: &Path, owner: &str) -> Self {
        let storage = Arc::new(ChunkStorage::create(owner, dir.join(owner), "chat").unwrap());
        let engine = Arc::new(StorageEngine::new(owner).with_storage(storage.clone()));
        Self { storage, engine }
    }

    /// Run a connection over `stream` on its own thread.
    pub fn connect(&self, stream: &TcpStream) -> (ConnectionHandle, Arc<Recorder>) {
        let recorder = Recorder::forwarding(self.engine.clone());
        let connection = ConnectionBuilder::new(self.engine.clone())
            .max_execution_time(Duration::from_secs(2))
            .listener(recorder.clone())
            .thread_finished_listener(recorder.clone())
            .build(stream.try_clone().unwrap(), stream.try_clone().unwrap());
        let handle = connection.handle();
        connection.spawn().unwrap();
        (handle, recorder)
    }
}

pub fn shutdown(streams: &[&TcpStream]) {
    for stream in streams {
        let _ = stream.shutdown(Shutdown::Both);
    }
}
