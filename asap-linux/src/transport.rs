//! TCP transport: accept and dial peers, run one persistent connection per stream.

use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use asap_core::{
    AsapError, ConnectionBuilder, ConnectionHandle, ConnectionListener, StorageEngine,
};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct Live {
    handle: ConnectionHandle,
    addr: String,
    socket: std::net::TcpStream,
}

/// Local node: the storage engine plus every live connection.
///
/// Forwards connection events to the engine and closes the socket of a
/// terminated connection.
pub struct Node {
    engine: Arc<StorageEngine>,
    max_execution_time: Duration,
    live: Mutex<HashMap<Uuid, Live>>,
}

impl Node {
    pub fn new(engine: Arc<StorageEngine>, max_execution_time: Duration) -> Arc<Self> {
        Arc::new(Self {
            engine,
            max_execution_time,
            live: Mutex::new(HashMap::new()),
        })
    }

    /// Number of live connections.
    pub fn connections(&self) -> usize {
        self.live.lock().len()
    }

    /// Run a persistent connection over `stream` on a blocking worker.
    pub fn attach(self: &Arc<Self>, stream: TcpStream, addr: String) -> std::io::Result<ConnectionHandle> {
        let socket = stream.into_std()?;
        socket.set_nonblocking(false)?;
        let input = socket.try_clone()?;
        let output = socket.try_clone()?;
        let listener: Arc<dyn ConnectionListener> = self.clone();
        let connection = ConnectionBuilder::new(self.engine.clone())
            .max_execution_time(self.max_execution_time)
            .listener(listener)
            .build(input, output);
        let handle = connection.handle();
        self.live.lock().insert(
            handle.id(),
            Live {
                handle: handle.clone(),
                addr: addr.clone(),
                socket,
            },
        );
        tracing::debug!(connection = %handle.id(), %addr, "connection attached");
        tokio::task::spawn_blocking(move || connection.run());
        Ok(handle)
    }

    /// Kill every live connection.
    pub fn kill_all(&self) {
        let handles: Vec<ConnectionHandle> =
            self.live.lock().values().map(|l| l.handle.clone()).collect();
        for handle in handles {
            handle.kill();
        }
    }
}

impl ConnectionListener for Node {
    fn connection_started(&self, remote_peer: &str, connection: &ConnectionHandle) {
        self.engine.connection_started(remote_peer, connection);
    }

    fn connection_terminated(&self, cause: &AsapError, connection: &ConnectionHandle) {
        self.engine.connection_terminated(cause, connection);
        if let Some(live) = self.live.lock().remove(&connection.id()) {
            tracing::info!(addr = %live.addr, peer = connection.remote_peer().unwrap_or("unknown"), "closing socket");
            let _ = live.socket.shutdown(Shutdown::Both);
        }
    }
}

/// Accept connections on `listen_port` and dial `peers` once.
pub async fn run_transport(node: Arc<Node>, listen_port: u16, peers: Vec<String>) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", listen_port)).await?;
    tracing::info!(port = listen_port, "listening for peers");

    for peer in peers {
        let node = node.clone();
        tokio::spawn(async move { dial(node, peer).await });
    }

    loop {
        let (stream, addr) = listener.accept().await?;
        accepted(&node, stream, addr);
    }
}

fn accepted(node: &Arc<Node>, stream: TcpStream, addr: SocketAddr) {
    tracing::info!(%addr, "peer connected to us");
    if let Err(e) = node.attach(stream, addr.to_string()) {
        tracing::warn!(%addr, error = %e, "could not attach incoming connection");
    }
}

async fn dial(node: Arc<Node>, peer: String) {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&peer)).await {
        Ok(Ok(stream)) => {
            tracing::info!(%peer, "connected to peer");
            if let Err(e) = node.attach(stream, peer.clone()) {
                tracing::warn!(%peer, error = %e, "could not attach outgoing connection");
            }
        }
        Ok(Err(e)) => tracing::warn!(%peer, error = %e, "could not connect to peer"),
        Err(_) => tracing::warn!(%peer, "connect timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asap_core::ChunkStorage;

    fn node(dir: &std::path::Path, owner: &str) -> (Arc<ChunkStorage>, Arc<Node>) {
        let storage = Arc::new(ChunkStorage::create(owner, dir.join(owner), "chat").unwrap());
        let engine = Arc::new(StorageEngine::new(owner).with_storage(storage.clone()));
        (storage, Node::new(engine, Duration::from_secs(2)))
    }

    async fn eventually(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        done()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dialed_peer_receives_content() {
        let dir = tempfile::tempdir().unwrap();
        let (alice_storage, alice) = node(dir.path(), "Alice");
        let (bob_storage, bob) = node(dir.path(), "Bob");
        alice_storage.add("abcChat", "Hi Bob").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        dial(bob.clone(), addr.to_string()).await;
        let (stream, from) = accept.await.unwrap();
        accepted(&alice, stream, from);

        assert!(
            eventually(|| !bob_storage
                .incoming("Alice")
                .chunk("abcChat", 0)
                .unwrap()
                .is_empty())
            .await
        );
        assert_eq!(alice.connections(), 1);
        assert_eq!(bob.connections(), 1);

        bob.kill_all();
        assert_eq!(bob.connections(), 0);
        assert_eq!(bob_storage.era(), 1);
        // bob closed the socket, alice sees end of stream
        assert!(eventually(|| alice.connections() == 0).await);
    }
}
