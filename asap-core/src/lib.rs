//! ASAP protocol engine: era-addressed store-and-forward over persistent peer connections.
//! Blocking I/O on std threads; the host supplies the duplex stream and the engine.

pub mod connection;
pub mod engine;
pub mod era;
pub mod error;
pub mod online;
pub mod protocol;
pub mod storage;
pub mod stream_lock;
pub mod util;
pub mod watchdog;
pub mod wire;

pub use connection::{
    ConnectionBuilder, ConnectionHandle, ConnectionListener, ConnectionState,
    PersistentConnection, ThreadFinishedListener, DEFAULT_MAX_EXECUTION_TIME,
};
pub use engine::{DispatchTask, Engine, StorageEngine};
pub use era::{Era, INITIAL_ERA, MAX_ERA};
pub use error::{AsapError, AsapResult};
pub use online::OnlineMessageSource;
pub use protocol::{Pdu, PROTOCOL_VERSION};
pub use storage::{ChunkStorage, Delivery, OutgoingChunk, StorageError};
pub use wire::{decode_frame, encode_frame, read_pdu, write_pdu, FrameDecodeError, FrameEncodeError};
