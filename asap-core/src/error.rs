//! Error taxonomy shared by connections, the wire codec and engines.

use std::io;
use std::time::Duration;

use crate::storage::StorageError;
use crate::stream_lock::StreamLockError;
use crate::watchdog::WatchdogError;

/// Result type for ASAP operations.
pub type AsapResult<T> = Result<T, AsapError>;

/// Errors surfaced by the protocol engine.
///
/// Fatality depends on where the fault occurs: see [`AsapError::is_transport`]
/// and the connection module.
#[derive(Debug, thiserror::Error)]
pub enum AsapError {
    /// IO-level fault on the stream. Always fatal for a connection.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Malformed or unexpected unit.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A watched unit of work did not finish in time.
    #[error("{task} exceeded max execution time of {} ms", .max.as_millis())]
    ExecTimeExceeded { task: &'static str, max: Duration },

    /// Connection was terminated explicitly.
    #[error("connection killed: {0}")]
    Killed(String),

    /// Engine storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl AsapError {
    /// True for IO-level faults.
    pub fn is_transport(&self) -> bool {
        matches!(self, AsapError::Transport(_))
    }

    /// True for malformed-unit faults.
    pub fn is_protocol(&self) -> bool {
        matches!(self, AsapError::Protocol(_))
    }

    pub(crate) fn killed_from_outside() -> Self {
        AsapError::Killed("kill called from outside asap connection".into())
    }
}

impl From<WatchdogError> for AsapError {
    fn from(e: WatchdogError) -> Self {
        match e {
            WatchdogError::Timeout { task, max } => AsapError::ExecTimeExceeded { task, max },
            WatchdogError::Interrupted { .. } => AsapError::killed_from_outside(),
            WatchdogError::Panicked { .. } => AsapError::Protocol(e.to_string()),
            WatchdogError::Spawn { .. } => {
                AsapError::Transport(io::Error::new(io::ErrorKind::Other, e.to_string()))
            }
        }
    }
}

impl From<StreamLockError> for AsapError {
    fn from(e: StreamLockError) -> Self {
        match e {
            StreamLockError::Closed => AsapError::Killed(e.to_string()),
            StreamLockError::Reentrant(_) => AsapError::Protocol(e.to_string()),
        }
    }
}
