//! Engine: what a connection does with the PDUs it reads.
//!
//! A connection only moves PDUs. The [`Engine`] decides what to announce when a
//! connection starts and turns every received PDU into a [`DispatchTask`] that
//! runs with exclusive access to the output stream.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

use crate::connection::{ConnectionHandle, ConnectionListener};
use crate::error::AsapError;
use crate::protocol::Pdu;
use crate::storage::ChunkStorage;
use crate::wire;

/// Work for one received PDU. Runs on its own thread; `out` is the locked output stream.
pub type DispatchTask = Box<dyn FnOnce(&mut dyn Write) -> Result<(), AsapError> + Send>;

/// Protocol engine collaborator of a connection.
pub trait Engine: Send + Sync {
    /// Local peer name, announced in the introduction offer. `None` or empty skips it.
    fn owner(&self) -> Option<String>;

    /// Write the interests of this node. Called once per connection, under the stream lock.
    fn push_interests(&self, out: &mut dyn Write) -> Result<(), AsapError>;

    /// Work to run for `pdu` received on `connection`.
    fn executor_task(&self, pdu: Pdu, connection: &ConnectionHandle) -> DispatchTask;
}

/// Engine over one [`ChunkStorage`] per format.
///
/// Answers interests with the chunks the asking peer has not seen yet and
/// stores assimilated content as received from its sender.
pub struct StorageEngine {
    owner: String,
    storages: BTreeMap<String, Arc<ChunkStorage>>,
}

impl StorageEngine {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            storages: BTreeMap::new(),
        }
    }

    /// Serve `storage` for its format.
    pub fn with_storage(mut self, storage: Arc<ChunkStorage>) -> Self {
        self.storages.insert(storage.format(), storage);
        self
    }

    pub fn storage(&self, format: &str) -> Option<Arc<ChunkStorage>> {
        self.storages.get(format).cloned()
    }

    pub fn formats(&self) -> impl Iterator<Item = &str> {
        self.storages.keys().map(String::as_str)
    }

    fn storage_for(&self, format: &str) -> Result<Arc<ChunkStorage>, AsapError> {
        self.storage(format)
            .ok_or_else(|| AsapError::Protocol(format!("no storage for format {}", format)))
    }
}

impl Engine for StorageEngine {
    fn owner(&self) -> Option<String> {
        Some(self.owner.clone()).filter(|o| !o.is_empty())
    }

    fn push_interests(&self, out: &mut dyn Write) -> Result<(), AsapError> {
        for (format, storage) in &self.storages {
            storage.begin_session()?;
            wire::write_pdu(
                out,
                &Pdu::Interest {
                    sender: self.owner.clone(),
                    format: format.clone(),
                },
            )?;
            tracing::debug!(owner = %self.owner, %format, "interest sent");
        }
        Ok(())
    }

    fn executor_task(&self, pdu: Pdu, connection: &ConnectionHandle) -> DispatchTask {
        let owner = self.owner.clone();
        let connection_id = connection.id();
        match pdu {
            Pdu::Offer {
                sender, format, uri, ..
            } => Box::new(move |_out: &mut dyn Write| -> Result<(), AsapError> {
                tracing::debug!(connection = %connection_id, %sender, %format, %uri, "offer received");
                Ok(())
            }),
            Pdu::Interest { sender, format } => {
                let storage = self.storage_for(&format);
                Box::new(move |out: &mut dyn Write| -> Result<(), AsapError> {
                    let storage = storage?;
                    let delivery = storage.outgoing_for(&sender)?;
                    tracing::debug!(
                        connection = %connection_id,
                        peer = %sender,
                        %format,
                        chunks = delivery.chunks.len(),
                        "answering interest"
                    );
                    for chunk in delivery.chunks {
                        wire::write_pdu(
                            out,
                            &Pdu::Assimilate {
                                sender: owner.clone(),
                                format: format.clone(),
                                uri: chunk.uri,
                                era: chunk.era,
                                messages: chunk.messages,
                            },
                        )?;
                    }
                    // only a complete delivery moves the peer's mark
                    if let Some(through) = delivery.through {
                        storage.mark_sent(&sender, through)?;
                    }
                    Ok(())
                })
            }
            Pdu::Assimilate {
                sender,
                format,
                uri,
                era,
                messages,
            } => {
                let storage = self.storage_for(&format);
                Box::new(move |_out: &mut dyn Write| -> Result<(), AsapError> {
                    let storage = storage?;
                    if sender == owner {
                        return Err(AsapError::Protocol(format!(
                            "peer sent own content of {} back",
                            owner
                        )));
                    }
                    tracing::debug!(
                        connection = %connection_id,
                        %sender,
                        %uri,
                        remote_era = era,
                        messages = messages.len(),
                        "assimilate"
                    );
                    storage.store_received(&sender, &uri, messages)?;
                    Ok(())
                })
            }
        }
    }
}

impl ConnectionListener for StorageEngine {
    fn connection_started(&self, remote_peer: &str, connection: &ConnectionHandle) {
        tracing::info!(owner = %self.owner, peer = %remote_peer, connection = %connection.id(), "peer connected");
    }

    fn connection_terminated(&self, cause: &AsapError, connection: &ConnectionHandle) {
        tracing::info!(owner = %self.owner, connection = %connection.id(), %cause, "session closed");
        for (format, storage) in &self.storages {
            if let Err(e) = storage.end_session() {
                tracing::warn!(%format, error = %e, "could not close storage session");
            }
        }
    }
}
