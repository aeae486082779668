//! Chunk storage: filesystem store of one owner's content for one format, grouped by era.
//!
//! Layout under the root folder:
//! - `meta`: bincode-encoded storage state
//! - `<era>/<uri>`: own chunks written in that era
//! - `incoming/<sender>/<era>/<uri>`: chunks received from `sender`, stored at the
//!   local era current when they arrived
//!
//! Path components are escaped with [`escape_file_name`].

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::era::{self, Era, INITIAL_ERA};
use crate::util::escape_file_name;

const META_FILE: &str = "meta";
const INCOMING_DIR: &str = "incoming";

/// Error in the chunk storage.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt storage file: {0}")]
    Corrupt(#[from] bincode::Error),
    #[error("no storage at {}", .0.display())]
    NotFound(PathBuf),
    #[error("storage at {} belongs to {found}, not {expected}", .root.display())]
    OwnerMismatch {
        root: PathBuf,
        expected: String,
        found: String,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StorageMeta {
    owner: String,
    format: String,
    era: Era,
    /// Local content was added since the last session started.
    changed: bool,
    /// Content was received during the running session.
    received: bool,
    send_received: bool,
    senders: BTreeSet<String>,
    /// Last era delivered to each peer.
    last_sent: BTreeMap<String, Era>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChunkFile {
    uri: String,
    messages: Vec<Vec<u8>>,
}

/// One chunk selected for delivery to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingChunk {
    pub uri: String,
    pub era: Era,
    pub messages: Vec<Vec<u8>>,
}

/// Chunks pending for one peer. Commit with [`ChunkStorage::mark_sent`] once they were written.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Delivery {
    pub chunks: Vec<OutgoingChunk>,
    /// Last era covered; `None` when no closed era is pending.
    pub through: Option<Era>,
}

/// Era-grouped content store for one owner and one format.
pub struct ChunkStorage {
    root: PathBuf,
    meta: Mutex<StorageMeta>,
}

impl ChunkStorage {
    /// Open the storage under `root`, creating a fresh one (at `INITIAL_ERA`) if none exists.
    pub fn create(
        owner: impl Into<String>,
        root: impl Into<PathBuf>,
        format: impl Into<String>,
    ) -> StorageResult<Self> {
        let owner = owner.into();
        let root = root.into();
        if root.join(META_FILE).exists() {
            let storage = Self::open(&root)?;
            let found = storage.owner();
            if found != owner {
                return Err(StorageError::OwnerMismatch {
                    root,
                    expected: owner,
                    found,
                });
            }
            return Ok(storage);
        }
        std::fs::create_dir_all(&root)?;
        let meta = StorageMeta {
            owner,
            format: format.into(),
            era: INITIAL_ERA,
            changed: false,
            received: false,
            send_received: false,
            senders: BTreeSet::new(),
            last_sent: BTreeMap::new(),
        };
        save_meta(&root, &meta)?;
        tracing::debug!(root = %root.display(), owner = %meta.owner, "created chunk storage");
        Ok(Self {
            root,
            meta: Mutex::new(meta),
        })
    }

    /// Open an existing storage.
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        let bytes = match std::fs::read(root.join(META_FILE)) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(root))
            }
            Err(e) => return Err(e.into()),
        };
        let meta: StorageMeta = bincode::deserialize(&bytes)?;
        Ok(Self {
            root,
            meta: Mutex::new(meta),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn owner(&self) -> String {
        self.meta.lock().owner.clone()
    }

    pub fn format(&self) -> String {
        self.meta.lock().format.clone()
    }

    /// Current (open) era. New content is written here.
    pub fn era(&self) -> Era {
        self.meta.lock().era
    }

    pub fn send_received(&self) -> bool {
        self.meta.lock().send_received
    }

    /// Whether received content is relayed to other peers as own content.
    pub fn set_send_received(&self, on: bool) -> StorageResult<()> {
        let mut meta = self.meta.lock();
        meta.send_received = on;
        save_meta(&self.root, &meta)
    }

    /// Append `message` to the own chunk `uri` of the current era.
    pub fn add(&self, uri: &str, message: impl AsRef<[u8]>) -> StorageResult<()> {
        let mut meta = self.meta.lock();
        let path = chunk_path(&self.root, meta.era, uri);
        append_chunk(&path, uri, vec![message.as_ref().to_vec()])?;
        meta.changed = true;
        save_meta(&self.root, &meta)
    }

    /// Messages of own chunk `uri` in `era`. Empty if there is no such chunk.
    pub fn chunk(&self, uri: &str, era: Era) -> StorageResult<Vec<Vec<u8>>> {
        Ok(read_chunk(&chunk_path(&self.root, era, uri))?.messages)
    }

    /// Eras holding own content.
    pub fn eras(&self) -> StorageResult<BTreeSet<Era>> {
        Ok(era::eras_present(&self.root)?)
    }

    /// Content received from `sender`.
    pub fn incoming(&self, sender: &str) -> IncomingChunks {
        IncomingChunks {
            sender: sender.to_string(),
            dir: incoming_dir(&self.root, sender),
        }
    }

    /// Peers content was received from.
    pub fn senders(&self) -> Vec<String> {
        self.meta.lock().senders.iter().cloned().collect()
    }

    /// Start of a sync session: close the current era if local content changed.
    pub fn begin_session(&self) -> StorageResult<()> {
        let mut meta = self.meta.lock();
        if meta.changed {
            meta.era = era::next_era(meta.era);
            meta.changed = false;
            tracing::debug!(owner = %meta.owner, era = meta.era, "new era after local changes");
            save_meta(&self.root, &meta)?;
        }
        Ok(())
    }

    /// End of a sync session: close the current era if content was received.
    pub fn end_session(&self) -> StorageResult<()> {
        let mut meta = self.meta.lock();
        if meta.received {
            meta.era = era::next_era(meta.era);
            meta.received = false;
            tracing::debug!(owner = %meta.owner, era = meta.era, "new era after receiving content");
            save_meta(&self.root, &meta)?;
        }
        Ok(())
    }

    /// Store `messages` received from `sender` at the current era.
    pub fn store_received(
        &self,
        sender: &str,
        uri: &str,
        messages: Vec<Vec<u8>>,
    ) -> StorageResult<()> {
        let mut meta = self.meta.lock();
        let path = chunk_path(&incoming_dir(&self.root, sender), meta.era, uri);
        append_chunk(&path, uri, messages)?;
        meta.senders.insert(sender.to_string());
        meta.received = true;
        save_meta(&self.root, &meta)
    }

    /// Chunks `peer` has not been sent yet, from closed eras only.
    ///
    /// The range starts after the last era delivered to `peer` (or at `INITIAL_ERA`)
    /// and ends at the era before the current one; it may wrap. With send-received
    /// on, chunks received from other senders are included as own content.
    /// Nothing is recorded until [`ChunkStorage::mark_sent`] is called.
    pub fn outgoing_for(&self, peer: &str) -> StorageResult<Delivery> {
        let meta = self.meta.lock();
        let from = meta
            .last_sent
            .get(peer)
            .map(|&e| era::next_era(e))
            .unwrap_or(INITIAL_ERA);
        if from == meta.era {
            return Ok(Delivery::default());
        }
        let to = era::previous_era(meta.era);

        let mut chunks = Vec::new();
        collect_chunks(&self.root, from, to, &mut chunks)?;
        if meta.send_received {
            for sender in meta.senders.iter().filter(|s| s.as_str() != peer) {
                collect_chunks(&incoming_dir(&self.root, sender), from, to, &mut chunks)?;
            }
        }
        Ok(Delivery {
            chunks,
            through: Some(to),
        })
    }

    /// Record every era up to `through` as delivered to `peer`.
    pub fn mark_sent(&self, peer: &str, through: Era) -> StorageResult<()> {
        let mut meta = self.meta.lock();
        meta.last_sent.insert(peer.to_string(), through);
        save_meta(&self.root, &meta)
    }
}

/// Chunks received from one sender.
pub struct IncomingChunks {
    sender: String,
    dir: PathBuf,
}

impl IncomingChunks {
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Messages of chunk `uri` received in local era `era`. Empty if absent.
    pub fn chunk(&self, uri: &str, era: Era) -> StorageResult<Vec<Vec<u8>>> {
        Ok(read_chunk(&chunk_path(&self.dir, era, uri))?.messages)
    }

    pub fn eras(&self) -> StorageResult<BTreeSet<Era>> {
        Ok(era::eras_present(&self.dir)?)
    }
}

fn incoming_dir(root: &Path, sender: &str) -> PathBuf {
    root.join(INCOMING_DIR).join(escape_file_name(sender))
}

fn chunk_path(dir: &Path, era: Era, uri: &str) -> PathBuf {
    dir.join(era.to_string()).join(escape_file_name(uri))
}

fn save_meta(root: &Path, meta: &StorageMeta) -> StorageResult<()> {
    let bytes = bincode::serialize(meta)?;
    std::fs::write(root.join(META_FILE), bytes)?;
    Ok(())
}

fn read_chunk(path: &Path) -> StorageResult<ChunkFile> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bincode::deserialize(&bytes)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ChunkFile::default()),
        Err(e) => Err(e.into()),
    }
}

fn append_chunk(path: &Path, uri: &str, messages: Vec<Vec<u8>>) -> StorageResult<()> {
    let mut chunk = read_chunk(path)?;
    chunk.uri = uri.to_string();
    chunk.messages.extend(messages);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bincode::serialize(&chunk)?)?;
    Ok(())
}

fn collect_chunks(
    dir: &Path,
    from: Era,
    to: Era,
    out: &mut Vec<OutgoingChunk>,
) -> StorageResult<()> {
    let eras = era::eras_present(dir)?;
    for era in era::select_in_range(&eras, from, to) {
        let era_dir = dir.join(era.to_string());
        let mut files: Vec<PathBuf> = std::fs::read_dir(&era_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        for path in files {
            let chunk = read_chunk(&path)?;
            if chunk.messages.is_empty() {
                continue;
            }
            out.push(OutgoingChunk {
                uri: chunk.uri,
                era,
                messages: chunk.messages,
            });
        }
    }
    Ok(())
}
