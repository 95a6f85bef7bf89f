//! Durable storage backends for the outbox
//!
//! The outbox is small (one entry per locally originated message), so each
//! change writes a full snapshot. Snapshots are bincode encoded with a CRC-32
//! trailer and replaced atomically: write a temporary file, fsync, rename.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{RelayError, Result, StorageError};
use crate::outbox::OutboxEntry;

/// Snapshot format version written before the entries
pub const SNAPSHOT_VERSION: u8 = 1;

/// Default file name inside a data directory
pub const OUTBOX_FILE_NAME: &str = "outbox.bin";

// ----------------------------------------------------------------------------
// Persistence Trait
// ----------------------------------------------------------------------------

/// Storage backend the outbox writes through to
pub trait OutboxPersistence: Send + Sync {
    /// Load every stored entry; an absent store loads as empty
    fn load(&self) -> Result<Vec<OutboxEntry>>;

    /// Replace the stored entries with `entries`
    fn save(&self, entries: &[OutboxEntry]) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct OutboxSnapshot {
    version: u8,
    entries: Vec<OutboxEntry>,
}

fn encode_snapshot(entries: &[OutboxEntry]) -> Result<Vec<u8>> {
    let snapshot = OutboxSnapshot {
        version: SNAPSHOT_VERSION,
        entries: entries.to_vec(),
    };
    let mut bytes = bincode::serialize(&snapshot).map_err(StorageError::from)?;
    let crc = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&crc.to_be_bytes());
    Ok(bytes)
}

fn decode_snapshot(bytes: &[u8]) -> Result<Vec<OutboxEntry>> {
    if bytes.len() < 4 {
        return Err(RelayError::corrupt_storage("snapshot shorter than its checksum"));
    }
    let (content, trailer) = bytes.split_at(bytes.len() - 4);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(trailer);
    if u32::from_be_bytes(crc) != crc32fast::hash(content) {
        return Err(RelayError::corrupt_storage("snapshot checksum mismatch"));
    }

    let snapshot: OutboxSnapshot = bincode::deserialize(content).map_err(StorageError::from)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(RelayError::corrupt_storage(format!(
            "unsupported snapshot version {}",
            snapshot.version
        )));
    }
    Ok(snapshot.entries)
}

// ----------------------------------------------------------------------------
// File Persistence
// ----------------------------------------------------------------------------

/// Single-file snapshot store
#[derive(Debug, Clone)]
pub struct FileOutboxPersistence {
    path: PathBuf,
}

impl FileOutboxPersistence {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Store at the default file name inside `dir`
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self::new(dir.as_ref().join(OUTBOX_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl OutboxPersistence for FileOutboxPersistence {
    fn load(&self) -> Result<Vec<OutboxEntry>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No outbox snapshot, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(StorageError::from(e).into()),
        };

        let entries = decode_snapshot(&bytes).map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "Outbox snapshot rejected");
            e
        })?;
        debug!(path = %self.path.display(), entries = entries.len(), "Loaded outbox snapshot");
        Ok(entries)
    }

    fn save(&self, entries: &[OutboxEntry]) -> Result<()> {
        let bytes = encode_snapshot(entries)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(StorageError::from)?;
            }
        }

        let temp = self.temp_path();
        {
            let mut file: File = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp)
                .map_err(StorageError::from)?;
            file.write_all(&bytes).map_err(StorageError::from)?;
            file.sync_all().map_err(StorageError::from)?;
        }
        fs::rename(&temp, &self.path).map_err(StorageError::from)?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Memory Persistence
// ----------------------------------------------------------------------------

/// In-memory store; clones share the same snapshot
#[derive(Debug, Clone, Default)]
pub struct MemoryOutboxPersistence {
    snapshot: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryOutboxPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in the last saved snapshot
    pub fn stored_len(&self) -> usize {
        self.load().map(|entries| entries.len()).unwrap_or(0)
    }
}

impl OutboxPersistence for MemoryOutboxPersistence {
    fn load(&self) -> Result<Vec<OutboxEntry>> {
        let guard = self
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_deref() {
            Some(bytes) => decode_snapshot(bytes),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, entries: &[OutboxEntry]) -> Result<()> {
        let bytes = encode_snapshot(entries)?;
        let mut guard = self
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Some(bytes);
        Ok(())
    }
}
