//! Durable local storage for undelivered telemetry.
//!
//! The [`DurableStore`] trait is the local persistence collaborator of the
//! offline queue: an ordered key/value store with append, scan, and remove.
//! Two implementations are provided:
//!
//! - [`FileQueueStore`] - one file per record under
//!   `<root>/<queue>/<zero-padded key>.json`, scanned in key order
//! - [`MemoryQueueStore`] - in-memory, for tests and ephemeral hosts
//!
//! Keys are assigned by the queue (epoch milliseconds, strictly monotonic
//! per process), so lexical filename order equals delivery order.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::warn;

/// Errors from the local durable store.
///
/// A failure here on enqueue is the pipeline's only true data-loss path and
/// is surfaced as an error log plus the `records_lost` counter.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Filesystem operation failed.
    #[error("Queue storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Record (de)serialization failed.
    #[error("Queue record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Local durable store collaborator.
///
/// Operations are synchronous; implementations are expected to be cheap
/// local writes (filesystem, embedded database). Ordering contract:
/// `read_all` returns entries sorted by key ascending.
pub trait DurableStore: Send + Sync {
    /// Append one record under `key`.
    fn append(&self, queue: &str, key: u64, bytes: &[u8]) -> Result<(), QueueError>;

    /// Read every record in the queue, ordered by key ascending.
    fn read_all(&self, queue: &str) -> Result<Vec<(u64, Vec<u8>)>, QueueError>;

    /// Remove the record stored under `key`, if present.
    fn remove(&self, queue: &str, key: u64) -> Result<(), QueueError>;
}

/// File-backed durable store.
///
/// Each record is its own file, so `remove` is a single unlink and a crash
/// between writes never corrupts neighbors. Key filenames are zero-padded to
/// 20 digits; files that do not parse as keys are skipped with a warning.
pub struct FileQueueStore {
    root: PathBuf,
}

impl FileQueueStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: PathBuf) -> Result<Self, QueueError> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn entry_path(&self, queue: &str, key: u64) -> PathBuf {
        self.root.join(queue).join(format!("{key:020}.json"))
    }
}

impl DurableStore for FileQueueStore {
    fn append(&self, queue: &str, key: u64, bytes: &[u8]) -> Result<(), QueueError> {
        let path = self.entry_path(queue, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
        Ok(())
    }

    fn read_all(&self, queue: &str) -> Result<Vec<(u64, Vec<u8>)>, QueueError> {
        let dir = self.root.join(queue);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let key = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok());

            match key {
                Some(key) => entries.push((key, fs::read(&path)?)),
                None => {
                    warn!(path = %path.display(), "Skipping unrecognized file in queue directory");
                }
            }
        }

        entries.sort_by_key(|(key, _)| *key);
        Ok(entries)
    }

    fn remove(&self, queue: &str, key: u64) -> Result<(), QueueError> {
        let path = self.entry_path(queue, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory durable store for tests and ephemeral hosts.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    queues: Mutex<HashMap<String, BTreeMap<u64, Vec<u8>>>>,
}

impl MemoryQueueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held in `queue`.
    pub fn len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(queue)
            .map_or(0, BTreeMap::len)
    }

    /// True if `queue` holds no records.
    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }
}

impl DurableStore for MemoryQueueStore {
    fn append(&self, queue: &str, key: u64, bytes: &[u8]) -> Result<(), QueueError> {
        self.queues
            .lock()
            .unwrap()
            .entry(queue.to_string())
            .or_default()
            .insert(key, bytes.to_vec());
        Ok(())
    }

    fn read_all(&self, queue: &str) -> Result<Vec<(u64, Vec<u8>)>, QueueError> {
        Ok(self
            .queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(key, bytes)| (*key, bytes.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn remove(&self, queue: &str, key: u64) -> Result<(), QueueError> {
        if let Some(entries) = self.queues.lock().unwrap().get_mut(queue) {
            entries.remove(&key);
        }
        Ok(())
    }
}
