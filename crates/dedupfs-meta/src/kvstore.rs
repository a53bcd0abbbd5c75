//! Embedded transactional key-value store backing the relational table layer.
//!
//! The whole key space lives in an ordered `BTreeMap`. A [`WriteTxn`] holds
//! the store's exclusive lock from [`Database::write`] until it is committed
//! or dropped, buffering its writes; commit applies them atomically and
//! dropping without commit discards them. Write transactions are therefore
//! serializable. [`ReadTxn`]s share the lock with each other.
//!
//! A file-backed database rewrites its snapshot (temp file + rename) on every
//! commit, so a crash leaves either the previous or the new state on disk.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::types::MetaError;

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

const FILE_MAGIC: &[u8; 4] = b"DDFS";
const FILE_VERSION: u16 = 1;

/// Read access shared by read and write transactions.
pub trait KvRead {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError>;

    /// Scan all keys with the given prefix, returning (key, value) pairs in sorted order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError>;

    /// Returns true if the key exists.
    fn contains_key(&self, key: &[u8]) -> Result<bool, MetaError> {
        Ok(self.get(key)?.is_some())
    }
}

fn scan_map(map: &BTreeMap<Key, Value>, prefix: &[u8]) -> Vec<KvPair> {
    map.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Transactional ordered key-value database.
pub struct Database {
    data: RwLock<BTreeMap<Key, Value>>,
    path: Option<PathBuf>,
    commits: AtomicU64,
}

impl Database {
    /// Creates an empty database that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            path: None,
            commits: AtomicU64::new(0),
        }
    }

    /// Opens (or creates) a database persisted at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MetaError> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            load_snapshot(&path)?
        } else {
            debug!(path = %path.display(), "creating new store");
            BTreeMap::new()
        };
        debug!(path = %path.display(), keys = data.len(), "opened store");
        Ok(Self {
            data: RwLock::new(data),
            path: Some(path),
            commits: AtomicU64::new(0),
        })
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of committed write transactions since open.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Number of keys currently stored.
    pub fn key_count(&self) -> usize {
        self.data.read().len()
    }

    /// Begins a read transaction.
    pub fn read(&self) -> ReadTxn<'_> {
        ReadTxn {
            data: self.data.read(),
        }
    }

    /// Begins a write transaction. Blocks until no other transaction is open.
    pub fn write(&self) -> WriteTxn<'_> {
        WriteTxn {
            db: self,
            data: self.data.write(),
            pending: BTreeMap::new(),
        }
    }
}

fn load_snapshot(path: &Path) -> Result<BTreeMap<Key, Value>, MetaError> {
    let mut file = fs::File::open(path)?;
    let mut header = [0u8; 6];
    file.read_exact(&mut header)?;
    if &header[..4] != FILE_MAGIC {
        return Err(MetaError::KvError(format!(
            "{} is not a dedupfs store",
            path.display()
        )));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != FILE_VERSION {
        return Err(MetaError::KvError(format!(
            "unsupported store version {} in {}",
            version,
            path.display()
        )));
    }
    let mut body = Vec::new();
    file.read_to_end(&mut body)?;
    Ok(bincode::deserialize(&body)?)
}

fn write_snapshot(path: &Path, data: &BTreeMap<Key, Value>) -> Result<(), MetaError> {
    let body = bincode::serialize(data)?;
    let tmp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(FILE_MAGIC)?;
        file.write_all(&FILE_VERSION.to_le_bytes())?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Shared-lock snapshot of the database.
pub struct ReadTxn<'a> {
    data: RwLockReadGuard<'a, BTreeMap<Key, Value>>,
}

impl KvRead for ReadTxn<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError> {
        Ok(self.data.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        Ok(scan_map(&self.data, prefix))
    }
}

/// Exclusive write transaction. Changes are buffered until [`WriteTxn::commit`].
pub struct WriteTxn<'a> {
    db: &'a Database,
    data: RwLockWriteGuard<'a, BTreeMap<Key, Value>>,
    pending: BTreeMap<Key, Option<Value>>,
}

impl WriteTxn<'_> {
    /// Put a key-value pair. Overwrites any existing value.
    pub fn put(&mut self, key: Key, value: Value) {
        self.pending.insert(key, Some(value));
    }

    /// Delete a key. A missing key is not an error.
    pub fn delete(&mut self, key: &[u8]) {
        self.pending.insert(key.to_vec(), None);
    }

    /// Delete every key under `prefix`, returning how many existed.
    pub fn delete_prefix(&mut self, prefix: &[u8]) -> Result<usize, MetaError> {
        let keys: Vec<Key> = self.scan_prefix(prefix)?.into_iter().map(|(k, _)| k).collect();
        for key in &keys {
            self.delete(key);
        }
        Ok(keys.len())
    }

    /// Number of buffered operations.
    pub fn pending_ops(&self) -> usize {
        self.pending.len()
    }

    /// Applies every buffered write atomically and persists the result.
    pub fn commit(mut self) -> Result<(), MetaError> {
        let pending = std::mem::take(&mut self.pending);
        let ops = pending.len();
        let mut undo: Vec<(Key, Option<Value>)> = Vec::with_capacity(ops);
        for (key, value) in pending {
            let previous = match value {
                Some(value) => self.data.insert(key.clone(), value),
                None => self.data.remove(&key),
            };
            undo.push((key, previous));
        }

        if let Some(path) = self.db.path.as_deref() {
            if let Err(e) = write_snapshot(path, &self.data) {
                warn!(path = %path.display(), error = %e, "persisting commit failed, rolling back");
                for (key, previous) in undo.into_iter().rev() {
                    match previous {
                        Some(value) => self.data.insert(key, value),
                        None => self.data.remove(&key),
                    };
                }
                return Err(e);
            }
        }

        self.db.commits.fetch_add(1, Ordering::Relaxed);
        debug!(ops, "committed transaction");
        Ok(())
    }

    /// Discards every buffered write.
    pub fn rollback(mut self) {
        let ops = self.pending.len();
        self.pending.clear();
        debug!(ops, "rolled back transaction");
    }
}

impl KvRead for WriteTxn<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError> {
        match self.pending.get(key) {
            Some(value) => Ok(value.clone()),
            None => Ok(self.data.get(key).cloned()),
        }
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let mut merged: BTreeMap<Key, Value> = scan_map(&self.data, prefix).into_iter().collect();
        for (key, value) in self
            .pending
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}
