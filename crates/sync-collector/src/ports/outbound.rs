//! Outbound Ports (Driven Ports)
//!
//! Collaborators the collector needs from the rest of the daemon:
//! - `KeyValueStore`: durable rows behind the filter tables
//! - `CollectorQueue`: the persisted fetch queue of each store
//! - `ContentDownloads`: the download engine
//! - `CoreScheduler`: timers and deferred work on the core thread
//!
//! Everything except `KeyValueStore` is `!Send` by construction: closures
//! handed across these ports run on the single core thread.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use shared_types::{Did, Oid, Sindex, Soid};

use crate::domain::CollectorSeq;
use crate::error::{DownloadFailure, StorageError};

/// Abstract interface for key-value database operations.
///
/// Testing and embedding: `InMemoryKVStore` (below)
pub trait KeyValueStore: Send + Sync {
    /// Get a value by key.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Put a single key-value pair.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    /// Delete a key.
    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError>;

    /// Execute an atomic batch write.
    ///
    /// Either ALL operations in the batch succeed, or NONE are applied.
    fn atomic_batch_write(&mut self, operations: Vec<BatchOperation>) -> Result<(), StorageError>;

    /// Check if a key exists.
    fn exists(&self, key: &[u8]) -> Result<bool, StorageError>;

    /// Keys with a prefix, in ascending key order.
    fn prefix_scan(&self, prefix: &[u8]) -> Result<KvRows, StorageError>;
}

/// Key-value pairs returned by a scan, in key order
pub type KvRows = Vec<(Vec<u8>, Vec<u8>)>;

/// Batch operation for atomic writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOperation {
    /// Put a key-value pair.
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Delete a key.
    Delete { key: Vec<u8> },
}

impl BatchOperation {
    /// Create a Put operation.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        BatchOperation::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Create a Delete operation.
    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        BatchOperation::Delete { key: key.into() }
    }
}

/// One item of a store's fetch queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueEntry {
    pub cs: CollectorSeq,
    pub oid: Oid,
}

/// The persisted, ordered fetch queue of locally-missing objects.
///
/// Owned by the sync engine: it enqueues objects whose remote versions are
/// newer than the local ones and dequeues them once applied. The collector
/// only walks it.
pub trait CollectorQueue {
    /// Entry with the smallest sequence number.
    fn first(&self, sidx: Sindex) -> Result<Option<QueueEntry>, StorageError>;

    /// Entry with the smallest sequence number strictly greater than `cs`.
    fn next_after(&self, sidx: Sindex, cs: CollectorSeq)
        -> Result<Option<QueueEntry>, StorageError>;

    /// Whether the entry at `cs` is still queued.
    fn contains(&self, sidx: Sindex, cs: CollectorSeq) -> Result<bool, StorageError>;

    fn is_empty(&self, sidx: Sindex) -> Result<bool, StorageError> {
        Ok(self.first(sidx)?.is_none())
    }
}

/// Deferred work run on the core thread.
pub type Task = Box<dyn FnOnce()>;

/// Invoked by the download engine when a token is reclaimed after a
/// throttled request.
pub type Continuation = Box<dyn FnOnce()>;

/// Invoked exactly once with the outcome of an accepted download.
pub type DownloadListener = Box<dyn FnOnce(Result<(), DownloadFailure>)>;

/// The download engine.
pub trait ContentDownloads {
    /// Request a download of `soid` from any of `dids`.
    ///
    /// Returns `false` if no download token is available. The engine then
    /// keeps `continuation` and calls it once a token is reclaimed; the
    /// listener is dropped unused. Returns `true` if the request was
    /// accepted; the listener is then called with the outcome.
    fn download_async(
        &self,
        soid: Soid,
        dids: HashSet<Did>,
        continuation: Continuation,
        listener: DownloadListener,
    ) -> bool;
}

/// Single-threaded scheduler the collector's callbacks run on.
pub trait CoreScheduler {
    /// Run `task` on the core thread after `delay`.
    fn schedule(&self, delay: Duration, task: Task);
}

// =============================================================================
// ADAPTER IMPLEMENTATIONS
// Testing and embedding: in-memory implementations below
// =============================================================================

/// In-memory key-value store.
///
/// Atomic batch writes are trivially atomic on a single-threaded map. Keys
/// are kept ordered so prefix scans come back sorted.
#[derive(Default)]
pub struct InMemoryKVStore {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    fail_writes: bool,
}

impl InMemoryKVStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with an I/O error.
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Io("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl KeyValueStore for InMemoryKVStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.check_writable()?;
        self.data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StorageError> {
        self.check_writable()?;
        self.data.remove(key);
        Ok(())
    }

    fn atomic_batch_write(&mut self, operations: Vec<BatchOperation>) -> Result<(), StorageError> {
        self.check_writable()?;
        for op in operations {
            match op {
                BatchOperation::Put { key, value } => {
                    self.data.insert(key, value);
                }
                BatchOperation::Delete { key } => {
                    self.data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn exists(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.data.contains_key(key))
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Result<KvRows, StorageError> {
        let results: Vec<_> = self
            .data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_kv_store() {
        let mut store = InMemoryKVStore::new();
        store.put(b"key1", b"value1").unwrap();
        assert_eq!(store.get(b"key1").unwrap(), Some(b"value1".to_vec()));
        assert!(store.exists(b"key1").unwrap());

        store.delete(b"key1").unwrap();
        assert_eq!(store.get(b"key1").unwrap(), None);
    }

    #[test]
    fn test_in_memory_kv_batch_write() {
        let mut store = InMemoryKVStore::new();
        store.put(b"gone", b"x").unwrap();

        store
            .atomic_batch_write(vec![
                BatchOperation::put(b"k1".to_vec(), b"v1".to_vec()),
                BatchOperation::put(b"k2".to_vec(), b"v2".to_vec()),
                BatchOperation::delete(b"gone".to_vec()),
            ])
            .unwrap();

        assert_eq!(store.len(), 2);
        assert!(!store.exists(b"gone").unwrap());
    }

    #[test]
    fn test_prefix_scan_is_sorted_and_bounded() {
        let mut store = InMemoryKVStore::new();
        store.put(b"sf/2", b"b").unwrap();
        store.put(b"sf/1", b"a").unwrap();
        store.put(b"sd/1", b"z").unwrap();
        store.put(b"sg", b"z").unwrap();

        let keys: Vec<Vec<u8>> = store
            .prefix_scan(b"sf/")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"sf/1".to_vec(), b"sf/2".to_vec()]);
    }

    #[test]
    fn test_injected_failure_rejects_whole_batch() {
        let mut store = InMemoryKVStore::new();
        store.set_fail_writes(true);

        let put = BatchOperation::put(b"k".to_vec(), b"v".to_vec());
        let result = store.atomic_batch_write(vec![put]);
        assert!(matches!(result, Err(StorageError::Io(_))));
        assert!(store.is_empty());
    }
}
