//! Key-value storage abstraction.
//!
//! The production backend is RocksDB; tests use [`MemoryStore`]. Writes only
//! happen through [`WriteBatch`], so a logical operation is always atomic
//! regardless of backend.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors from the storage backend.
///
/// Fatal to the in-flight operation; the undo journal keeps the chain
/// consistent around a failed batch.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Corrupted value under key {key}: {reason}")]
    Corrupted { key: String, reason: String },
}

/// A single write operation.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An ordered batch of writes, committed atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Put { key: key.into(), value: value.into() });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete { key: key.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// The operations in insertion order.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Consume the batch, yielding the operations.
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// The persistent key-value store.
///
/// Implementations must apply a [`WriteBatch`] atomically: either every
/// operation in the batch is visible afterwards or none is.
pub trait KvStore: Send + Sync {
    /// Read the value under `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Whether `key` exists.
    fn exists(&self, key: &[u8]) -> Result<bool, StorageError> {
        Ok(self.get(key)?.is_some())
    }

    /// All `(key, value)` pairs whose key starts with `prefix`, in ascending
    /// key order.
    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError>;

    /// Apply a batch atomically.
    fn write(&self, batch: WriteBatch) -> Result<(), StorageError>;
}

/// In-memory store backed by a `BTreeMap`.
///
/// Used by the test suites and the simulation harness; ordering semantics
/// match the RocksDB backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle, ready to hand to a [`crate::Chain`].
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut data = self.data.write();
        for op in batch.into_ops() {
            match op {
                WriteOp::Put { key, value } => {
                    data.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(*b"k", *b"first");
        batch.put(*b"k", *b"second");
        batch.delete(*b"gone");
        store.write(batch).unwrap();

        assert_eq!(store.get(b"k").unwrap(), Some(b"second".to_vec()));
        assert_eq!(store.get(b"gone").unwrap(), None);
    }

    #[test]
    fn prefix_iteration_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(*b"a:1", *b"1");
        batch.put(*b"a:2", *b"2");
        batch.put(*b"b:1", *b"3");
        store.write(batch).unwrap();

        let entries = store.iter_prefix(b"a:").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, b"a:1".to_vec());
        assert_eq!(entries[1].0, b"a:2".to_vec());
    }
}
