use std::collections::BTreeMap;
use std::sync::RwLock;

use thiserror::Error;

/// Error type for KVStore operations
#[derive(Debug, Error)]
pub enum KVStoreError {
    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// RocksDB error
    #[error("RocksDB error: {0}")]
    RocksDBError(String),

    /// Batch operation failed
    #[error("Batch operation failed: {0}")]
    BatchOperationFailed(String),

    /// Store lock poisoned by a panicking writer
    #[error("Store lock poisoned")]
    LockPoisoned,
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for KVStoreError {
    fn from(err: rocksdb::Error) -> Self {
        KVStoreError::RocksDBError(err.to_string())
    }
}

/// Write batch operation for atomic updates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteBatchOperation {
    /// Put operation
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Delete operation
    Delete { key: Vec<u8> },
}

/// Extension trait for Vec<WriteBatchOperation>
pub trait WriteBatchOperationExt {
    /// Add a put operation to the batch
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>);

    /// Add a delete operation to the batch
    fn delete(&mut self, key: Vec<u8>);
}

impl WriteBatchOperationExt for Vec<WriteBatchOperation> {
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.push(WriteBatchOperation::Put { key, value });
    }

    fn delete(&mut self, key: Vec<u8>) {
        self.push(WriteBatchOperation::Delete { key });
    }
}

/// Ordered byte-key store beneath the trie
pub trait KVStore: Send + Sync {
    /// Put a key-value pair
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KVStoreError>;

    /// Get a value by key
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KVStoreError>;

    /// Delete a key-value pair
    fn delete(&self, key: &[u8]) -> Result<(), KVStoreError>;

    /// Check if a key exists
    fn exists(&self, key: &[u8]) -> Result<bool, KVStoreError> {
        Ok(self.get(key)?.is_some())
    }

    /// Write a batch of operations atomically
    fn write_batch(&self, operations: Vec<WriteBatchOperation>) -> Result<(), KVStoreError>;

    /// All key-value pairs whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KVStoreError>;

    /// Flush any pending writes to disk
    fn flush(&self) -> Result<(), KVStoreError>;
}

/// In-memory store, used for tests and ephemeral databases
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KVStore for MemoryStore {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KVStoreError> {
        let mut data = self.data.write().map_err(|_| KVStoreError::LockPoisoned)?;
        data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KVStoreError> {
        let data = self.data.read().map_err(|_| KVStoreError::LockPoisoned)?;
        Ok(data.get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<(), KVStoreError> {
        let mut data = self.data.write().map_err(|_| KVStoreError::LockPoisoned)?;
        data.remove(key);
        Ok(())
    }

    fn write_batch(&self, operations: Vec<WriteBatchOperation>) -> Result<(), KVStoreError> {
        // One write lock for the whole batch keeps it atomic for readers.
        let mut data = self.data.write().map_err(|_| KVStoreError::LockPoisoned)?;
        for op in operations {
            match op {
                WriteBatchOperation::Put { key, value } => {
                    data.insert(key, value);
                }
                WriteBatchOperation::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KVStoreError> {
        let data = self.data.read().map_err(|_| KVStoreError::LockPoisoned)?;
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn flush(&self) -> Result<(), KVStoreError> {
        Ok(())
    }
}

#[cfg(feature = "rocksdb")]
pub use self::rocks::RocksDBStore;

#[cfg(feature = "rocksdb")]
mod rocks {
    use std::path::Path;

    use rocksdb::{IteratorMode, Options, WriteBatch, DB};

    use super::{KVStore, KVStoreError, WriteBatchOperation};

    /// RocksDB implementation of KVStore
    pub struct RocksDBStore {
        db: DB,
    }

    impl RocksDBStore {
        /// Open (creating if missing) a RocksDB store at `path`
        pub fn new(path: &Path) -> Result<Self, KVStoreError> {
            let mut opts = Options::default();
            opts.create_if_missing(true);
            Self::with_options(path, opts)
        }

        /// Open a RocksDB store with custom options
        pub fn with_options(path: &Path, options: Options) -> Result<Self, KVStoreError> {
            let db = DB::open(&options, path)
                .map_err(|e| KVStoreError::RocksDBError(format!("Failed to open RocksDB: {}", e)))?;
            Ok(Self { db })
        }
    }

    impl KVStore for RocksDBStore {
        fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KVStoreError> {
            self.db
                .put(key, value)
                .map_err(|e| KVStoreError::RocksDBError(format!("Failed to put key: {}", e)))
        }

        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KVStoreError> {
            self.db
                .get(key)
                .map_err(|e| KVStoreError::RocksDBError(format!("Failed to get key: {}", e)))
        }

        fn delete(&self, key: &[u8]) -> Result<(), KVStoreError> {
            self.db
                .delete(key)
                .map_err(|e| KVStoreError::RocksDBError(format!("Failed to delete key: {}", e)))
        }

        fn write_batch(&self, operations: Vec<WriteBatchOperation>) -> Result<(), KVStoreError> {
            let mut batch = WriteBatch::default();
            for op in operations {
                match op {
                    WriteBatchOperation::Put { key, value } => batch.put(&key, &value),
                    WriteBatchOperation::Delete { key } => batch.delete(&key),
                }
            }
            self.db
                .write(batch)
                .map_err(|e| KVStoreError::BatchOperationFailed(format!("Failed to write batch: {}", e)))
        }

        fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KVStoreError> {
            let mut results = Vec::new();
            let iterator = self
                .db
                .iterator(IteratorMode::From(prefix, rocksdb::Direction::Forward));

            for item in iterator {
                let (key, value) =
                    item.map_err(|e| KVStoreError::RocksDBError(format!("Failed to iterate: {}", e)))?;
                if !key.starts_with(prefix) {
                    break;
                }
                results.push((key.to_vec(), value.to_vec()));
            }
            Ok(results)
        }

        fn flush(&self) -> Result<(), KVStoreError> {
            self.db
                .flush()
                .map_err(|e| KVStoreError::RocksDBError(format!("Failed to flush: {}", e)))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::storage::kv_store::WriteBatchOperationExt;
        use tempfile::tempdir;

        #[test]
        fn test_rocksdb_batch_and_scan() {
            let temp_dir = tempdir().unwrap();
            let store = RocksDBStore::new(temp_dir.path()).unwrap();

            let mut batch = Vec::new();
            batch.put(b"n:1".to_vec(), b"one".to_vec());
            batch.put(b"n:2".to_vec(), b"two".to_vec());
            batch.put(b"m:1".to_vec(), b"other".to_vec());
            store.write_batch(batch).unwrap();

            let results = store.scan_prefix(b"n:").unwrap();
            assert_eq!(
                results,
                vec![(b"n:1".to_vec(), b"one".to_vec()), (b"n:2".to_vec(), b"two".to_vec())]
            );

            store.delete(b"n:1").unwrap();
            assert!(!store.exists(b"n:1").unwrap());
            store.flush().unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let store = MemoryStore::new();

        let key = b"test_key";
        let value = b"test_value";
        store.put(key, value).unwrap();
        assert_eq!(store.get(key).unwrap(), Some(value.to_vec()));

        assert!(store.exists(key).unwrap());
        assert!(!store.exists(b"nonexistent_key").unwrap());

        store.delete(key).unwrap();
        assert_eq!(store.get(key).unwrap(), None);
        assert!(store.scan_prefix(b"").unwrap().is_empty());
    }

    #[test]
    fn test_batch_operations() {
        let store = MemoryStore::new();

        let mut batch = Vec::new();
        batch.put(b"key1".to_vec(), b"value1".to_vec());
        batch.put(b"key2".to_vec(), b"value2".to_vec());
        batch.put(b"key3".to_vec(), b"value3".to_vec());
        store.write_batch(batch).unwrap();
        assert_eq!(store.scan_prefix(b"").unwrap().len(), 3);

        let mut batch = Vec::new();
        batch.delete(b"key1".to_vec());
        batch.put(b"key2".to_vec(), b"updated".to_vec());
        store.write_batch(batch).unwrap();

        assert_eq!(store.get(b"key1").unwrap(), None);
        assert_eq!(store.get(b"key2").unwrap(), Some(b"updated".to_vec()));
        assert_eq!(store.get(b"key3").unwrap(), Some(b"value3".to_vec()));
    }

    #[test]
    fn test_scan_prefix() {
        let store = MemoryStore::new();
        store.put(b"prefix:2", b"value2").unwrap();
        store.put(b"prefix:1", b"value1").unwrap();
        store.put(b"prefix:3", b"value3").unwrap();
        store.put(b"other:1", b"other1").unwrap();
        store.put(b"prefiy", b"after").unwrap();

        let keys: Vec<Vec<u8>> = store
            .scan_prefix(b"prefix:")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"prefix:1".to_vec(), b"prefix:2".to_vec(), b"prefix:3".to_vec()]);
        assert_eq!(store.scan_prefix(b"").unwrap().len(), 5);
    }
}
