// Storage module for merkledb
// The trie, its persistence in an ordered key-value store, and state sync on top

pub mod kv_store;
pub mod merkle_db;
pub mod state_sync;
pub mod trie;

use std::sync::Arc;

use log::info;

use crate::config::{StorageBackend, StorageConfig};

// Re-export main components
pub use kv_store::{KVStore, KVStoreError, MemoryStore, WriteBatchOperation};
#[cfg(feature = "rocksdb")]
pub use kv_store::RocksDBStore;
pub use merkle_db::{MerkleDb, MerkleDbError, MerkleDbResult};
pub use state_sync::{LocalSyncClient, StateSynchronizer, SyncClient, SyncError, SyncProgress, SyncResult};

/// Open the store described by `config`
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn KVStore>, KVStoreError> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Rocksdb => open_rocksdb(config),
    }
}

#[cfg(feature = "rocksdb")]
fn open_rocksdb(config: &StorageConfig) -> Result<Arc<dyn KVStore>, KVStoreError> {
    let mut opts = rocksdb::Options::default();
    opts.create_if_missing(config.create_if_missing);
    opts.set_max_open_files(config.max_open_files);
    opts.set_write_buffer_size(config.write_buffer_size * 1024 * 1024);
    if config.enable_compression {
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
    } else {
        opts.set_compression_type(rocksdb::DBCompressionType::None);
    }
    info!("Opening RocksDB store at {}", config.db_path);
    let store = RocksDBStore::with_options(std::path::Path::new(&config.db_path), opts)?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "rocksdb"))]
fn open_rocksdb(_config: &StorageConfig) -> Result<Arc<dyn KVStore>, KVStoreError> {
    Err(KVStoreError::RocksDBError(
        "built without the `rocksdb` feature".to_string(),
    ))
}
