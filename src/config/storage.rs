use serde::{Serialize, Deserialize};

/// Store backing the trie
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process map, lost on exit
    Memory,
    /// RocksDB on disk, requires the `rocksdb` feature
    Rocksdb,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Store backend
    pub backend: StorageBackend,

    /// Database path
    pub db_path: String,

    /// Create the database if it does not exist
    pub create_if_missing: bool,

    /// Maximum open files
    pub max_open_files: i32,

    /// Write buffer size in MB
    pub write_buffer_size: usize,

    /// Enable compression
    pub enable_compression: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            db_path: "./data/merkledb".to_string(),
            create_if_missing: true,
            max_open_files: 1000,
            write_buffer_size: 64, // 64MB
            enable_compression: true,
        }
    }
}
