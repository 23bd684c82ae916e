use serde::{Serialize, Deserialize};

/// State sync configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum number of keys in a single range or change proof
    pub max_keys_per_request: usize,

    /// Retries per request before the sync fails
    pub max_retries: u32,

    /// Timeout of a single request in seconds
    pub request_timeout_secs: u64,

    /// Ask for change proofs when the local root is known to the peer
    pub use_change_proofs: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_keys_per_request: 2048,
            max_retries: 5,
            request_timeout_secs: 30,
            use_change_proofs: true,
        }
    }
}
