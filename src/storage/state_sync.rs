//! State synchronization for merkledb
//!
//! A [`SyncClient`] is the request/response surface a database exposes to
//! peers. [`StateSynchronizer`] uses one to bring a local database to a
//! peer's root: it fetches range or change proofs for successive key ranges,
//! verifies each one against the target root, commits it, and then compares
//! local and peer proofs to find the next key where the two tries differ.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use bytes::Bytes;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::config::SyncConfig;
use crate::crypto::hash::Id;
use crate::storage::merkle_db::{MerkleDb, MerkleDbError};
use crate::storage::trie::key::{BranchFactor, Key};
use crate::storage::trie::mpt::MerkleTrie;
use crate::storage::trie::proof::{ChangeProof, Proof, ProofError, ProofNode, RangeProof};
use crate::storage::trie::proof_iterator::ProofIterator;

/// Error type for state synchronization operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// Local or remote database error
    #[error("Database error: {0}")]
    DbError(#[from] MerkleDbError),

    /// Proof failed to decode or verify
    #[error("{0}")]
    ProofError(#[from] ProofError),

    /// Peer failed to answer
    #[error("Peer error: {0}")]
    PeerError(String),

    /// Peer did not answer in time
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Local root after syncing differs from the target
    #[error("Synced root {actual} does not match target {expected}")]
    RootMismatch {
        /// Root the sync aimed for
        expected: Id,
        /// Root the local database ended up with
        actual: Id,
    },

    /// Sync already in progress
    #[error("Sync already in progress")]
    SyncInProgress,
}

impl SyncError {
    /// Errors worth asking the peer again for
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::PeerError(_) | SyncError::Timeout(_))
    }
}

/// Result type for synchronization operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Range proof request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeProofRequest {
    /// Root the proof is for
    pub root: Id,
    /// Inclusive range start, unbounded if `None`
    pub start: Option<Bytes>,
    /// Inclusive range end, unbounded if `None`
    pub end: Option<Bytes>,
    /// Maximum number of key/value pairs
    pub key_limit: usize,
}

/// Change proof request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeProofRequest {
    /// Root the changes start from
    pub start_root: Id,
    /// Root the changes lead to
    pub end_root: Id,
    /// Inclusive range start, unbounded if `None`
    pub start: Option<Bytes>,
    /// Inclusive range end, unbounded if `None`
    pub end: Option<Bytes>,
    /// Maximum number of changes
    pub key_limit: usize,
}

/// Operations a database serves to sync peers
#[async_trait]
pub trait SyncClient: Send + Sync {
    /// Current root
    async fn get_merkle_root(&self) -> SyncResult<Id>;

    /// Delete all keys in `[start, end]`
    async fn clear_range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> SyncResult<()>;

    /// Inclusion or exclusion proof for `key`
    async fn get_proof(&self, key: &[u8]) -> SyncResult<Proof>;

    /// Range proof at a given root
    async fn get_range_proof(&self, request: RangeProofRequest) -> SyncResult<RangeProof>;

    /// Change proof between two roots
    async fn get_change_proof(&self, request: ChangeProofRequest) -> SyncResult<ChangeProof>;

    /// Check a change proof against the served database without applying it
    async fn verify_change_proof(
        &self,
        proof: &ChangeProof,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        expected_root: &Id,
    ) -> SyncResult<()>;

    /// Apply a verified change proof
    async fn commit_change_proof(&self, proof: &ChangeProof) -> SyncResult<()>;

    /// Apply a verified range proof
    async fn commit_range_proof(&self, start: Option<&[u8]>, end: Option<&[u8]>, proof: &RangeProof) -> SyncResult<()>;
}

/// [`SyncClient`] serving a database in the same process. Proofs pass
/// through their wire encoding as they would between remote peers.
#[derive(Clone)]
pub struct LocalSyncClient {
    db: Arc<RwLock<MerkleDb>>,
    /// Upper bound on the key limit of incoming requests
    max_keys_per_request: usize,
}

impl LocalSyncClient {
    pub fn new(db: Arc<RwLock<MerkleDb>>, max_keys_per_request: usize) -> Self {
        Self { db, max_keys_per_request: max_keys_per_request.max(1) }
    }

    pub async fn branch_factor(&self) -> BranchFactor {
        self.db.read().await.branch_factor()
    }

    fn clamp(&self, key_limit: usize) -> usize {
        key_limit.clamp(1, self.max_keys_per_request)
    }
}

#[async_trait]
impl SyncClient for LocalSyncClient {
    async fn get_merkle_root(&self) -> SyncResult<Id> {
        Ok(self.db.read().await.merkle_root())
    }

    async fn clear_range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> SyncResult<()> {
        self.db.write().await.clear_range(start, end)?;
        Ok(())
    }

    async fn get_proof(&self, key: &[u8]) -> SyncResult<Proof> {
        let proof = self.db.read().await.get_proof(key)?;
        Ok(Proof::from_bytes(&proof.to_bytes()?)?)
    }

    async fn get_range_proof(&self, request: RangeProofRequest) -> SyncResult<RangeProof> {
        let proof = self.db.read().await.get_range_proof_at_root(
            &request.root,
            request.start.as_deref(),
            request.end.as_deref(),
            self.clamp(request.key_limit),
        )?;
        Ok(RangeProof::from_bytes(&proof.to_bytes()?)?)
    }

    async fn get_change_proof(&self, request: ChangeProofRequest) -> SyncResult<ChangeProof> {
        let proof = self.db.read().await.get_change_proof(
            &request.start_root,
            &request.end_root,
            request.start.as_deref(),
            request.end.as_deref(),
            self.clamp(request.key_limit),
        )?;
        Ok(ChangeProof::from_bytes(&proof.to_bytes()?)?)
    }

    async fn verify_change_proof(
        &self,
        proof: &ChangeProof,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        expected_root: &Id,
    ) -> SyncResult<()> {
        self.db.read().await.verify_change_proof(proof, start, end, expected_root)?;
        Ok(())
    }

    async fn commit_change_proof(&self, proof: &ChangeProof) -> SyncResult<()> {
        self.db.write().await.commit_change_proof(proof)?;
        Ok(())
    }

    async fn commit_range_proof(&self, start: Option<&[u8]>, end: Option<&[u8]>, proof: &RangeProof) -> SyncResult<()> {
        self.db.write().await.commit_range_proof(start, end, proof)?;
        Ok(())
    }
}

/// Synchronization status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Not syncing
    Idle,
    /// Syncing in progress
    InProgress,
    /// Sync completed
    Completed,
    /// Sync failed
    Failed,
}

/// Synchronization progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProgress {
    /// Current status
    pub status: SyncStatus,
    /// Root being synced to
    pub target_root: Option<Id>,
    /// Range proofs committed
    pub range_proofs: u64,
    /// Change proofs committed
    pub change_proofs: u64,
    /// Key/value pairs and key changes received
    pub keys_received: u64,
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self {
            status: SyncStatus::Idle,
            target_root: None,
            range_proofs: 0,
            change_proofs: 0,
            keys_received: 0,
        }
    }
}

/// Drives a local database to a peer's root
pub struct StateSynchronizer {
    /// Database being synced
    local: LocalSyncClient,
    /// Source of proofs
    peer: Arc<dyn SyncClient>,
    /// Synchronization configuration
    config: SyncConfig,
    /// Synchronization progress
    progress: Mutex<SyncProgress>,
}

impl StateSynchronizer {
    pub fn new(local: Arc<RwLock<MerkleDb>>, peer: Arc<dyn SyncClient>, config: SyncConfig) -> Self {
        let local = LocalSyncClient::new(local, config.max_keys_per_request);
        Self { local, peer, config, progress: Mutex::new(SyncProgress::default()) }
    }

    /// Get synchronization progress
    pub async fn get_progress(&self) -> SyncProgress {
        self.progress.lock().await.clone()
    }

    /// Sync to the peer's current root
    pub async fn sync(&self) -> SyncResult<Id> {
        let target = self.with_retry("merkle root", || self.peer.get_merkle_root()).await?;
        self.sync_to_root(target).await
    }

    /// Sync the whole key space to `target`
    pub async fn sync_to_root(&self, target: Id) -> SyncResult<Id> {
        {
            let mut progress = self.progress.lock().await;
            if progress.status == SyncStatus::InProgress {
                return Err(SyncError::SyncInProgress);
            }
            *progress = SyncProgress {
                status: SyncStatus::InProgress,
                target_root: Some(target),
                ..SyncProgress::default()
            };
        }

        let result = self.run(target).await;

        let mut progress = self.progress.lock().await;
        match &result {
            Ok(root) => {
                progress.status = SyncStatus::Completed;
                info!(
                    "State sync to {} completed: {} range proofs, {} change proofs, {} keys",
                    root, progress.range_proofs, progress.change_proofs, progress.keys_received
                );
            }
            Err(e) => {
                progress.status = SyncStatus::Failed;
                warn!("State sync to {} failed: {}", target, e);
            }
        }
        result
    }

    async fn run(&self, target: Id) -> SyncResult<Id> {
        let start_root = self.local.get_merkle_root().await?;
        if start_root == target {
            info!("Local root already at {}", target);
            return Ok(target);
        }

        let branch_factor = self.local.branch_factor().await;
        let empty_root = MerkleTrie::standalone(branch_factor).compute_root();
        let mut use_change_proofs = self.config.use_change_proofs && start_root != empty_root;
        info!("Syncing from {} to {}", start_root, target);

        let mut start: Option<Bytes> = None;
        loop {
            let next = if use_change_proofs {
                match self.sync_change_range(start_root, target, start.clone(), branch_factor).await {
                    Ok(next) => next,
                    Err(e @ (SyncError::ProofError(_) | SyncError::RootMismatch { .. })) => return Err(e),
                    Err(e) => {
                        debug!("Change proof unavailable, falling back to range proofs: {}", e);
                        use_change_proofs = false;
                        continue;
                    }
                }
            } else {
                self.sync_range(target, start.clone(), branch_factor).await?
            };

            match next {
                Some(next) => start = Some(next),
                None => break,
            }
        }

        let actual = self.local.get_merkle_root().await?;
        if actual != target {
            return Err(SyncError::RootMismatch { expected: target, actual });
        }
        Ok(actual)
    }

    /// Fetch, verify and commit a range proof for `[start, ..]`. Returns the
    /// start of the next range, or `None` when the key space is done.
    async fn sync_range(&self, target: Id, start: Option<Bytes>, branch_factor: BranchFactor) -> SyncResult<Option<Bytes>> {
        let request = RangeProofRequest {
            root: target,
            start: start.clone(),
            end: None,
            key_limit: self.config.max_keys_per_request,
        };
        let proof = self
            .with_retry("range proof", || self.peer.get_range_proof(request.clone()))
            .await?;
        proof.verify(start.as_deref(), None, &target, branch_factor)?;
        self.local.commit_range_proof(start.as_deref(), None, &proof).await?;

        {
            let mut progress = self.progress.lock().await;
            progress.range_proofs += 1;
            progress.keys_received += proof.key_values.len() as u64;
        }
        debug!("Committed range proof with {} key/values from {:?}", proof.key_values.len(), start);

        match proof.key_values.last() {
            None => Ok(None),
            Some(last) => self.find_next_key(&last.key, None, &proof.end_proof, branch_factor).await,
        }
    }

    /// Change proof counterpart of [`Self::sync_range`]
    async fn sync_change_range(
        &self,
        start_root: Id,
        target: Id,
        start: Option<Bytes>,
        branch_factor: BranchFactor,
    ) -> SyncResult<Option<Bytes>> {
        let request = ChangeProofRequest {
            start_root,
            end_root: target,
            start: start.clone(),
            end: None,
            key_limit: self.config.max_keys_per_request,
        };
        let proof = self
            .with_retry("change proof", || self.peer.get_change_proof(request.clone()))
            .await?;
        self.local
            .verify_change_proof(&proof, start.as_deref(), None, &target)
            .await
            .map_err(|e| match e {
                SyncError::DbError(MerkleDbError::ProofError(e)) => SyncError::ProofError(e),
                other => other,
            })?;
        self.local.commit_change_proof(&proof).await?;

        {
            let mut progress = self.progress.lock().await;
            progress.change_proofs += 1;
            progress.keys_received += proof.key_changes.len() as u64;
        }
        debug!("Committed change proof with {} changes from {:?}", proof.key_changes.len(), start);

        match proof.key_changes.last() {
            None => Ok(None),
            Some(last) => self.find_next_key(&last.key, None, &proof.end_proof, branch_factor).await,
        }
    }

    /// First key after `last_received` that may differ between the local
    /// trie and the peer's trie, given the peer's proof for `last_received`.
    /// `None` if the tries agree on everything after it up to `end`.
    pub async fn find_next_key(
        &self,
        last_received: &[u8],
        end: Option<&[u8]>,
        peer_proof: &[ProofNode],
        branch_factor: BranchFactor,
    ) -> SyncResult<Option<Bytes>> {
        if end.map_or(false, |end| last_received >= end) {
            return Ok(None);
        }
        let local_proof = self.local.get_proof(last_received).await?;
        let candidate = next_differing_key(last_received, &local_proof.path, peer_proof, branch_factor)?;

        let Some(candidate) = candidate else { return Ok(None) };
        let mut next = candidate.as_bytes().to_vec();
        if next.as_slice() <= last_received {
            next = last_received.to_vec();
            next.push(0);
        }
        if end.map_or(false, |end| next.as_slice() > end) {
            return Ok(None);
        }
        Ok(Some(Bytes::from(next)))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// configured number of retries is used up. Each attempt is bounded by
    /// the request timeout.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        let max_retries = self.config.max_retries;
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(50))
            .with_max_interval(Duration::from_secs(5))
            .with_max_elapsed_time(None)
            .build();

        let mut attempt = 0u32;
        backoff::future::retry(policy, || {
            attempt += 1;
            let current = attempt;
            let request = op();
            async move {
                let result = match tokio::time::timeout(timeout, request).await {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::Timeout(timeout)),
                };
                result.map_err(|e| {
                    if e.is_retryable() && current <= max_retries {
                        warn!("Request for {} failed (attempt {}), retrying: {}", what, current, e);
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }
}

/// Merge the pairs of two proofs for the same key, starting at `from`, and
/// return the first key prefix where they disagree. Subtrees whose ids match
/// on both sides are skipped.
fn next_differing_key(
    from: &[u8],
    local_proof: &[ProofNode],
    peer_proof: &[ProofNode],
    branch_factor: BranchFactor,
) -> SyncResult<Option<Key>> {
    let from = Key::from_bytes(from);
    let mut local = ProofIterator::new(local_proof, &from, branch_factor)?.peekable();
    let mut peer = ProofIterator::new(peer_proof, &from, branch_factor)?.peekable();

    loop {
        let (local_key, peer_key) = match (local.peek(), peer.peek()) {
            (None, None) => return Ok(None),
            (Some((key, _)), None) | (None, Some((key, _))) => return Ok(Some(key.clone())),
            (Some((l, _)), Some((p, _))) => (l.clone(), p.clone()),
        };

        if local_key < peer_key {
            return Ok(Some(local_key));
        }
        if peer_key < local_key {
            return Ok(Some(peer_key));
        }

        let same = local.next().map(|(_, id)| id) == peer.next().map(|(_, id)| id);
        if same {
            // Identical subtree: nothing below it can differ.
            while local.peek().map_or(false, |(k, _)| k.has_prefix(&local_key)) {
                local.next();
            }
            while peer.peek().map_or(false, |(k, _)| k.has_prefix(&peer_key)) {
                peer.next();
            }
        } else if local_key != from {
            // The value at `from` was just received; anywhere else the node
            // itself may hold the difference.
            return Ok(Some(local_key));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MerkleConfig;
    use crate::storage::kv_store::MemoryStore;
    use crate::storage::trie::proof::KeyChange;

    fn new_db(pairs: &[(&[u8], &[u8])]) -> Arc<RwLock<MerkleDb>> {
        let mut db = MerkleDb::new(Arc::new(MemoryStore::new()), &MerkleConfig::default()).unwrap();
        if !pairs.is_empty() {
            db.commit(
                pairs
                    .iter()
                    .map(|(k, v)| KeyChange { key: Bytes::copy_from_slice(k), value: Some(Bytes::copy_from_slice(v)) })
                    .collect(),
            )
            .unwrap();
        }
        Arc::new(RwLock::new(db))
    }

    #[test]
    fn test_next_differing_key() {
        let bf = BranchFactor::Sixteen;
        let mut local = MerkleTrie::standalone(bf);
        let mut peer = MerkleTrie::standalone(bf);
        for key in [&[0x10u8][..], &[0x20], &[0x30], &[0x40]] {
            local.insert(Key::from_bytes(key), Bytes::from_static(b"v"));
            peer.insert(Key::from_bytes(key), Bytes::from_static(b"v"));
        }
        peer.insert(Key::from_bytes(&[0x35]), Bytes::from_static(b"new"));
        local.compute_root();
        peer.compute_root();

        let from = [0x20u8];
        let local_proof = local.get_proof(&Key::from_bytes(&from)).unwrap();
        let peer_proof = peer.get_proof(&Key::from_bytes(&from)).unwrap();
        let next = next_differing_key(&from, &local_proof.path, &peer_proof.path, bf).unwrap().unwrap();
        // The 0x3 subtree differs; everything in it is after 0x20
        assert!(next > Key::from_bytes(&from));
        assert!(next <= Key::from_bytes(&[0x35]));

        let last = Key::from_bytes(&[0x40]);
        let local_proof = local.get_proof(&last).unwrap();
        let peer_proof = peer.get_proof(&last).unwrap();
        assert_eq!(next_differing_key(&[0x40], &local_proof.path, &peer_proof.path, bf).unwrap(), None);
    }

    #[tokio::test]
    async fn test_local_client_clamps_key_limit() {
        let db = new_db(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);
        let client = LocalSyncClient::new(db.clone(), 2);
        let root = client.get_merkle_root().await.unwrap();

        let proof = client
            .get_range_proof(RangeProofRequest { root, start: None, end: None, key_limit: 100 })
            .await
            .unwrap();
        assert_eq!(proof.key_values.len(), 2);
        proof.verify(None, None, &root, BranchFactor::Sixteen).unwrap();

        client.clear_range(Some(b"b"), None).await.unwrap();
        assert_eq!(db.read().await.get(b"b"), None);
    }

    #[tokio::test]
    async fn test_sync_empty_to_populated() {
        let source = new_db(&[(b"k1", b"v1"), (b"k2", b"v2"), (b"k3", b"v3")]);
        let target = new_db(&[]);
        let peer = Arc::new(LocalSyncClient::new(source.clone(), 100));
        let config = SyncConfig { max_keys_per_request: 1, ..SyncConfig::default() };

        let synchronizer = StateSynchronizer::new(target.clone(), peer, config);
        let root = synchronizer.sync().await.unwrap();
        assert_eq!(root, source.read().await.merkle_root());

        let progress = synchronizer.get_progress().await;
        assert_eq!(progress.status, SyncStatus::Completed);
        assert_eq!(progress.change_proofs, 0);
        assert!(progress.range_proofs >= 3);
    }

    #[tokio::test]
    async fn test_sync_when_already_synced() {
        let source = new_db(&[(b"k", b"v")]);
        let target = new_db(&[(b"k", b"v")]);
        let peer = Arc::new(LocalSyncClient::new(source, 100));
        let synchronizer = StateSynchronizer::new(target, peer, SyncConfig::default());
        synchronizer.sync().await.unwrap();
        assert_eq!(synchronizer.get_progress().await.range_proofs, 0);
    }
}
