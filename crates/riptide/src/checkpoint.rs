//! Per-vbucket checkpoint blobs and the metadata-store interface.
//!
//! The blob is the authoritative ownership and progress record for one
//! `(app, vbucket)` pair. It is created lazily on first takeover, never
//! deleted, and only ever mutated under a compare-and-swap guarded by the
//! store's version token. The consumer's in-memory stats are a write-behind
//! mirror of it.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Vbucket;

/// State of a vbucket's CDC stream as recorded in its checkpoint blob.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    #[default]
    Uninitialised,
    Running,
    Stopped,
}

/// Authoritative per-vbucket ownership and progress record.
///
/// Invariants: at most one `Running` owner cluster-wide per vbucket;
/// `last_seq_processed` never decreases across successful CAS upserts;
/// ownership fields only change through the give-up/takeover protocol.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckpointBlob {
    pub current_owner: String,
    pub assigned_worker: String,
    pub node_uuid: String,

    /// Snapshot taken at last give-up; the next owner reads these to locate
    /// transferable state on the previous node.
    pub previous_owner: String,
    pub previous_worker: String,
    pub previous_node_uuid: String,
    pub previous_dir: String,

    pub stream_status: StreamStatus,
    /// Highest CDC sequence acknowledged by the script engine.
    pub last_seq_processed: u64,
    /// Highest sequence whose deferred-timer side effects are persisted.
    pub last_timer_feedback_seq: u64,
    /// Wall-clock tag (seconds since epoch), diagnostics only.
    pub last_checkpoint_time: u64,
}

/// Current wall clock in whole seconds, saturating.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Version token returned by the store; opaque to callers.
pub type CasToken = u64;

/// Result of a compare-and-swap upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write landed; the new token is returned.
    Stored(CasToken),
    /// Someone else wrote first; re-read and retry.
    Conflict,
}

/// Key of the checkpoint blob for one `(app, vbucket)` pair.
pub fn vb_blob_key(app_name: &str, vb: Vbucket) -> String {
    format!("{app_name}::vb::{vb}")
}

/// Byte-level metadata store. Checkpoint blobs are stored as JSON documents;
/// the config loader reads application descriptors and settings through the
/// same interface.
#[async_trait]
pub trait MetaStore: Send + Sync + 'static {
    /// Point get. `None` when the key has never been written.
    async fn get(&self, key: &str) -> anyhow::Result<Option<(Bytes, CasToken)>>;

    /// Compare-and-swap upsert. `expected = None` means "create only if
    /// absent"; a mismatched token yields [`CasOutcome::Conflict`].
    async fn cas_upsert(
        &self,
        key: &str,
        value: Bytes,
        expected: Option<CasToken>,
    ) -> anyhow::Result<CasOutcome>;
}

/// Read and decode a checkpoint blob.
pub async fn read_blob(
    store: &dyn MetaStore,
    key: &str,
) -> anyhow::Result<Option<(CheckpointBlob, CasToken)>> {
    match store.get(key).await? {
        None => Ok(None),
        Some((raw, token)) => {
            let blob: CheckpointBlob = serde_json::from_slice(&raw)?;
            Ok(Some((blob, token)))
        }
    }
}

/// Encode and CAS-write a checkpoint blob.
pub async fn write_blob(
    store: &dyn MetaStore,
    key: &str,
    blob: &CheckpointBlob,
    expected: Option<CasToken>,
) -> anyhow::Result<CasOutcome> {
    let raw = Bytes::from(serde_json::to_vec(blob)?);
    store.cas_upsert(key, raw, expected).await
}

/// In-memory metadata store used for embedding and tests.
#[derive(Default)]
pub struct MemoryMetaStore {
    inner: RwLock<HashMap<String, (Bytes, CasToken)>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a key outside the CAS discipline (test setup).
    pub fn put_raw(&self, key: &str, value: Bytes) {
        let mut inner = self.inner.write().unwrap();
        let token = inner.get(key).map(|(_, t)| t + 1).unwrap_or(1);
        inner.insert(key.to_string(), (value, token));
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<(Bytes, CasToken)>> {
        Ok(self.inner.read().unwrap().get(key).cloned())
    }

    async fn cas_upsert(
        &self,
        key: &str,
        value: Bytes,
        expected: Option<CasToken>,
    ) -> anyhow::Result<CasOutcome> {
        let mut inner = self.inner.write().unwrap();
        let current = inner.get(key).map(|(_, token)| *token);
        match (current, expected) {
            (None, None) => {
                inner.insert(key.to_string(), (value, 1));
                Ok(CasOutcome::Stored(1))
            }
            (Some(token), Some(want)) if token == want => {
                let next = token + 1;
                inner.insert(key.to_string(), (value, next));
                Ok(CasOutcome::Stored(next))
            }
            _ => Ok(CasOutcome::Conflict),
        }
    }
}
