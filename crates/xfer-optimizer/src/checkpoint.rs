//! Checkpoint records and the key -> blob stores that persist them.
//!
//! One record per trial, overwritten in place after every resource unit.
//! A missing record means "start from scratch"; an unreadable one is treated
//! the same way after logging the anomaly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use xfer_types::{CheckpointError, TrialId, TuneResult};

use crate::worker::UnitOutcome;

/// Resumable state of one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub trial_id: TrialId,
    /// Resource units fully completed.
    pub resource_done: u32,
    /// Objective-defined running aggregate (e.g. summed durations).
    pub cumulative_metric: f64,
    /// Metric reported after the last completed unit.
    pub last_metric: Option<f64>,
    /// Opaque objective sub-state.
    #[serde(default)]
    pub state: serde_json::Value,
    /// The objective declared itself finished at `resource_done`.
    #[serde(default)]
    pub done: bool,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// The state of a trial that has not run any unit yet.
    pub fn fresh(trial_id: TrialId) -> Self {
        Self {
            trial_id,
            resource_done: 0,
            cumulative_metric: 0.0,
            last_metric: None,
            state: serde_json::Value::Null,
            done: false,
            updated_at: Utc::now(),
        }
    }

    /// The record after one more unit finished with `outcome`.
    pub fn advance(&self, outcome: &UnitOutcome) -> Self {
        Self {
            trial_id: self.trial_id,
            resource_done: self.resource_done + 1,
            cumulative_metric: outcome.cumulative_metric,
            last_metric: Some(outcome.metric_value),
            state: outcome.state.clone(),
            done: outcome.done,
            updated_at: Utc::now(),
        }
    }

    fn check_consistency(&self, expected: TrialId) -> Result<(), CheckpointError> {
        let corrupt = |message: String| CheckpointError::Corruption {
            trial_id: expected.0,
            message,
        };
        if self.trial_id != expected {
            return Err(corrupt(format!("record belongs to trial {}", self.trial_id)));
        }
        if !self.cumulative_metric.is_finite() {
            return Err(corrupt("cumulative metric is not finite".into()));
        }
        if self.resource_done > 0 && self.last_metric.is_none() {
            return Err(corrupt("progress recorded without a metric".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Blob stores
// ---------------------------------------------------------------------------

/// Durable key -> blob mapping. Reads and writes must be idempotent.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Returns `None` if the key is absent.
    async fn get(&self, key: &str) -> TuneResult<Option<Vec<u8>>>;

    /// Overwrites any existing value.
    async fn put(&self, key: &str, value: Vec<u8>) -> TuneResult<()>;

    /// No-op if the key is absent.
    async fn delete(&self, key: &str) -> TuneResult<()>;
}

/// In-memory blob store; contents are lost with the process.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    store: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn clear(&self) {
        self.store.clear();
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> TuneResult<Option<Vec<u8>>> {
        Ok(self.store.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> TuneResult<()> {
        self.store.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> TuneResult<()> {
        self.store.remove(key);
        Ok(())
    }
}

/// Filesystem blob store: one file per key under `root`.
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// crash mid-write leaves the previous blob intact.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> TuneResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn get(&self, key: &str) -> TuneResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CheckpointError::Store {
                key: key.to_string(),
                message: e.to_string(),
            }
            .into()),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> TuneResult<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> TuneResult<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint store
// ---------------------------------------------------------------------------

/// Typed access to per-trial checkpoint records over any [`BlobStore`].
#[derive(Clone)]
pub struct CheckpointStore {
    blobs: Arc<dyn BlobStore>,
}

impl CheckpointStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBlobStore::new()))
    }

    pub fn key(trial_id: TrialId) -> String {
        format!("trial-{trial_id}/checkpoint.json")
    }

    /// Load the record for `trial_id`. Unreadable or inconsistent records
    /// surface as [`CheckpointError::Corruption`].
    pub async fn load(&self, trial_id: TrialId) -> TuneResult<Option<CheckpointRecord>> {
        let Some(bytes) = self.blobs.get(&Self::key(trial_id)).await? else {
            return Ok(None);
        };
        let record: CheckpointRecord =
            serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Corruption {
                trial_id: trial_id.0,
                message: e.to_string(),
            })?;
        record.check_consistency(trial_id)?;
        Ok(Some(record))
    }

    /// Load the record, treating any failure as "no checkpoint".
    pub async fn load_or_reset(&self, trial_id: TrialId) -> Option<CheckpointRecord> {
        match self.load(trial_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(trial = %trial_id, error = %e, "discarding unreadable checkpoint; restarting from scratch");
                None
            }
        }
    }

    pub async fn save(&self, record: &CheckpointRecord) -> TuneResult<()> {
        let bytes = serde_json::to_vec(record)?;
        self.blobs.put(&Self::key(record.trial_id), bytes).await?;
        debug!(trial = %record.trial_id, resource_done = record.resource_done, "checkpoint written");
        Ok(())
    }

    pub async fn clear(&self, trial_id: TrialId) -> TuneResult<()> {
        self.blobs.delete(&Self::key(trial_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xfer_types::TuneError;

    fn outcome(metric: f64, cumulative: f64) -> UnitOutcome {
        UnitOutcome {
            metric_value: metric,
            cumulative_metric: cumulative,
            state: serde_json::json!({ "last_duration": metric }),
            done: false,
        }
    }

    #[tokio::test]
    async fn absent_checkpoint_loads_as_none() {
        let store = CheckpointStore::in_memory();
        assert!(store.load(TrialId(4)).await.unwrap().is_none());
        assert!(store.load_or_reset(TrialId(4)).await.is_none());
    }

    #[tokio::test]
    async fn round_trip_after_k_units() {
        let store = CheckpointStore::in_memory();
        let mut record = CheckpointRecord::fresh(TrialId(1));
        record = record.advance(&outcome(2.0, 2.0));
        store.save(&record).await.unwrap();
        record = record.advance(&outcome(3.0, 6.0));
        store.save(&record).await.unwrap();

        let loaded = store.load(TrialId(1)).await.unwrap().unwrap();
        assert_eq!(loaded.resource_done, 2);
        assert_eq!(loaded.cumulative_metric, 6.0);
        assert_eq!(loaded.last_metric, Some(3.0));
        assert_eq!(loaded.state["last_duration"], 3.0);
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn garbage_is_reported_as_corruption() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs
            .put(&CheckpointStore::key(TrialId(2)), b"{not json".to_vec())
            .await
            .unwrap();
        let store = CheckpointStore::new(blobs);

        let err = store.load(TrialId(2)).await.unwrap_err();
        assert!(matches!(
            err,
            TuneError::Checkpoint(CheckpointError::Corruption { trial_id: 2, .. })
        ));
        assert!(!err.is_fatal());
        assert!(store.load_or_reset(TrialId(2)).await.is_none());
    }

    #[tokio::test]
    async fn record_for_another_trial_is_inconsistent() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let foreign = CheckpointRecord::fresh(TrialId(8)).advance(&outcome(1.0, 1.0));
        blobs
            .put(
                &CheckpointStore::key(TrialId(3)),
                serde_json::to_vec(&foreign).unwrap(),
            )
            .await
            .unwrap();
        let store = CheckpointStore::new(blobs);
        assert!(store.load(TrialId(3)).await.is_err());
        assert!(store.load_or_reset(TrialId(3)).await.is_none());
    }

    #[tokio::test]
    async fn file_store_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FileBlobStore::new(dir.path()).unwrap());
        let store = CheckpointStore::new(blobs.clone());

        let first = CheckpointRecord::fresh(TrialId(5)).advance(&outcome(1.5, 1.5));
        store.save(&first).await.unwrap();
        let second = first.advance(&outcome(1.0, 2.5));
        store.save(&second).await.unwrap();

        let path = blobs.root().join(CheckpointStore::key(TrialId(5)));
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let loaded = store.load(TrialId(5)).await.unwrap().unwrap();
        assert_eq!(loaded.resource_done, 2);
        assert_eq!(loaded.cumulative_metric, 2.5);

        store.clear(TrialId(5)).await.unwrap();
        assert!(store.load(TrialId(5)).await.unwrap().is_none());
        // Clearing twice is fine.
        store.clear(TrialId(5)).await.unwrap();
    }

    #[tokio::test]
    async fn memory_store_basics() {
        let blobs = MemoryBlobStore::new();
        assert!(blobs.is_empty());
        blobs.put("a", vec![1, 2]).await.unwrap();
        blobs.put("a", vec![3]).await.unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs.get("a").await.unwrap(), Some(vec![3]));
        blobs.delete("a").await.unwrap();
        assert_eq!(blobs.get("a").await.unwrap(), None);
        blobs.put("b", vec![]).await.unwrap();
        blobs.clear();
        assert!(blobs.is_empty());
    }
}
