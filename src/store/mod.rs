//! Durable stores for job metadata and instance termination records.
//!
//! Both stores serialize mutations per record. Job metadata updates are
//! compare-and-swap on `request_updated_at`: the caller hands back the record
//! it read, and the store rejects it with [`StoreError::Conflict`] if another
//! writer got there first. Instance records have no marker; their updates
//! are checked against the stored status instead.
//!
//! - `memory`: in-process stores used by tests and local runs
//! - `slate`: SlateDB-backed store, JSON records under `jobs/` and `asg/`

use async_trait::async_trait;
use thiserror::Error;

use crate::asg_instance::{AsgInstance, InstanceStatus};
use crate::job::{JobKey, JobMetadata};
use crate::storage::StorageError;

pub mod memory;
pub mod slate;

pub use memory::{InMemoryAsgInstanceStore, InMemoryJobMetadataStore};
pub use slate::SlateStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("conflicting update of {key}: {reason}")]
    Conflict { key: String, reason: String },
    #[error("record already exists: {0}")]
    AlreadyExists(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Slate(#[from] slatedb::Error),
    #[error("json serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    fn conflict(key: impl Into<String>, reason: impl Into<String>) -> Self {
        StoreError::Conflict {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait JobMetadataStore: Send + Sync {
    async fn get(&self, job_key: &JobKey) -> Result<Option<JobMetadata>, StoreError>;

    /// Fails with `AlreadyExists` if a record with the same key exists.
    async fn insert(&self, metadata: JobMetadata) -> Result<(), StoreError>;

    /// Compare-and-swap on `request_updated_at`. Returns the stored record,
    /// carrying the new marker.
    async fn update(&self, metadata: JobMetadata) -> Result<JobMetadata, StoreError>;
}

#[async_trait]
pub trait AsgInstanceStore: Send + Sync {
    async fn get(&self, instance_name: &str) -> Result<Option<AsgInstance>, StoreError>;

    async fn list_by_status(&self, status: InstanceStatus)
        -> Result<Vec<AsgInstance>, StoreError>;

    /// Insert or overwrite. `request_time` of an existing record is kept.
    async fn upsert(&self, instance: AsgInstance) -> Result<(), StoreError>;

    /// Overwrite an existing record. Fails with `Conflict` when the record is
    /// missing or already TERMINATED.
    async fn update(&self, instance: AsgInstance) -> Result<AsgInstance, StoreError>;
}

/// The marker written by an update: strictly after the previous one, and
/// wall-clock time when the clock has moved on.
pub fn next_update_marker(previous: i64, now_ms: i64) -> i64 {
    now_ms.max(previous.saturating_add(1))
}

pub(crate) fn check_job_update(
    current: Option<&JobMetadata>,
    mut proposed: JobMetadata,
    now_ms: i64,
) -> Result<JobMetadata, StoreError> {
    let key = proposed.job_key.to_string();
    let current = current.ok_or_else(|| StoreError::NotFound(key.clone()))?;
    if current.request_updated_at != proposed.request_updated_at {
        return Err(StoreError::conflict(
            key,
            format!(
                "stale marker {} (stored {})",
                proposed.request_updated_at, current.request_updated_at
            ),
        ));
    }
    if proposed.num_attempts < current.num_attempts {
        return Err(StoreError::conflict(key, "num_attempts cannot decrease"));
    }
    proposed.request_updated_at = next_update_marker(current.request_updated_at, now_ms);
    Ok(proposed)
}

pub(crate) fn check_instance_update(
    current: Option<&AsgInstance>,
    proposed: &AsgInstance,
) -> Result<(), StoreError> {
    let name = &proposed.instance_name;
    let current = current.ok_or_else(|| StoreError::conflict(name, "record missing"))?;
    if current.is_terminated() {
        return Err(StoreError::conflict(name, "record is TERMINATED"));
    }
    if current.request_time != proposed.request_time {
        return Err(StoreError::conflict(name, "request_time cannot change"));
    }
    Ok(())
}

pub(crate) fn merge_instance_upsert(
    current: Option<&AsgInstance>,
    mut proposed: AsgInstance,
) -> Result<AsgInstance, StoreError> {
    if let Some(current) = current {
        if current.is_terminated() {
            return Err(StoreError::conflict(
                &proposed.instance_name,
                "record is TERMINATED",
            ));
        }
        proposed.request_time = current.request_time;
    }
    Ok(proposed)
}
