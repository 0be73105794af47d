//! Worker-side job lease management.
//!
//! [`JobClient`] is the only component that moves a job's metadata between
//! RECEIVED, IN_PROGRESS and FINISHED. Every transition is a compare-and-swap
//! on the record's `request_updated_at`; a lost race surfaces as a store
//! conflict and is never retried here.
//!
//! - `lease`: job building, duplicate detection and the claim/finalize records
//! - `pull`: the `get_job` pull loop
//! - `complete`: completion, retry and error-message operations
//! - `extender`: keeps in-flight queue items hidden while they are processed

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::fleet::lifecycle::LifecycleClient;
use crate::fleet::FleetError;
use crate::job::{JobKey, JobStatus};
use crate::metrics::Metrics;
use crate::queue::{JobQueue, JobQueueItem, QueueError};
use crate::retry::BackoffPolicy;
use crate::settings::JobClientSettings;
use crate::store::{JobMetadataStore, StoreError};

mod complete;
pub mod extender;
pub mod lease;
mod pull;

pub use lease::{build_job, is_duplicate_job};

#[derive(Debug, Clone)]
pub struct JobClientConfig {
    /// Attempts after which an IN_PROGRESS job is finalized as RETRIES_EXHAUSTED.
    pub max_attempts: u32,
    pub pull_backoff: BackoffPolicy,
    /// Largest delay `return_job_for_retry` accepts.
    pub max_retry_delay: Duration,
    pub extender_interval: Duration,
    /// Upper bound on one visibility extension.
    pub extension: Duration,
}

impl Default for JobClientConfig {
    fn default() -> Self {
        Self::from(&JobClientSettings::default())
    }
}

impl From<&JobClientSettings> for JobClientConfig {
    fn from(s: &JobClientSettings) -> Self {
        Self {
            max_attempts: s.max_attempts,
            pull_backoff: BackoffPolicy {
                max_attempts: s.pull_max_attempts,
                initial_interval_ms: s.pull_initial_backoff_ms,
                max_interval_ms: s.pull_max_backoff_ms,
                backoff_factor: s.pull_backoff_factor,
                randomize_interval: true,
            },
            max_retry_delay: Duration::from_secs(s.max_retry_delay_secs),
            extender_interval: Duration::from_secs(s.extender_interval_secs),
            extension: Duration::from_secs(s.extension_secs),
        }
    }
}

/// Classification of job client failures, used as the error metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    JobPullFailed,
    JobReceiptHandleNotFound,
    JobMetadataNotFound,
    WrongJobStatus,
    JobDelayOutOfRange,
    ReturnJobForRetryFailed,
    JobMarkCompletionFailed,
    JobErrorSummaryUpdateFailed,
}

impl ErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorReason::JobPullFailed => "JOB_PULL_FAILED",
            ErrorReason::JobReceiptHandleNotFound => "JOB_RECEIPT_HANDLE_NOT_FOUND",
            ErrorReason::JobMetadataNotFound => "JOB_METADATA_NOT_FOUND",
            ErrorReason::WrongJobStatus => "WRONG_JOB_STATUS",
            ErrorReason::JobDelayOutOfRange => "JOB_DELAY_OUT_OF_RANGE",
            ErrorReason::ReturnJobForRetryFailed => "RETURN_JOB_FOR_RETRY_FAILED",
            ErrorReason::JobMarkCompletionFailed => "JOB_MARK_COMPLETION_FAILED",
            ErrorReason::JobErrorSummaryUpdateFailed => "JOB_ERROR_SUMMARY_UPDATE_FAILED",
        }
    }
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum JobClientError {
    #[error("no job metadata for {0}")]
    MetadataNotFound(JobKey),
    #[error("job {job_key} is {status}, expected IN_PROGRESS")]
    WrongStatus { job_key: JobKey, status: JobStatus },
    #[error("retry delay {delay:?} for job {job_key} is outside [0, {max:?}]")]
    DelayOutOfRange {
        job_key: JobKey,
        delay: Duration,
        max: Duration,
    },
    #[error("job {0} has no request info")]
    MissingRequestInfo(JobKey),
    #[error("{reason}: store error for job {job_key}: {source}")]
    Store {
        reason: ErrorReason,
        job_key: JobKey,
        #[source]
        source: StoreError,
    },
    #[error("{reason}: queue error: {source}")]
    Queue {
        reason: ErrorReason,
        #[source]
        source: QueueError,
    },
    #[error("scale-in check failed: {0}")]
    Lifecycle(#[source] FleetError),
}

impl JobClientError {
    pub fn reason(&self) -> ErrorReason {
        match self {
            JobClientError::MetadataNotFound(_) => ErrorReason::JobMetadataNotFound,
            JobClientError::WrongStatus { .. } => ErrorReason::WrongJobStatus,
            JobClientError::DelayOutOfRange { .. } => ErrorReason::JobDelayOutOfRange,
            JobClientError::MissingRequestInfo(_) => ErrorReason::JobPullFailed,
            JobClientError::Store { reason, .. } | JobClientError::Queue { reason, .. } => *reason,
            JobClientError::Lifecycle(_) => ErrorReason::JobPullFailed,
        }
    }

    /// True when another writer updated the record first.
    pub fn is_conflict(&self) -> bool {
        matches!(self, JobClientError::Store { source, .. } if source.is_conflict())
    }

    pub(crate) fn store(reason: ErrorReason, job_key: &JobKey, source: StoreError) -> Self {
        JobClientError::Store {
            reason,
            job_key: job_key.clone(),
            source,
        }
    }

    pub(crate) fn queue(reason: ErrorReason, source: QueueError) -> Self {
        let reason = match &source {
            QueueError::UnknownReceipt(_) => ErrorReason::JobReceiptHandleNotFound,
            _ => reason,
        };
        JobClientError::Queue { reason, source }
    }
}

/// Claims jobs from the queue and drives their metadata records.
///
/// The queue item behind each successful claim is cached by job key until the
/// job is completed or returned, so the same delivery can be acknowledged or
/// rescheduled.
pub struct JobClient {
    queue: Arc<dyn JobQueue>,
    metadata: Arc<dyn JobMetadataStore>,
    clock: Arc<dyn Clock>,
    config: JobClientConfig,
    lifecycle: Option<Arc<LifecycleClient>>,
    in_flight: Mutex<HashMap<JobKey, JobQueueItem>>,
    metrics: Option<Metrics>,
}

impl JobClient {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        metadata: Arc<dyn JobMetadataStore>,
        clock: Arc<dyn Clock>,
        config: JobClientConfig,
    ) -> Self {
        Self {
            queue,
            metadata,
            clock,
            config,
            lifecycle: None,
            in_flight: Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    /// Check for a pending scale-in of this instance before every pull.
    pub fn with_lifecycle(mut self, lifecycle: Arc<LifecycleClient>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &JobClientConfig {
        &self.config
    }

    /// Number of claimed jobs whose queue item is cached.
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    fn observe<T>(&self, result: Result<T, JobClientError>) -> Result<T, JobClientError> {
        if let (Err(e), Some(metrics)) = (&result, &self.metrics) {
            metrics.record_job_client_error(e.reason().as_str());
        }
        result
    }

    fn record_transition(&self, from: JobStatus, to: JobStatus) {
        if let Some(metrics) = &self.metrics {
            metrics.record_job_transition(from.as_str(), to.as_str());
        }
    }
}
