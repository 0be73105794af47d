use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a job request. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Received,
    InProgress,
    Finished,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Received => "RECEIVED",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome code recorded on a finished (or failing) job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnCode {
    #[default]
    Unspecified,
    Success,
    SuccessWithErrors,
    RetriesExhausted,
    InvalidJob,
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCount {
    pub category: String,
    pub count: u64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorSummary {
    #[serde(default)]
    pub error_counts: Vec<ErrorCount>,
    /// Free-form messages in the order they were appended.
    #[serde(default)]
    pub error_messages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResultInfo {
    pub return_code: ReturnCode,
    pub return_message: String,
    #[serde(default)]
    pub error_summary: ErrorSummary,
    pub finished_at: Option<i64>,
}

impl ResultInfo {
    pub fn success(finished_at: i64) -> Self {
        Self {
            return_code: ReturnCode::Success,
            return_message: "job completed".to_string(),
            error_summary: ErrorSummary::default(),
            finished_at: Some(finished_at),
        }
    }
}

/// What the requester asked for. Carried through to the processor untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestInfo {
    pub job_request_id: String,
    pub input_data_bucket_name: String,
    pub input_data_blob_prefix: String,
    pub output_data_bucket_name: String,
    pub output_data_blob_prefix: String,
    pub postback_url: Option<String>,
    #[serde(default)]
    pub job_parameters: BTreeMap<String, String>,
}

/// Durable record of a job. `request_updated_at` is the compare-and-swap
/// marker; stores reject updates whose marker does not match the stored one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetadata {
    pub job_key: JobKey,
    pub status: JobStatus,
    /// Queue message that most recently claimed this job.
    pub server_job_id: String,
    pub num_attempts: u32,
    pub request_received_at: i64,
    pub request_updated_at: i64,
    pub request_processing_started_at: Option<i64>,
    pub request_info: Option<RequestInfo>,
    pub result_info: Option<ResultInfo>,
    /// Store-level expiry, epoch seconds.
    pub ttl: i64,
}

impl JobMetadata {
    /// A freshly received job, as the frontend writes it before enqueueing.
    pub fn received(
        job_key: JobKey,
        server_job_id: impl Into<String>,
        request_info: RequestInfo,
        now_ms: i64,
        ttl_days: u32,
    ) -> Self {
        Self {
            job_key,
            status: JobStatus::Received,
            server_job_id: server_job_id.into(),
            num_attempts: 0,
            request_received_at: now_ms,
            request_updated_at: now_ms,
            request_processing_started_at: None,
            request_info: Some(request_info),
            result_info: None,
            ttl: now_ms / 1_000 + i64::from(ttl_days) * 86_400,
        }
    }
}

/// A claimed job as handed to the processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub job_key: JobKey,
    pub request_info: RequestInfo,
    pub processing_timeout: Duration,
    pub processing_started_at: Option<i64>,
    pub num_attempts: u32,
    pub created_at: i64,
    pub updated_at: i64,
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub job_key: JobKey,
    pub result_info: ResultInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRetryRequest {
    pub job_key: JobKey,
    pub delay: Duration,
    pub result_info: Option<ResultInfo>,
}
