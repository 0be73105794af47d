use crate::clock::duration_ms;
use crate::job::{Job, JobMetadata, JobStatus, ResultInfo, ReturnCode};
use crate::job_client::{JobClient, JobClientError};
use crate::queue::JobQueueItem;

/// Combine a queue delivery with the job's current metadata.
pub fn build_job(item: &JobQueueItem, metadata: &JobMetadata) -> Result<Job, JobClientError> {
    let request_info = metadata
        .request_info
        .clone()
        .ok_or_else(|| JobClientError::MissingRequestInfo(metadata.job_key.clone()))?;
    Ok(Job {
        job_key: metadata.job_key.clone(),
        request_info,
        processing_timeout: item.processing_timeout,
        processing_started_at: metadata.request_processing_started_at,
        num_attempts: metadata.num_attempts,
        created_at: metadata.request_received_at,
        updated_at: metadata.request_updated_at,
        status: metadata.status,
    })
}

/// True while another worker's claim on `job` is still within its
/// processing timeout. Advisory only: the compare-and-swap on the claim is
/// what actually prevents two owners.
pub fn is_duplicate_job(job: &Job, now_ms: i64) -> bool {
    match (job.status, job.processing_started_at) {
        (JobStatus::InProgress, Some(started)) => {
            now_ms.saturating_sub(started) < duration_ms(job.processing_timeout)
        }
        _ => false,
    }
}

impl JobClient {
    pub fn is_duplicate_job(&self, job: &Job) -> bool {
        is_duplicate_job(job, self.clock.now_ms())
    }
}

/// The record written when a worker claims the job. Re-claiming a job whose
/// previous IN_PROGRESS lease lapsed counts the abandoned attempt.
pub(crate) fn claimed(mut metadata: JobMetadata, now_ms: i64) -> JobMetadata {
    if metadata.status == JobStatus::InProgress {
        metadata.num_attempts += 1;
    }
    metadata.status = JobStatus::InProgress;
    metadata.request_processing_started_at = Some(now_ms);
    metadata
}

/// The record written when a job ran out of attempts. Previously collected
/// error messages are kept.
pub(crate) fn retries_exhausted(
    mut metadata: JobMetadata,
    max_attempts: u32,
    now_ms: i64,
) -> JobMetadata {
    let error_summary = metadata
        .result_info
        .take()
        .map(|r| r.error_summary)
        .unwrap_or_default();
    metadata.status = JobStatus::Finished;
    metadata.result_info = Some(ResultInfo {
        return_code: ReturnCode::RetriesExhausted,
        return_message: format!(
            "job gave up after {} of {} allowed attempts",
            metadata.num_attempts, max_attempts
        ),
        error_summary,
        finished_at: Some(now_ms),
    });
    metadata
}
