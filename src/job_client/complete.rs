use tracing::{info, warn};

use crate::job::{JobKey, JobMetadata, JobResult, JobRetryRequest, JobStatus, ResultInfo};
use crate::job_client::{ErrorReason, JobClient, JobClientError};
use crate::queue::JobQueueItem;

impl JobClient {
    /// Finish a claimed job: FINISHED, merged result, one more attempt, then
    /// acknowledge the delivery so it is not redelivered.
    pub async fn mark_job_completed(&self, result: JobResult) -> Result<(), JobClientError> {
        let outcome = self.complete(result).await;
        self.observe(outcome)
    }

    async fn complete(&self, result: JobResult) -> Result<(), JobClientError> {
        let reason = ErrorReason::JobMarkCompletionFailed;
        let key = result.job_key;
        let mut metadata = self.load_in_progress(&key, reason).await?;
        metadata.status = JobStatus::Finished;
        metadata.result_info = Some(result.result_info);
        metadata.num_attempts += 1;
        self.metadata
            .update(metadata)
            .await
            .map_err(|e| JobClientError::store(reason, &key, e))?;
        self.record_transition(JobStatus::InProgress, JobStatus::Finished);

        match self.take_in_flight(&key).await {
            Some(item) => self
                .queue
                .acknowledge(&item)
                .await
                .map_err(|e| JobClientError::queue(reason, e))?,
            None => warn!(
                job_key = %key,
                "no cached queue item; redelivery will be dropped as finished"
            ),
        }
        info!(job_key = %key, "job completed");
        Ok(())
    }

    /// Hand a claimed job back: RECEIVED with the merged result, one more
    /// attempt, and the delivery made visible again after `request.delay`.
    pub async fn return_job_for_retry(&self, request: JobRetryRequest) -> Result<(), JobClientError> {
        let outcome = self.return_for_retry(request).await;
        self.observe(outcome)
    }

    async fn return_for_retry(&self, request: JobRetryRequest) -> Result<(), JobClientError> {
        let reason = ErrorReason::ReturnJobForRetryFailed;
        let key = request.job_key;
        if request.delay > self.config.max_retry_delay {
            return Err(JobClientError::DelayOutOfRange {
                job_key: key,
                delay: request.delay,
                max: self.config.max_retry_delay,
            });
        }
        let mut metadata = self.load_in_progress(&key, reason).await?;
        metadata.status = JobStatus::Received;
        metadata.num_attempts += 1;
        if let Some(result_info) = request.result_info {
            metadata.result_info = Some(result_info);
        }
        self.metadata
            .update(metadata)
            .await
            .map_err(|e| JobClientError::store(reason, &key, e))?;
        self.record_transition(JobStatus::InProgress, JobStatus::Received);

        match self.take_in_flight(&key).await {
            Some(item) => self
                .queue
                .requeue_with_delay(&item, request.delay)
                .await
                .map_err(|e| JobClientError::queue(reason, e))?,
            None => warn!(
                job_key = %key,
                "no cached queue item; job waits for its visibility timeout"
            ),
        }
        info!(job_key = %key, delay = ?request.delay, "job returned for retry");
        Ok(())
    }

    /// Append `message` to the job's error summary and refresh `finished_at`.
    pub async fn append_job_error_message(
        &self,
        job_key: &JobKey,
        message: impl Into<String>,
    ) -> Result<(), JobClientError> {
        let outcome = self.append_error(job_key, message.into()).await;
        self.observe(outcome)
    }

    async fn append_error(&self, key: &JobKey, message: String) -> Result<(), JobClientError> {
        let reason = ErrorReason::JobErrorSummaryUpdateFailed;
        let mut metadata = self.load_in_progress(key, reason).await?;
        let result_info = metadata.result_info.get_or_insert_with(ResultInfo::default);
        result_info.error_summary.error_messages.push(message);
        result_info.finished_at = Some(self.clock.now_ms());
        self.metadata
            .update(metadata)
            .await
            .map_err(|e| JobClientError::store(reason, key, e))?;
        Ok(())
    }

    async fn load_in_progress(
        &self,
        key: &JobKey,
        reason: ErrorReason,
    ) -> Result<JobMetadata, JobClientError> {
        let metadata = self
            .metadata
            .get(key)
            .await
            .map_err(|e| JobClientError::store(reason, key, e))?
            .ok_or_else(|| JobClientError::MetadataNotFound(key.clone()))?;
        if metadata.status != JobStatus::InProgress {
            return Err(JobClientError::WrongStatus {
                job_key: key.clone(),
                status: metadata.status,
            });
        }
        Ok(metadata)
    }

    async fn take_in_flight(&self, key: &JobKey) -> Option<JobQueueItem> {
        self.in_flight.lock().await.remove(key)
    }
}
