use tracing::{debug, info, warn};

use crate::job::{Job, JobStatus};
use crate::job_client::lease::{build_job, claimed, is_duplicate_job, retries_exhausted};
use crate::job_client::{ErrorReason, JobClient, JobClientError};
use crate::queue::JobQueueItem;

/// What a single pull found.
#[derive(Debug)]
enum PullOutcome {
    Claimed(Job),
    QueueEmpty,
    /// No metadata yet (or any more); the message was dropped.
    MetadataMissing,
    /// The message belongs to an earlier request for the same key.
    StaleMessage,
    AlreadyFinished,
    RetriesExhausted,
    /// Another worker's claim is still live; left on the queue.
    Duplicate,
}

impl PullOutcome {
    fn label(&self) -> &'static str {
        match self {
            PullOutcome::Claimed(_) => "claimed",
            PullOutcome::QueueEmpty => "queue_empty",
            PullOutcome::MetadataMissing => "metadata_missing",
            PullOutcome::StaleMessage => "stale_message",
            PullOutcome::AlreadyFinished => "already_finished",
            PullOutcome::RetriesExhausted => "retries_exhausted",
            PullOutcome::Duplicate => "duplicate",
        }
    }
}

impl JobClient {
    /// Claim the next job, or `None` once the pull budget is spent or this
    /// instance is being scaled in.
    pub async fn get_job(&self) -> Result<Option<Job>, JobClientError> {
        let result = self.pull_with_backoff().await;
        self.observe(result)
    }

    async fn pull_with_backoff(&self) -> Result<Option<Job>, JobClientError> {
        if let Some(lifecycle) = &self.lifecycle {
            if lifecycle
                .handle_scale_in()
                .await
                .map_err(JobClientError::Lifecycle)?
            {
                info!("instance is draining for scale-in; not pulling jobs");
                return Ok(None);
            }
        }

        let policy = &self.config.pull_backoff;
        for attempt in 0..policy.max_attempts.max(1) {
            let outcome = self.pull_once().await?;
            if let Some(metrics) = &self.metrics {
                metrics.record_job_pull(outcome.label());
            }
            match outcome {
                PullOutcome::Claimed(job) => return Ok(Some(job)),
                other => debug!(attempt, outcome = other.label(), "no job claimed"),
            }
            if let Some(delay) = policy.delay_after(attempt, self.clock.now_ms()) {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(None)
    }

    async fn pull_once(&self) -> Result<PullOutcome, JobClientError> {
        let Some(item) = self
            .queue
            .receive()
            .await
            .map_err(|e| JobClientError::queue(ErrorReason::JobPullFailed, e))?
        else {
            return Ok(PullOutcome::QueueEmpty);
        };
        let key = item.job_key.clone();

        let Some(metadata) = self
            .metadata
            .get(&key)
            .await
            .map_err(|e| JobClientError::store(ErrorReason::JobPullFailed, &key, e))?
        else {
            warn!(job_key = %key, "queue message has no job metadata; dropping");
            self.drop_message(&item, "metadata_missing").await?;
            return Ok(PullOutcome::MetadataMissing);
        };

        if !item.server_job_id.is_empty()
            && !metadata.server_job_id.is_empty()
            && item.server_job_id != metadata.server_job_id
        {
            warn!(
                job_key = %key,
                message_server_job_id = %item.server_job_id,
                metadata_server_job_id = %metadata.server_job_id,
                "stale queue message; dropping"
            );
            self.drop_message(&item, "stale_message").await?;
            return Ok(PullOutcome::StaleMessage);
        }

        let status = metadata.status;
        match status {
            JobStatus::Finished => {
                info!(job_key = %key, "job already finished; dropping message");
                self.drop_message(&item, "already_finished").await?;
                return Ok(PullOutcome::AlreadyFinished);
            }
            _ if metadata.num_attempts >= self.config.max_attempts => {
                let attempts = metadata.num_attempts;
                let finalized =
                    retries_exhausted(metadata, self.config.max_attempts, self.clock.now_ms());
                self.metadata
                    .update(finalized)
                    .await
                    .map_err(|e| JobClientError::store(ErrorReason::JobPullFailed, &key, e))?;
                self.record_transition(status, JobStatus::Finished);
                warn!(job_key = %key, attempts, "job retries exhausted; finalized");
                self.drop_message(&item, "retries_exhausted").await?;
                return Ok(PullOutcome::RetriesExhausted);
            }
            _ => {}
        }

        let job = build_job(&item, &metadata)?;
        let now = self.clock.now_ms();
        if is_duplicate_job(&job, now) {
            info!(job_key = %key, "job is held by another worker; skipping");
            return Ok(PullOutcome::Duplicate);
        }

        let stored = self
            .metadata
            .update(claimed(metadata, now))
            .await
            .map_err(|e| JobClientError::store(ErrorReason::JobPullFailed, &key, e))?;
        self.record_transition(status, JobStatus::InProgress);
        let job = Job {
            status: stored.status,
            processing_started_at: stored.request_processing_started_at,
            num_attempts: stored.num_attempts,
            updated_at: stored.request_updated_at,
            ..job
        };
        info!(job_key = %key, attempts = job.num_attempts, "claimed job");
        self.in_flight.lock().await.insert(key, item);
        Ok(PullOutcome::Claimed(job))
    }

    async fn drop_message(&self, item: &JobQueueItem, reason: &str) -> Result<(), JobClientError> {
        self.queue
            .acknowledge(item)
            .await
            .map_err(|e| JobClientError::queue(ErrorReason::JobPullFailed, e))?;
        if let Some(metrics) = &self.metrics {
            metrics.record_queue_message_dropped(reason);
        }
        Ok(())
    }
}
