use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::job::{Job, JobResult, JobRetryRequest, ResultInfo};
use crate::job_client::{JobClient, JobClientError};
use crate::metrics::Metrics;

#[derive(Debug, Error)]
pub enum ProcessingError {
    /// Hand the job back to the queue after `delay`.
    #[error("retryable processing failure: {message}")]
    Retry {
        message: String,
        delay: Duration,
        result_info: Option<ResultInfo>,
    },
    /// Record the failure on the job and leave it to lease expiry, which
    /// counts the attempt.
    #[error("processing failed: {0}")]
    Failed(String),
}

/// The work done on a claimed job.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> Result<JobResult, ProcessingError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub conflicts: u64,
}

/// A worker's pull loop: claim, process, report.
pub struct WorkerPullService {
    client: Arc<JobClient>,
    processor: Arc<dyn JobProcessor>,
    metrics: Option<Metrics>,
}

impl WorkerPullService {
    pub fn new(client: Arc<JobClient>, processor: Arc<dyn JobProcessor>) -> Self {
        Self {
            client,
            processor,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Pull until no job is available or shutdown is requested. A claim
    /// lost to another worker is skipped; other pull failures end the loop.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<WorkerStats, JobClientError> {
        let mut stats = WorkerStats::default();
        loop {
            if *shutdown.borrow() {
                info!("worker shutting down");
                break;
            }
            let job = match self.client.get_job().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    info!("no job available; worker exiting");
                    break;
                }
                Err(e) if e.is_conflict() => {
                    warn!(error = %e, "lost a claim race; pulling again");
                    stats.conflicts += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let outcome = self.handle(job, &mut stats).await;
            if let Some(metrics) = &self.metrics {
                metrics.record_job_processed(outcome);
            }
        }
        Ok(stats)
    }

    async fn handle(&self, job: Job, stats: &mut WorkerStats) -> &'static str {
        let key = job.job_key.clone();
        match self.processor.process(&job).await {
            Ok(result) => match self.client.mark_job_completed(result).await {
                Ok(()) => {
                    stats.completed += 1;
                    "completed"
                }
                Err(e) => {
                    error!(job_key = %key, error = %e, "failed to mark job completed");
                    stats.failed += 1;
                    "report_failed"
                }
            },
            Err(ProcessingError::Retry {
                message,
                delay,
                result_info,
            }) => {
                warn!(job_key = %key, %message, ?delay, "job will be retried");
                let request = JobRetryRequest {
                    job_key: key.clone(),
                    delay,
                    result_info,
                };
                match self.client.return_job_for_retry(request).await {
                    Ok(()) => {
                        stats.retried += 1;
                        "retried"
                    }
                    Err(e) => {
                        error!(job_key = %key, error = %e, "failed to return job for retry");
                        stats.failed += 1;
                        "report_failed"
                    }
                }
            }
            Err(ProcessingError::Failed(message)) => {
                error!(job_key = %key, %message, "job processing failed");
                if let Err(e) = self.client.append_job_error_message(&key, message).await {
                    error!(job_key = %key, error = %e, "failed to record job error");
                }
                stats.failed += 1;
                "failed"
            }
        }
    }
}

/// Completes every job with a SUCCESS result.
pub struct PassThroughProcessor {
    clock: Arc<dyn Clock>,
}

impl PassThroughProcessor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl JobProcessor for PassThroughProcessor {
    async fn process(&self, job: &Job) -> Result<JobResult, ProcessingError> {
        Ok(JobResult {
            job_key: job.job_key.clone(),
            result_info: ResultInfo::success(self.clock.now_ms()),
        })
    }
}
