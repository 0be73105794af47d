//! At-least-once job queue.
//!
//! - `memory`: in-process queue with per-message visibility timeouts

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::job::JobKey;

pub mod memory;

pub use memory::InMemoryJobQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("no in-flight message for receipt {0}")]
    UnknownReceipt(String),
}

/// A received message. Only valid until it is acknowledged or its
/// visibility lapses and another consumer receives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobQueueItem {
    pub job_key: JobKey,
    pub server_job_id: String,
    /// Opaque handle identifying this delivery of the message.
    pub receipt_info: String,
    pub processing_timeout: Duration,
    /// When this delivery was received, epoch ms.
    pub processing_started_at: i64,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job message.
    async fn send(
        &self,
        job_key: &JobKey,
        server_job_id: &str,
        processing_timeout: Duration,
    ) -> Result<(), QueueError>;

    /// Receive one visible message, hiding it for its processing timeout.
    async fn receive(&self) -> Result<Option<JobQueueItem>, QueueError>;

    /// Remove the message so it is never redelivered. Acknowledging a
    /// message that is already gone, or that was redelivered under a newer
    /// receipt, is a no-op.
    async fn acknowledge(&self, item: &JobQueueItem) -> Result<(), QueueError>;

    /// Make the message visible again after `delay`. Also used to extend the
    /// visibility of an item that is still being processed.
    async fn requeue_with_delay(
        &self,
        item: &JobQueueItem,
        delay: Duration,
    ) -> Result<(), QueueError>;
}
