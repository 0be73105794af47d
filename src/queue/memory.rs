use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::{duration_ms, Clock};
use crate::job::JobKey;
use crate::queue::{JobQueue, JobQueueItem, QueueError};

struct Message {
    job_key: JobKey,
    server_job_id: String,
    processing_timeout: Duration,
    visible_at_ms: i64,
    /// Receipt of the latest delivery; older receipts stop working once the
    /// message is redelivered.
    receipt: Option<String>,
    deliveries: u32,
}

/// In-process queue with visibility timeouts. A received message stays
/// hidden for its processing timeout and then becomes receivable again,
/// which is how redelivery after a crashed consumer is modelled.
pub struct InMemoryJobQueue {
    clock: Arc<dyn Clock>,
    messages: Mutex<Vec<Message>>,
}

impl InMemoryJobQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn new_arc(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::new(clock))
    }

    /// Messages not yet acknowledged, visible or not.
    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Messages receivable right now.
    pub async fn visible_len(&self) -> usize {
        let now = self.clock.now_ms();
        self.messages
            .lock()
            .await
            .iter()
            .filter(|m| m.visible_at_ms <= now)
            .count()
    }

    /// When the message for `job_key` becomes visible, if it is still queued.
    pub async fn visible_at(&self, job_key: &JobKey) -> Option<i64> {
        self.messages
            .lock()
            .await
            .iter()
            .find(|m| &m.job_key == job_key)
            .map(|m| m.visible_at_ms)
    }

    /// Number of times the message for `job_key` has been received.
    pub async fn deliveries(&self, job_key: &JobKey) -> u32 {
        self.messages
            .lock()
            .await
            .iter()
            .find(|m| &m.job_key == job_key)
            .map(|m| m.deliveries)
            .unwrap_or(0)
    }
}

fn receipt_matches(message: &Message, receipt: &str) -> bool {
    message.receipt.as_deref() == Some(receipt)
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn send(
        &self,
        job_key: &JobKey,
        server_job_id: &str,
        processing_timeout: Duration,
    ) -> Result<(), QueueError> {
        let now = self.clock.now_ms();
        self.messages.lock().await.push(Message {
            job_key: job_key.clone(),
            server_job_id: server_job_id.to_string(),
            processing_timeout,
            visible_at_ms: now,
            receipt: None,
            deliveries: 0,
        });
        Ok(())
    }

    async fn receive(&self) -> Result<Option<JobQueueItem>, QueueError> {
        let now = self.clock.now_ms();
        let mut messages = self.messages.lock().await;
        let Some(message) = messages.iter_mut().find(|m| m.visible_at_ms <= now) else {
            return Ok(None);
        };
        let receipt = Uuid::new_v4().to_string();
        message.receipt = Some(receipt.clone());
        message.visible_at_ms = now.saturating_add(duration_ms(message.processing_timeout));
        message.deliveries += 1;
        Ok(Some(JobQueueItem {
            job_key: message.job_key.clone(),
            server_job_id: message.server_job_id.clone(),
            receipt_info: receipt,
            processing_timeout: message.processing_timeout,
            processing_started_at: now,
        }))
    }

    async fn acknowledge(&self, item: &JobQueueItem) -> Result<(), QueueError> {
        let mut messages = self.messages.lock().await;
        messages.retain(|m| !receipt_matches(m, &item.receipt_info));
        Ok(())
    }

    async fn requeue_with_delay(
        &self,
        item: &JobQueueItem,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let now = self.clock.now_ms();
        let mut messages = self.messages.lock().await;
        let message = messages
            .iter_mut()
            .find(|m| receipt_matches(m, &item.receipt_info))
            .ok_or_else(|| QueueError::UnknownReceipt(item.receipt_info.clone()))?;
        message.visible_at_ms = now.saturating_add(duration_ms(delay));
        Ok(())
    }
}
