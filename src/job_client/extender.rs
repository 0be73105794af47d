use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::duration_ms;
use crate::job_client::JobClient;

impl JobClient {
    /// Push back the visibility of every cached in-flight delivery by up to
    /// the configured extension, never past the job's processing deadline.
    /// Deliveries past their deadline are dropped from the cache and left to
    /// be redelivered. Returns how many deliveries were extended.
    pub async fn extend_in_flight(&self) -> usize {
        let items: Vec<_> = self.in_flight.lock().await.values().cloned().collect();
        let now = self.clock.now_ms();
        let mut extended = 0;
        for item in items {
            let deadline = item
                .processing_started_at
                .saturating_add(duration_ms(item.processing_timeout));
            let remaining = deadline.saturating_sub(now);
            if remaining <= 0 {
                debug!(job_key = %item.job_key, "processing deadline passed; dropping cached delivery");
                let mut in_flight = self.in_flight.lock().await;
                if in_flight
                    .get(&item.job_key)
                    .is_some_and(|cached| cached.receipt_info == item.receipt_info)
                {
                    in_flight.remove(&item.job_key);
                }
                continue;
            }
            let extension = duration_ms(self.config.extension).min(remaining);
            let delay = Duration::from_millis(extension as u64);
            match self.queue.requeue_with_delay(&item, delay).await {
                Ok(()) => extended += 1,
                Err(e) => warn!(job_key = %item.job_key, error = %e, "failed to extend visibility"),
            }
        }
        extended
    }
}

/// Extend in-flight visibility every `extender_interval` until shutdown.
pub async fn run_processing_extender(client: Arc<JobClient>, mut shutdown: watch::Receiver<bool>) {
    let interval = client.config().extender_interval;
    info!(?interval, "processing extender started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let extended = client.extend_in_flight().await;
                debug!(extended, "extended in-flight jobs");
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("processing extender stopped");
}
