use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::asg_instance::InstanceStatus;
use crate::clock::{duration_ms, Clock};
use crate::cloud::{DeleteOperation, InstanceGroupClient};
use crate::fleet::{group_by_zone, FleetError, InstanceZoneMap};
use crate::metrics::Metrics;
use crate::retry::BackoffPolicy;
use crate::store::AsgInstanceStore;

/// Deletes instances that overstayed their termination wait and records
/// TERMINATED for every TERMINATING_WAIT instance that has left the group.
///
/// Safe to run on every tick: instances may vanish from the group at any
/// point and that is treated as a completed termination, not an error.
pub struct InstanceStateReconciler {
    instances: Arc<dyn AsgInstanceStore>,
    group: Arc<dyn InstanceGroupClient>,
    clock: Arc<dyn Clock>,
    termination_wait_timeout: Duration,
    deletion_poll: BackoffPolicy,
    metrics: Option<Metrics>,
}

impl InstanceStateReconciler {
    pub fn new(
        instances: Arc<dyn AsgInstanceStore>,
        group: Arc<dyn InstanceGroupClient>,
        clock: Arc<dyn Clock>,
        termination_wait_timeout: Duration,
        deletion_poll: BackoffPolicy,
    ) -> Self {
        Self {
            instances,
            group,
            clock,
            termination_wait_timeout,
            deletion_poll,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns the live instances that are not waiting for termination,
    /// grouped by zone.
    pub async fn manage_instances(&self) -> Result<InstanceZoneMap, FleetError> {
        let waiting = self
            .instances
            .list_by_status(InstanceStatus::TerminatingWait)
            .await?;
        let active = self.group.list_active_instances().await?;
        let now = self.clock.now_ms();

        let active_ids: HashSet<&str> = active.iter().map(|i| i.instance_id.as_str()).collect();
        let wait_ms = duration_ms(self.termination_wait_timeout);
        let overdue: Vec<String> = waiting
            .iter()
            .filter(|w| w.request_time.saturating_add(wait_ms) < now)
            .filter(|w| active_ids.contains(w.instance_name.as_str()))
            .map(|w| w.instance_name.clone())
            .collect();

        if !overdue.is_empty() {
            info!(instances = ?overdue, "deleting instances past their termination wait");
            let operation = self.group.delete_instances(&overdue).await?;
            if let Some(metrics) = &self.metrics {
                metrics.record_instance_deletions(overdue.len());
            }
            self.wait_for_deletion(&operation).await?;
        }

        let overdue: HashSet<&str> = overdue.iter().map(String::as_str).collect();
        let now = self.clock.now_ms();
        for mut record in waiting.iter().cloned() {
            let name = record.instance_name.as_str();
            if !overdue.contains(name) && active_ids.contains(name) {
                continue;
            }
            record.status = InstanceStatus::Terminated;
            record.termination_time = Some(now);
            let name = record.instance_name.clone();
            match self.instances.update(record).await {
                Ok(_) => {
                    info!(instance = %name, "instance terminated");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_instance_terminated();
                    }
                }
                Err(e) if e.is_conflict() && self.already_terminated(&name).await? => {
                    info!(instance = %name, "instance was marked terminated concurrently");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let waiting_names: HashSet<&str> =
            waiting.iter().map(|w| w.instance_name.as_str()).collect();
        Ok(group_by_zone(
            active
                .iter()
                .filter(|i| !waiting_names.contains(i.instance_id.as_str()))
                .cloned(),
        ))
    }

    async fn already_terminated(&self, instance_name: &str) -> Result<bool, FleetError> {
        let current = self.instances.get(instance_name).await?;
        Ok(current.is_some_and(|r| r.status == InstanceStatus::Terminated))
    }

    async fn wait_for_deletion(&self, operation: &DeleteOperation) -> Result<(), FleetError> {
        let mut polls = 0;
        loop {
            if self.group.operation_done(operation).await? {
                return Ok(());
            }
            polls += 1;
            match self.deletion_poll.delay_after(polls - 1, 0) {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    warn!(operation = %operation.id, polls, "instance deletion did not finish");
                    return Err(FleetError::DeletionIncomplete {
                        instance_ids: operation.instance_ids.clone(),
                        polls,
                    });
                }
            }
        }
    }
}
