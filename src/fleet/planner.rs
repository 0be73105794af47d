use std::sync::Arc;

use tracing::{info, warn};

use crate::asg_instance::{AsgInstance, TerminationReason};
use crate::clock::Clock;
use crate::cloud::{ComputeInstance, InstanceGroupClient};
use crate::fleet::{FleetError, InstanceZoneMap};
use crate::metrics::Metrics;
use crate::store::{AsgInstanceStore, StoreError};

/// Decides which active instances should start terminating.
///
/// Marking is best-effort per instance: a failed write is logged and the
/// instance is reconsidered on the next tick.
pub struct FleetScalingPlanner {
    instances: Arc<dyn AsgInstanceStore>,
    group: Arc<dyn InstanceGroupClient>,
    clock: Arc<dyn Clock>,
    ttl_days: u32,
    metrics: Option<Metrics>,
}

impl FleetScalingPlanner {
    pub fn new(
        instances: Arc<dyn AsgInstanceStore>,
        group: Arc<dyn InstanceGroupClient>,
        clock: Arc<dyn Clock>,
        ttl_days: u32,
    ) -> Self {
        Self {
            instances,
            group,
            clock,
            ttl_days,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Mark every instance not on the group's current template for
    /// replacement and return the ones that are, still grouped by zone.
    pub async fn request_update(
        &self,
        zones: InstanceZoneMap,
    ) -> Result<InstanceZoneMap, FleetError> {
        let template = self.group.current_template().await?;
        let mut current = InstanceZoneMap::new();
        for (zone, instances) in zones {
            let (keep, outdated): (Vec<_>, Vec<_>) = instances
                .into_iter()
                .partition(|i| i.instance_template == template);
            for instance in &outdated {
                info!(
                    instance = %instance.instance_id,
                    template = %instance.instance_template,
                    "instance is on an outdated template"
                );
                self.mark(instance, TerminationReason::Update).await;
            }
            if !keep.is_empty() {
                current.insert(zone, keep);
            }
        }
        Ok(current)
    }

    /// Mark instances above the autoscaler's recommended size for scale-in,
    /// spreading removals across zones. Returns the ids newly marked by this
    /// call.
    pub async fn request_scale_in(&self, zones: &InstanceZoneMap) -> Result<Vec<String>, FleetError> {
        let Some(recommended) = self.group.autoscaler_recommended_size().await? else {
            info!("autoscaler has no recommended size; skipping scale-in");
            return Ok(Vec::new());
        };
        let total: usize = zones.values().map(Vec::len).sum();
        let excess = total.saturating_sub(recommended);
        info!(total, recommended, excess, "scale-in check");
        if excess == 0 {
            return Ok(Vec::new());
        }

        let selected = select_scale_in_candidates(zones, excess);
        let mut marked = Vec::with_capacity(selected.len());
        for instance in selected {
            info!(instance = %instance.instance_id, "selected for scale-in");
            if self.mark(instance, TerminationReason::ScaleIn).await {
                marked.push(instance.instance_id.clone());
            }
        }
        Ok(marked)
    }

    /// True when a new record was written.
    async fn mark(&self, instance: &ComputeInstance, reason: TerminationReason) -> bool {
        match self.try_mark(instance, reason).await {
            Ok(true) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_instance_marked(reason.as_str());
                }
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(
                    instance = %instance.instance_id,
                    reason = reason.as_str(),
                    error = %e,
                    "failed to mark instance for termination"
                );
                false
            }
        }
    }

    /// An instance that already has a record keeps it as is.
    async fn try_mark(
        &self,
        instance: &ComputeInstance,
        reason: TerminationReason,
    ) -> Result<bool, StoreError> {
        if self.instances.get(&instance.instance_id).await?.is_some() {
            return Ok(false);
        }
        let record = AsgInstance::terminating_wait(
            instance.instance_id.clone(),
            reason,
            self.clock.now_ms(),
            self.ttl_days,
        );
        self.instances.upsert(record).await?;
        Ok(true)
    }
}

/// Round-robin across zones: every zone's first instance, then every zone's
/// second, and so on.
pub fn interleave_by_zone(zones: &InstanceZoneMap) -> Vec<&ComputeInstance> {
    let rounds = zones.values().map(Vec::len).max().unwrap_or(0);
    let mut ordered = Vec::with_capacity(zones.values().map(Vec::len).sum());
    for round in 0..rounds {
        for instances in zones.values() {
            if let Some(instance) = instances.get(round) {
                ordered.push(instance);
            }
        }
    }
    ordered
}

/// The last `excess` instances of the interleaved order. Larger zones
/// dominate the tail, so they shrink first.
pub fn select_scale_in_candidates(zones: &InstanceZoneMap, excess: usize) -> Vec<&ComputeInstance> {
    let ordered = interleave_by_zone(zones);
    let start = ordered.len().saturating_sub(excess);
    ordered[start..].to_vec()
}
