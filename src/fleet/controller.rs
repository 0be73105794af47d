use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::clock::Clock;
use crate::cloud::InstanceGroupClient;
use crate::fleet::{FleetError, FleetScalingPlanner, InstanceStateReconciler};
use crate::metrics::Metrics;
use crate::retry::BackoffPolicy;
use crate::settings::FleetSettings;
use crate::store::AsgInstanceStore;

/// What one controller tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Live instances not waiting for termination when the tick started.
    pub active: usize,
    /// Instances left after removing those on an outdated template.
    pub current: usize,
    pub scaled_in: Vec<String>,
}

/// Runs reconciliation, then the update pass, then the scale-in pass.
pub struct FleetController {
    reconciler: InstanceStateReconciler,
    planner: FleetScalingPlanner,
    tick_interval: Duration,
}

impl FleetController {
    pub fn new(
        reconciler: InstanceStateReconciler,
        planner: FleetScalingPlanner,
        tick_interval: Duration,
    ) -> Self {
        Self {
            reconciler,
            planner,
            tick_interval,
        }
    }

    /// Wire a controller from fleet settings.
    pub fn from_settings(
        settings: &FleetSettings,
        instances: Arc<dyn AsgInstanceStore>,
        group: Arc<dyn InstanceGroupClient>,
        clock: Arc<dyn Clock>,
        metrics: Option<Metrics>,
    ) -> Self {
        let mut reconciler = InstanceStateReconciler::new(
            Arc::clone(&instances),
            Arc::clone(&group),
            Arc::clone(&clock),
            settings.termination_wait_timeout(),
            BackoffPolicy::deletion_poll(
                settings.delete_poll_max_retries,
                settings.delete_poll_base_ms,
            ),
        );
        let mut planner =
            FleetScalingPlanner::new(instances, group, clock, settings.asg_instance_ttl_days);
        if let Some(metrics) = metrics {
            reconciler = reconciler.with_metrics(metrics.clone());
            planner = planner.with_metrics(metrics);
        }
        Self::new(reconciler, planner, settings.tick_interval())
    }

    pub async fn run_tick(&self) -> Result<TickSummary, FleetError> {
        let zones = self.reconciler.manage_instances().await?;
        let active: usize = zones.values().map(Vec::len).sum();
        let current_zones = self.planner.request_update(zones).await?;
        let current: usize = current_zones.values().map(Vec::len).sum();
        let scaled_in = self.planner.request_scale_in(&current_zones).await?;
        Ok(TickSummary {
            active,
            current,
            scaled_in,
        })
    }

    /// Tick every `tick_interval` until shutdown. A failed tick is logged
    /// and the whole pass is retried on the next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.tick_interval, "fleet controller started");
        loop {
            match self.run_tick().await {
                Ok(summary) => info!(
                    active = summary.active,
                    current = summary.current,
                    scaled_in = summary.scaled_in.len(),
                    "fleet tick complete"
                ),
                Err(e) => error!(error = %e, "fleet tick failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.tick_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("fleet controller stopped");
    }
}
