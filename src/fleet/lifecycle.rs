use std::sync::Arc;

use tracing::info;

use crate::asg_instance::InstanceStatus;
use crate::clock::Clock;
use crate::cloud::LifecycleHookClient;
use crate::fleet::heartbeat::{HeartbeatConfig, LeaseHeartbeatService};
use crate::fleet::FleetError;
use crate::metrics::Metrics;
use crate::settings::HeartbeatSettings;
use crate::store::AsgInstanceStore;

/// Worker-side view of this instance's termination lifecycle.
pub struct LifecycleClient {
    instance_name: String,
    autoscaling_group: Option<String>,
    scale_in_hook: Option<String>,
    instances: Arc<dyn AsgInstanceStore>,
    hooks: Arc<dyn LifecycleHookClient>,
    clock: Arc<dyn Clock>,
}

impl LifecycleClient {
    pub fn new(
        instance_name: impl Into<String>,
        autoscaling_group: Option<String>,
        scale_in_hook: Option<String>,
        instances: Arc<dyn AsgInstanceStore>,
        hooks: Arc<dyn LifecycleHookClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            instance_name: instance_name.into(),
            autoscaling_group: autoscaling_group.filter(|g| !g.is_empty()),
            scale_in_hook: scale_in_hook.filter(|h| !h.is_empty()),
            instances,
            hooks,
            clock,
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// The provider's lifecycle state for this instance.
    pub async fn lifecycle_state(&self) -> Result<String, FleetError> {
        Ok(self
            .hooks
            .describe_lifecycle_state(&self.instance_name)
            .await?)
    }

    /// If this instance has been chosen for termination, let the scale-in
    /// proceed and record it as TERMINATED. Returns true when the instance
    /// has a termination record and should stop taking work.
    pub async fn handle_scale_in(&self) -> Result<bool, FleetError> {
        let (Some(group), Some(hook)) = (&self.autoscaling_group, &self.scale_in_hook) else {
            return Ok(false);
        };
        let Some(mut record) = self.instances.get(&self.instance_name).await? else {
            return Ok(false);
        };
        if record.status == InstanceStatus::TerminatingWait {
            info!(instance = %self.instance_name, "completing scale-in lifecycle action");
            self.hooks
                .complete_lifecycle_action(group, &self.instance_name, hook)
                .await?;
            record.status = InstanceStatus::Terminated;
            record.termination_time = Some(self.clock.now_ms());
            self.instances.update(record).await?;
        }
        Ok(true)
    }
}

/// The scale-in pieces a worker instance runs next to its pull loop: the
/// lifecycle client consulted before each pull, and the heartbeat service
/// holding the hook open while work is in flight.
pub struct WorkerLifecycle {
    pub client: Arc<LifecycleClient>,
    pub heartbeat: LeaseHeartbeatService,
}

impl WorkerLifecycle {
    /// `None` when heartbeats are disabled. Both halves share the instance
    /// name, hook and group from `settings`.
    pub fn from_settings(
        settings: &HeartbeatSettings,
        instances: Arc<dyn AsgInstanceStore>,
        hooks: Arc<dyn LifecycleHookClient>,
        clock: Arc<dyn Clock>,
        metrics: Option<Metrics>,
    ) -> anyhow::Result<Option<Self>> {
        if !settings.enabled {
            return Ok(None);
        }
        let instance_name = settings.resolve_instance_name()?;
        let client = LifecycleClient::new(
            instance_name.clone(),
            settings.autoscaling_group.clone(),
            settings.scale_in_hook.clone(),
            Arc::clone(&instances),
            Arc::clone(&hooks),
            Arc::clone(&clock),
        );
        let mut heartbeat = LeaseHeartbeatService::new(
            HeartbeatConfig::from_settings(settings, instance_name),
            instances,
            hooks,
            clock,
        );
        if let Some(metrics) = metrics {
            heartbeat = heartbeat.with_metrics(metrics);
        }
        Ok(Some(Self {
            client: Arc::new(client),
            heartbeat,
        }))
    }
}
