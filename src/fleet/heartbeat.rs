use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::asg_instance::{AsgInstance, InstanceStatus};
use crate::clock::{duration_ms, Clock};
use crate::cloud::LifecycleHookClient;
use crate::fleet::FleetError;
use crate::metrics::Metrics;
use crate::settings::HeartbeatSettings;
use crate::store::AsgInstanceStore;

const MIN_SLEEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub instance_name: String,
    pub poll_interval: Duration,
    pub failure_retry: Duration,
    pub heartbeat_timeout: Option<Duration>,
    pub max_extension: Option<Duration>,
    pub scale_in_hook: Option<String>,
    pub autoscaling_group: Option<String>,
    /// How long before the current heartbeat lapses a new one may be sent.
    pub renewal_margin: Duration,
}

impl HeartbeatConfig {
    pub fn from_settings(settings: &HeartbeatSettings, instance_name: String) -> Self {
        Self {
            enabled: settings.enabled,
            instance_name,
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            failure_retry: Duration::from_secs(settings.failure_retry_secs),
            heartbeat_timeout: settings.heartbeat_timeout_secs.map(Duration::from_secs),
            max_extension: settings.max_extension_secs.map(Duration::from_secs),
            scale_in_hook: settings.scale_in_hook.clone(),
            autoscaling_group: settings.autoscaling_group.clone(),
            renewal_margin: Duration::from_secs(settings.renewal_margin_secs),
        }
    }
}

/// Hook parameters that must all be configured before heartbeats are sent.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatWindow {
    pub heartbeat_timeout_ms: i64,
    pub max_extension_ms: i64,
    pub renewal_margin_ms: i64,
}

impl HeartbeatWindow {
    /// When the next heartbeat may be sent: one timeout after the last
    /// heartbeat (or the termination request), less the renewal margin.
    pub fn renewal_opens_at(&self, record: &AsgInstance) -> i64 {
        record
            .last_heartbeat_time
            .unwrap_or(record.request_time)
            .saturating_add(self.heartbeat_timeout_ms)
            .saturating_sub(self.renewal_margin_ms)
    }

    pub fn extension_deadline(&self, record: &AsgInstance) -> i64 {
        record.request_time.saturating_add(self.max_extension_ms)
    }

    /// Whether a heartbeat is due for `record` at `now_ms`.
    ///
    /// The record must be waiting for termination (or already have been
    /// heartbeated), the extension budget must reach past the end of the
    /// current heartbeat and past now, and the renewal window must be open.
    pub fn should_heartbeat(&self, record: &AsgInstance, now_ms: i64) -> bool {
        let tracked =
            record.status == InstanceStatus::TerminatingWait || record.last_heartbeat_time.is_some();
        let current_lapses_at = record
            .last_heartbeat_time
            .unwrap_or(record.request_time)
            .saturating_add(self.heartbeat_timeout_ms);
        let deadline = self.extension_deadline(record);
        tracked
            && deadline > current_lapses_at
            && deadline > now_ms
            && now_ms >= self.renewal_opens_at(record)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Disabled,
    /// A hook parameter is missing.
    Unconfigured,
    NoRecord,
    /// Nothing to do now; the renewal window opens at the given time, if ever.
    NotDue { next_window_ms: Option<i64> },
    Sent { at_ms: i64 },
}

/// Keeps the scale-in lifecycle hook from forcing termination while this
/// instance still has a job in flight, up to the configured maximum extension.
pub struct LeaseHeartbeatService {
    config: HeartbeatConfig,
    instances: Arc<dyn AsgInstanceStore>,
    hooks: Arc<dyn LifecycleHookClient>,
    clock: Arc<dyn Clock>,
    metrics: Option<Metrics>,
}

impl LeaseHeartbeatService {
    pub fn new(
        config: HeartbeatConfig,
        instances: Arc<dyn AsgInstanceStore>,
        hooks: Arc<dyn LifecycleHookClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            instances,
            hooks,
            clock,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn window(&self) -> Option<(HeartbeatWindow, &str, &str)> {
        let c = &self.config;
        let hook = c.scale_in_hook.as_deref().filter(|h| !h.is_empty())?;
        let group = c.autoscaling_group.as_deref().filter(|g| !g.is_empty())?;
        Some((
            HeartbeatWindow {
                heartbeat_timeout_ms: duration_ms(c.heartbeat_timeout?),
                max_extension_ms: duration_ms(c.max_extension?),
                renewal_margin_ms: duration_ms(c.renewal_margin),
            },
            hook,
            group,
        ))
    }

    /// One pass: look up this instance's record and heartbeat if due.
    pub async fn tick(&self) -> Result<HeartbeatOutcome, FleetError> {
        if !self.config.enabled {
            return Ok(HeartbeatOutcome::Disabled);
        }
        let Some((window, hook, group)) = self.window() else {
            debug!("heartbeat parameters incomplete; skipping");
            return Ok(HeartbeatOutcome::Unconfigured);
        };
        let name = &self.config.instance_name;
        let Some(mut record) = self.instances.get(name).await? else {
            return Ok(HeartbeatOutcome::NoRecord);
        };

        let now = self.clock.now_ms();
        if !window.should_heartbeat(&record, now) {
            let opens = window.renewal_opens_at(&record);
            let next_window_ms =
                (record.status != InstanceStatus::Terminated && opens > now
                    && opens < window.extension_deadline(&record))
                .then_some(opens);
            return Ok(HeartbeatOutcome::NotDue { next_window_ms });
        }

        self.hooks.record_heartbeat(group, name, hook).await?;
        record.last_heartbeat_time = Some(now);
        self.instances.update(record).await?;
        info!(instance = %name, "recorded lifecycle heartbeat");
        if let Some(metrics) = &self.metrics {
            metrics.record_heartbeat("sent");
        }
        Ok(HeartbeatOutcome::Sent { at_ms: now })
    }

    /// How long to sleep after a successful tick.
    pub fn sleep_after(&self, outcome: &HeartbeatOutcome) -> Duration {
        let poll = self.config.poll_interval;
        match outcome {
            HeartbeatOutcome::NotDue {
                next_window_ms: Some(at),
            } => {
                let until = at.saturating_sub(self.clock.now_ms()).max(0) as u64;
                poll.min(Duration::from_millis(until)).max(MIN_SLEEP)
            }
            _ => poll.max(MIN_SLEEP),
        }
    }

    /// Tick until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(instance = %self.config.instance_name, "lifecycle heartbeat service started");
        loop {
            let sleep = match self.tick().await {
                Ok(outcome) => {
                    debug!(?outcome, "heartbeat tick");
                    self.sleep_after(&outcome)
                }
                Err(e) => {
                    error!(error = %e, "heartbeat tick failed");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_heartbeat("failed");
                    }
                    self.config.failure_retry
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("lifecycle heartbeat service stopped");
    }
}
