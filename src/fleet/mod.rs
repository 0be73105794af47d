//! Fleet lifecycle management.
//!
//! Instances move ACTIVE (no record) -> TERMINATING_WAIT -> TERMINATED. The
//! controller side decides who leaves and deletes overdue instances; the
//! worker side drains, completes its lifecycle action and keeps the
//! termination hook alive while a job is still running.
//!
//! - `reconciler`: overdue deletion and TERMINATED bookkeeping
//! - `planner`: rolling-update and scale-in selection
//! - `heartbeat`: lifecycle hook heartbeats from a draining instance
//! - `lifecycle`: worker-side scale-in handling
//! - `controller`: one tick of reconcile, update and scale-in, and its loop

use std::collections::BTreeMap;

use thiserror::Error;

use crate::cloud::{CloudError, ComputeInstance};
use crate::store::StoreError;

pub mod controller;
pub mod heartbeat;
pub mod lifecycle;
pub mod planner;
pub mod reconciler;

pub use controller::FleetController;
pub use heartbeat::LeaseHeartbeatService;
pub use lifecycle::{LifecycleClient, WorkerLifecycle};
pub use planner::FleetScalingPlanner;
pub use reconciler::InstanceStateReconciler;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error("deletion of {instance_ids:?} still incomplete after {polls} polls")]
    DeletionIncomplete {
        instance_ids: Vec<String>,
        polls: u32,
    },
    #[error("invalid fleet configuration: {0}")]
    Config(String),
}

/// Active instances grouped by zone. Zones iterate in name order.
pub type InstanceZoneMap = BTreeMap<String, Vec<ComputeInstance>>;

/// Zone used for identifiers without a `zones/<zone>/` segment.
pub const UNKNOWN_ZONE: &str = "unknown";

/// Zone segment of a fully qualified instance identifier.
pub fn zone_of(instance_id: &str) -> &str {
    instance_id
        .split_once("zones/")
        .and_then(|(_, rest)| rest.split('/').next())
        .filter(|zone| !zone.is_empty())
        .unwrap_or(UNKNOWN_ZONE)
}

/// Group instances by zone, keeping their relative order within a zone.
pub fn group_by_zone(instances: impl IntoIterator<Item = ComputeInstance>) -> InstanceZoneMap {
    let mut zones = InstanceZoneMap::new();
    for instance in instances {
        zones
            .entry(zone_of(&instance.instance_id).to_string())
            .or_default()
            .push(instance);
    }
    zones
}
