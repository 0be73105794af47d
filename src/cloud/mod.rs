//! Managed instance group and lifecycle hook clients.
//!
//! Concrete cloud bindings live outside this crate. `memory` provides a
//! simulated group and a recording hook client for local runs and tests.

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;

pub use memory::{RecordingLifecycleHooks, SimulatedInstanceGroup};

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("cloud api unavailable: {0}")]
    Unavailable(String),
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
}

/// A live member of the managed instance group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComputeInstance {
    /// Fully qualified identifier, e.g.
    /// `projects/p/zones/us-central1-a/instances/worker-1`.
    pub instance_id: String,
    /// Template the instance was created from.
    pub instance_template: String,
}

impl ComputeInstance {
    pub fn new(instance_id: impl Into<String>, instance_template: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            instance_template: instance_template.into(),
        }
    }
}

/// Handle of an asynchronous deletion started by
/// [`InstanceGroupClient::delete_instances`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOperation {
    pub id: String,
    pub instance_ids: Vec<String>,
}

#[async_trait]
pub trait InstanceGroupClient: Send + Sync {
    /// Instances that are not already being deleted.
    async fn list_active_instances(&self) -> Result<Vec<ComputeInstance>, CloudError>;

    async fn delete_instances(&self, instance_ids: &[String])
        -> Result<DeleteOperation, CloudError>;

    async fn operation_done(&self, operation: &DeleteOperation) -> Result<bool, CloudError>;

    async fn autoscaler_recommended_size(&self) -> Result<Option<usize>, CloudError>;

    async fn current_template(&self) -> Result<String, CloudError>;
}

#[async_trait]
pub trait LifecycleHookClient: Send + Sync {
    async fn describe_lifecycle_state(&self, instance_id: &str) -> Result<String, CloudError>;

    /// Let a scale-in continue (lifecycle action result CONTINUE).
    async fn complete_lifecycle_action(
        &self,
        group: &str,
        instance_id: &str,
        hook: &str,
    ) -> Result<(), CloudError>;

    /// Postpone the hook's forced termination by one heartbeat timeout.
    async fn record_heartbeat(
        &self,
        group: &str,
        instance_id: &str,
        hook: &str,
    ) -> Result<(), CloudError>;
}
