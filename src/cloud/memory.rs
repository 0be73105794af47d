use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cloud::{
    CloudError, ComputeInstance, DeleteOperation, InstanceGroupClient, LifecycleHookClient,
};

struct GroupState {
    instances: Vec<ComputeInstance>,
    template: String,
    recommended_size: Option<usize>,
    /// Polls each new deletion needs before it reports done; `None` never finishes.
    polls_to_finish: Option<u32>,
    pending: HashMap<String, u32>,
    delete_calls: Vec<Vec<String>>,
}

/// Managed instance group simulated in memory.
///
/// Deletions finish after a configurable number of polls, at which point the
/// instances drop out of `list_active_instances`.
pub struct SimulatedInstanceGroup {
    state: Mutex<GroupState>,
}

impl SimulatedInstanceGroup {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(GroupState {
                instances: Vec::new(),
                template: template.into(),
                recommended_size: None,
                polls_to_finish: Some(0),
                pending: HashMap::new(),
                delete_calls: Vec::new(),
            }),
        }
    }

    pub fn new_arc(template: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(template))
    }

    pub async fn add_instance(&self, instance: ComputeInstance) {
        self.state.lock().await.instances.push(instance);
    }

    /// Remove an instance as if the provider reclaimed it on its own.
    pub async fn remove_instance(&self, instance_id: &str) {
        self.state
            .lock()
            .await
            .instances
            .retain(|i| i.instance_id != instance_id);
    }

    pub async fn set_template(&self, template: impl Into<String>) {
        self.state.lock().await.template = template.into();
    }

    pub async fn set_recommended_size(&self, size: Option<usize>) {
        self.state.lock().await.recommended_size = size;
    }

    pub async fn set_polls_to_finish(&self, polls: Option<u32>) {
        self.state.lock().await.polls_to_finish = polls;
    }

    /// Instance ids passed to each `delete_instances` call, in order.
    pub async fn delete_calls(&self) -> Vec<Vec<String>> {
        self.state.lock().await.delete_calls.clone()
    }

    pub async fn instance_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .instances
            .iter()
            .map(|i| i.instance_id.clone())
            .collect()
    }
}

#[async_trait]
impl InstanceGroupClient for SimulatedInstanceGroup {
    async fn list_active_instances(&self) -> Result<Vec<ComputeInstance>, CloudError> {
        Ok(self.state.lock().await.instances.clone())
    }

    async fn delete_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<DeleteOperation, CloudError> {
        let mut state = self.state.lock().await;
        let id = Uuid::new_v4().to_string();
        state.delete_calls.push(instance_ids.to_vec());
        let polls = state.polls_to_finish.unwrap_or(u32::MAX);
        state.pending.insert(id.clone(), polls);
        Ok(DeleteOperation {
            id,
            instance_ids: instance_ids.to_vec(),
        })
    }

    async fn operation_done(&self, operation: &DeleteOperation) -> Result<bool, CloudError> {
        let mut state = self.state.lock().await;
        let remaining = state
            .pending
            .get_mut(&operation.id)
            .ok_or_else(|| CloudError::UnknownOperation(operation.id.clone()))?;
        if *remaining == u32::MAX {
            return Ok(false);
        }
        if *remaining > 0 {
            *remaining -= 1;
            return Ok(false);
        }
        state.pending.remove(&operation.id);
        state
            .instances
            .retain(|i| !operation.instance_ids.contains(&i.instance_id));
        Ok(true)
    }

    async fn autoscaler_recommended_size(&self) -> Result<Option<usize>, CloudError> {
        Ok(self.state.lock().await.recommended_size)
    }

    async fn current_template(&self) -> Result<String, CloudError> {
        Ok(self.state.lock().await.template.clone())
    }
}

/// A call made against [`RecordingLifecycleHooks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookCall {
    pub group: String,
    pub instance_id: String,
    pub hook: String,
}

#[derive(Default)]
struct HookState {
    lifecycle_states: HashMap<String, String>,
    completed: Vec<HookCall>,
    heartbeats: Vec<HookCall>,
    fail_heartbeats: bool,
}

/// Lifecycle hook client that records every call.
#[derive(Default)]
pub struct RecordingLifecycleHooks {
    state: Mutex<HookState>,
}

impl RecordingLifecycleHooks {
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set_lifecycle_state(&self, instance_id: &str, state: &str) {
        self.state
            .lock()
            .await
            .lifecycle_states
            .insert(instance_id.to_string(), state.to_string());
    }

    pub async fn set_fail_heartbeats(&self, fail: bool) {
        self.state.lock().await.fail_heartbeats = fail;
    }

    pub async fn completed(&self) -> Vec<HookCall> {
        self.state.lock().await.completed.clone()
    }

    pub async fn heartbeats(&self) -> Vec<HookCall> {
        self.state.lock().await.heartbeats.clone()
    }
}

fn hook_call(group: &str, instance_id: &str, hook: &str) -> HookCall {
    HookCall {
        group: group.to_string(),
        instance_id: instance_id.to_string(),
        hook: hook.to_string(),
    }
}

#[async_trait]
impl LifecycleHookClient for RecordingLifecycleHooks {
    async fn describe_lifecycle_state(&self, instance_id: &str) -> Result<String, CloudError> {
        self.state
            .lock()
            .await
            .lifecycle_states
            .get(instance_id)
            .cloned()
            .ok_or_else(|| CloudError::InstanceNotFound(instance_id.to_string()))
    }

    async fn complete_lifecycle_action(
        &self,
        group: &str,
        instance_id: &str,
        hook: &str,
    ) -> Result<(), CloudError> {
        let mut state = self.state.lock().await;
        state.completed.push(hook_call(group, instance_id, hook));
        state
            .lifecycle_states
            .insert(instance_id.to_string(), "Terminating:Proceed".to_string());
        Ok(())
    }

    async fn record_heartbeat(
        &self,
        group: &str,
        instance_id: &str,
        hook: &str,
    ) -> Result<(), CloudError> {
        let mut state = self.state.lock().await;
        if state.fail_heartbeats {
            return Err(CloudError::Unavailable("heartbeat rejected".to_string()));
        }
        state.heartbeats.push(hook_call(group, instance_id, hook));
        Ok(())
    }
}
