use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::asg_instance::{AsgInstance, InstanceStatus};
use crate::clock::Clock;
use crate::job::{JobKey, JobMetadata};
use crate::store::{
    check_instance_update, check_job_update, merge_instance_upsert, AsgInstanceStore,
    JobMetadataStore, StoreError,
};

#[derive(Default)]
struct JobState {
    records: HashMap<JobKey, JobMetadata>,
    /// Every accepted update, in order.
    updates: Vec<JobMetadata>,
}

/// Job metadata held in process memory.
pub struct InMemoryJobMetadataStore {
    clock: Arc<dyn Clock>,
    state: Mutex<JobState>,
}

impl InMemoryJobMetadataStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(JobState::default()),
        }
    }

    pub fn new_arc(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self::new(clock))
    }

    /// Accepted updates of `job_key`, oldest first.
    pub async fn updates_for(&self, job_key: &JobKey) -> Vec<JobMetadata> {
        self.state
            .lock()
            .await
            .updates
            .iter()
            .filter(|m| &m.job_key == job_key)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl JobMetadataStore for InMemoryJobMetadataStore {
    async fn get(&self, job_key: &JobKey) -> Result<Option<JobMetadata>, StoreError> {
        Ok(self.state.lock().await.records.get(job_key).cloned())
    }

    async fn insert(&self, metadata: JobMetadata) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.records.contains_key(&metadata.job_key) {
            return Err(StoreError::AlreadyExists(metadata.job_key.to_string()));
        }
        state.records.insert(metadata.job_key.clone(), metadata);
        Ok(())
    }

    async fn update(&self, metadata: JobMetadata) -> Result<JobMetadata, StoreError> {
        let mut state = self.state.lock().await;
        let stored = check_job_update(
            state.records.get(&metadata.job_key),
            metadata,
            self.clock.now_ms(),
        )?;
        state
            .records
            .insert(stored.job_key.clone(), stored.clone());
        state.updates.push(stored.clone());
        Ok(stored)
    }
}

#[derive(Default)]
struct InstanceState {
    records: BTreeMap<String, AsgInstance>,
    failing_upserts: HashSet<String>,
}

/// Instance termination records held in process memory.
#[derive(Default)]
pub struct InMemoryAsgInstanceStore {
    state: Mutex<InstanceState>,
}

impl InMemoryAsgInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every upsert of `instance_name` fail as if the store were down.
    pub async fn fail_upserts_for(&self, instance_name: &str) {
        self.state
            .lock()
            .await
            .failing_upserts
            .insert(instance_name.to_string());
    }

    pub async fn all(&self) -> Vec<AsgInstance> {
        self.state.lock().await.records.values().cloned().collect()
    }
}

#[async_trait]
impl AsgInstanceStore for InMemoryAsgInstanceStore {
    async fn get(&self, instance_name: &str) -> Result<Option<AsgInstance>, StoreError> {
        Ok(self.state.lock().await.records.get(instance_name).cloned())
    }

    async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<AsgInstance>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .records
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect())
    }

    async fn upsert(&self, instance: AsgInstance) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.failing_upserts.contains(&instance.instance_name) {
            return Err(StoreError::Unavailable(format!(
                "upsert of {} rejected",
                instance.instance_name
            )));
        }
        let merged = merge_instance_upsert(state.records.get(&instance.instance_name), instance)?;
        state.records.insert(merged.instance_name.clone(), merged);
        Ok(())
    }

    async fn update(&self, instance: AsgInstance) -> Result<AsgInstance, StoreError> {
        let mut state = self.state.lock().await;
        check_instance_update(state.records.get(&instance.instance_name), &instance)?;
        state
            .records
            .insert(instance.instance_name.clone(), instance.clone());
        Ok(instance)
    }
}
