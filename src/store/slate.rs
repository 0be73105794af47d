use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use slatedb::{Db, DbIterator, WriteBatch};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::asg_instance::{AsgInstance, InstanceStatus};
use crate::clock::Clock;
use crate::job::{JobKey, JobMetadata};
use crate::keys::{asg_instance_key, job_metadata_key, prefix_range, ASG_INSTANCE_PREFIX};
use crate::settings::StoreConfig;
use crate::storage::resolve_object_store;
use crate::store::{
    check_instance_update, check_job_update, merge_instance_upsert, AsgInstanceStore,
    JobMetadataStore, StoreError,
};

/// Both record kinds in one SlateDB database.
///
/// SlateDB allows a single writer per path, so read-compare-write sequences
/// are serialized by `write_lock` within this process.
pub struct SlateStore {
    db: Arc<Db>,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl SlateStore {
    pub async fn open(cfg: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<Self>, StoreError> {
        let resolved = resolve_object_store(&cfg.backend, &cfg.path)?;
        let mut builder = slatedb::DbBuilder::new(resolved.db_path.as_str(), resolved.store);
        if let Some(flush_ms) = cfg.flush_interval_ms {
            let mut settings = slatedb::config::Settings::default();
            settings.flush_interval = Some(Duration::from_millis(flush_ms));
            builder = builder.with_settings(settings);
        }
        let db = builder.build().await?;
        info!(path = %resolved.db_path, backend = ?cfg.backend, "opened store");
        Ok(Arc::new(Self {
            db: Arc::new(db),
            clock,
            write_lock: Mutex::new(()),
        }))
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        self.db.close().await.map_err(StoreError::from)
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.db.get(key.as_bytes()).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(value)?;
        let mut batch = WriteBatch::new();
        batch.put(key.as_bytes(), &encoded);
        self.db.write(batch).await?;
        debug!(key, bytes = encoded.len(), "wrote record");
        Ok(())
    }
}

#[async_trait]
impl JobMetadataStore for SlateStore {
    async fn get(&self, job_key: &JobKey) -> Result<Option<JobMetadata>, StoreError> {
        self.read(&job_metadata_key(job_key.as_str())).await
    }

    async fn insert(&self, metadata: JobMetadata) -> Result<(), StoreError> {
        let key = job_metadata_key(metadata.job_key.as_str());
        let _guard = self.write_lock.lock().await;
        if self.read::<JobMetadata>(&key).await?.is_some() {
            return Err(StoreError::AlreadyExists(metadata.job_key.to_string()));
        }
        self.write(&key, &metadata).await
    }

    async fn update(&self, metadata: JobMetadata) -> Result<JobMetadata, StoreError> {
        let key = job_metadata_key(metadata.job_key.as_str());
        let _guard = self.write_lock.lock().await;
        let current: Option<JobMetadata> = self.read(&key).await?;
        let stored = check_job_update(current.as_ref(), metadata, self.clock.now_ms())?;
        self.write(&key, &stored).await?;
        Ok(stored)
    }
}

#[async_trait]
impl AsgInstanceStore for SlateStore {
    async fn get(&self, instance_name: &str) -> Result<Option<AsgInstance>, StoreError> {
        self.read(&asg_instance_key(instance_name)).await
    }

    async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<AsgInstance>, StoreError> {
        let (start, end) = prefix_range(ASG_INSTANCE_PREFIX);
        let mut iter: DbIterator = self.db.scan::<Vec<u8>, _>(start..=end).await?;
        let mut out = Vec::new();
        while let Some(kv) = iter.next().await? {
            let instance: AsgInstance = serde_json::from_slice(&kv.value)?;
            if instance.status == status {
                out.push(instance);
            }
        }
        Ok(out)
    }

    async fn upsert(&self, instance: AsgInstance) -> Result<(), StoreError> {
        let key = asg_instance_key(&instance.instance_name);
        let _guard = self.write_lock.lock().await;
        let current: Option<AsgInstance> = self.read(&key).await?;
        let merged = merge_instance_upsert(current.as_ref(), instance)?;
        self.write(&key, &merged).await
    }

    async fn update(&self, instance: AsgInstance) -> Result<AsgInstance, StoreError> {
        let key = asg_instance_key(&instance.instance_name);
        let _guard = self.write_lock.lock().await;
        let current: Option<AsgInstance> = self.read(&key).await?;
        check_instance_update(current.as_ref(), &instance)?;
        self.write(&key, &instance).await?;
        Ok(instance)
    }
}
