use std::sync::Arc;

use tracing::info;

use crate::clock::Clock;
use crate::settings::StoreConfig;
use crate::store::{AsgInstanceStore, JobMetadataStore, SlateStore, StoreError};

/// The durable stores a process works against, opened from configuration.
pub struct Stores {
    pub metadata: Arc<dyn JobMetadataStore>,
    pub instances: Arc<dyn AsgInstanceStore>,
    slate: Arc<SlateStore>,
}

impl Stores {
    /// Open one SlateDB database holding both job metadata and instance records.
    pub async fn open(cfg: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let slate = SlateStore::open(cfg, clock).await?;
        let metadata: Arc<dyn JobMetadataStore> = slate.clone();
        let instances: Arc<dyn AsgInstanceStore> = slate.clone();
        Ok(Self {
            metadata,
            instances,
            slate,
        })
    }

    /// Flush and close the database.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.slate.close().await?;
        info!("stores closed");
        Ok(())
    }
}
