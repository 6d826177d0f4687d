//! Process-wide dependencies, built once at startup and passed by reference.

use crate::content::ContentStore;
use crate::file_keys::FileKeyService;
use crate::ledger::JobLedger;
use crate::reaper::Reaper;
use crate::worker::{JobHandler, WorkerPool};
use anyhow::{Context, Result};
use murmur_core::config::AppConfig;
use murmur_keys::KeyManager;
use murmur_metadata::MetadataStore;
use murmur_storage::ObjectStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn ObjectStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub keys: Arc<KeyManager>,
    pub file_keys: Arc<FileKeyService>,
    pub content: Arc<ContentStore>,
    pub ledger: Arc<JobLedger>,
}

impl AppContext {
    /// Wire the services on top of already constructed backends.
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        keys: Arc<KeyManager>,
    ) -> Self {
        let file_keys = Arc::new(FileKeyService::new(
            metadata.clone(),
            keys.clone(),
            config.keys.master_key_name.clone(),
        ));
        let content = Arc::new(ContentStore::new(
            storage.clone(),
            metadata.clone(),
            keys.clone(),
            file_keys.clone(),
            config.content.clone(),
            config.keys.integrity_key_name.clone(),
        ));
        let ledger = Arc::new(JobLedger::new(metadata.clone(), config.jobs.clone()));
        Self {
            config: Arc::new(config),
            storage,
            metadata,
            keys,
            file_keys,
            content,
            ledger,
        }
    }

    /// Validate `config`, open every backend and check that each is reachable.
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        config
            .validate()
            .map_err(anyhow::Error::msg)
            .context("invalid configuration")?;

        let storage = murmur_storage::from_config(&config.storage)
            .await
            .context("failed to initialize storage")?;
        storage
            .health_check()
            .await
            .context("storage health check failed")?;
        tracing::info!(backend = storage.backend_name(), "storage backend ready");

        let metadata = murmur_metadata::from_config(&config.metadata)
            .await
            .context("failed to initialize metadata store")?;
        metadata
            .health_check()
            .await
            .context("metadata health check failed")?;
        tracing::info!("metadata store ready");

        let keys = KeyManager::from_config(&config.keys).context("failed to initialize key vault")?;
        keys.health_check()
            .await
            .context("key vault health check failed")?;
        tracing::info!(backend = keys.backend_name(), "key vault ready");

        Ok(Self::new(config, storage, metadata, Arc::new(keys)))
    }

    pub fn reaper(&self) -> Reaper {
        Reaper::new(
            self.ledger.clone(),
            self.config.jobs.reaper_interval(),
            self.config.jobs.max_lease_minutes,
        )
    }

    pub fn worker_pool(&self, handler: Arc<dyn JobHandler>) -> WorkerPool {
        WorkerPool::new(
            self.ledger.clone(),
            self.content.clone(),
            handler,
            self.config.worker.clone(),
            self.config.jobs.lease_duration(),
        )
    }
}
