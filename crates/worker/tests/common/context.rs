//! A fully wired service context on temporary storage.

#![allow(dead_code)]

use murmur_core::config::AppConfig;
use murmur_keys::KeyManager;
use murmur_keys::vault::MemoryVault;
use murmur_metadata::SqliteStore;
use murmur_storage::{FilesystemBackend, ObjectStore};
use murmur_worker::AppContext;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestContext {
    pub app: AppContext,
    pub sqlite: Arc<SqliteStore>,
    /// Backend underneath any wrapper passed to [`TestContext::build`].
    pub blobs: Arc<dyn ObjectStore>,
    _temp_dir: TempDir,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::build(|_| {}, |store| store).await
    }

    pub async fn with_config(configure: impl FnOnce(&mut AppConfig)) -> Self {
        Self::build(configure, |store| store).await
    }

    pub async fn with_storage(
        wrap: impl FnOnce(Arc<dyn ObjectStore>) -> Arc<dyn ObjectStore>,
    ) -> Self {
        Self::build(|_| {}, wrap).await
    }

    pub async fn build(
        configure: impl FnOnce(&mut AppConfig),
        wrap: impl FnOnce(Arc<dyn ObjectStore>) -> Arc<dyn ObjectStore>,
    ) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let mut config = AppConfig::for_testing(temp_dir.path());
        configure(&mut config);

        let blobs: Arc<dyn ObjectStore> = Arc::new(
            FilesystemBackend::new(temp_dir.path().join("blobs"))
                .await
                .expect("filesystem backend"),
        );
        let sqlite = Arc::new(
            SqliteStore::new(temp_dir.path().join("murmur.db"), Duration::from_secs(5))
                .await
                .expect("sqlite store"),
        );
        let keys = Arc::new(KeyManager::new(
            Arc::new(MemoryVault::new()),
            Duration::from_secs(60),
            3,
            Duration::from_millis(5),
        ));
        let app = AppContext::new(config, wrap(blobs.clone()), sqlite.clone(), keys);

        Self {
            app,
            sqlite,
            blobs,
            _temp_dir: temp_dir,
        }
    }

    /// Raw pool access for tampering with rows.
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.sqlite.pool()
    }
}
