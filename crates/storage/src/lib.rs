//! Blob storage abstraction and backends for murmur.
//!
//! This crate provides:
//! - The [`ObjectStore`] trait with streaming, all-or-nothing uploads
//! - Per-object attributes (content type, string metadata) stored beside the bytes
//! - Backends: local filesystem and S3-compatible

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{
    filesystem::FilesystemBackend,
    s3::{S3Backend, S3Settings},
};
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, ObjectAttributes, ObjectMeta, ObjectStore, StreamingUpload};

use murmur_core::config::StorageConfig;
use std::sync::Arc;
use std::time::Duration;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => Ok(Arc::new(FilesystemBackend::new(path).await?)),
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            prefix,
            access_key_id,
            secret_access_key,
            force_path_style,
            request_timeout_secs,
        } => {
            let backend = S3Backend::new(S3Settings {
                bucket: bucket.clone(),
                endpoint: endpoint.clone(),
                region: region.clone(),
                prefix: prefix.clone(),
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                force_path_style: *force_path_style,
                request_timeout: Some(Duration::from_secs(*request_timeout_secs)),
            })
            .await?;
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    #[tokio::test]
    async fn from_config_filesystem_ok() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            path: temp.path().join("blobs"),
        };

        let store = from_config(&config).await.unwrap();
        store
            .put("audio/hello", Bytes::from_static(b"hi"), ObjectAttributes::default())
            .await
            .unwrap();
        assert!(store.exists("audio/hello").await.unwrap());
        assert_eq!(store.backend_name(), "filesystem");
        store.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn from_config_rejects_partial_credentials() {
        let config = StorageConfig::S3 {
            bucket: "media".to_string(),
            endpoint: None,
            region: None,
            prefix: None,
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
            force_path_style: false,
            request_timeout_secs: 30,
        };

        match from_config(&config).await {
            Ok(_) => panic!("expected error"),
            Err(StorageError::Config(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
