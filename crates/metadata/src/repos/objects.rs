//! Stored object repository.

use crate::error::MetadataResult;
use crate::models::{FileKeyRow, ObjectRow};
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for stored object metadata.
#[async_trait]
pub trait ObjectRepo: Send + Sync {
    /// Insert an object and, for encrypted objects, its file key.
    ///
    /// Both rows are written in one transaction: either both exist afterwards
    /// or neither does.
    async fn create_object(
        &self,
        object: &ObjectRow,
        file_key: Option<&FileKeyRow>,
    ) -> MetadataResult<()>;

    async fn get_object(&self, object_id: Uuid) -> MetadataResult<Option<ObjectRow>>;

    /// List objects newest first, optionally narrowed by bucket and owner.
    async fn list_objects(
        &self,
        bucket: Option<&str>,
        user_id: Option<&str>,
        limit: u32,
    ) -> MetadataResult<Vec<ObjectRow>>;

    /// Delete an object with its key shares, file key and jobs in one
    /// transaction. Returns false when the object did not exist.
    async fn delete_object_cascade(&self, object_id: Uuid) -> MetadataResult<bool>;

    /// Total stored bytes in a bucket.
    async fn bucket_size(&self, bucket: &str) -> MetadataResult<u64>;
}
