//! File key registry repository.

use crate::error::MetadataResult;
use crate::models::{FileKeyRow, FileKeyShareRow};
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for wrapped data keys and their per-user shares.
#[async_trait]
pub trait FileKeyRepo: Send + Sync {
    /// Fails with `AlreadyExists` if the file already has a key and
    /// `NotFound` if the object does not exist.
    async fn create_file_key(&self, key: &FileKeyRow) -> MetadataResult<()>;

    async fn get_file_key(&self, file_id: Uuid) -> MetadataResult<Option<FileKeyRow>>;

    /// Replace the wrapped key material. Fails with `NotFound` if absent.
    async fn update_file_key(&self, key: &FileKeyRow) -> MetadataResult<()>;

    /// Delete the key and all of its shares in one transaction.
    async fn delete_file_key(&self, file_id: Uuid) -> MetadataResult<bool>;

    /// Insert or replace the share for `(file_id, user_id)`.
    ///
    /// Fails with `NotFound` when the file has no key.
    async fn create_file_key_share(&self, share: &FileKeyShareRow) -> MetadataResult<()>;

    async fn get_file_key_share(
        &self,
        file_id: Uuid,
        user_id: &str,
    ) -> MetadataResult<Option<FileKeyShareRow>>;

    async fn list_file_key_shares(&self, file_id: Uuid) -> MetadataResult<Vec<FileKeyShareRow>>;

    async fn delete_file_key_share(&self, file_id: Uuid, user_id: &str) -> MetadataResult<bool>;

    /// Returns the number of shares removed.
    async fn delete_all_file_key_shares(&self, file_id: Uuid) -> MetadataResult<u64>;

    /// Replace the key and the listed shares in one transaction.
    ///
    /// Shares are only updated, never inserted: one revoked after it was
    /// listed stays revoked. Returns the number of shares re-wrapped.
    async fn rewrap_file_key(
        &self,
        key: &FileKeyRow,
        shares: &[FileKeyShareRow],
    ) -> MetadataResult<u64>;
}
