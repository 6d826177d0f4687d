//! File key registry service: wrapping, sharing and re-wrapping data keys.
//!
//! The owner's copy of a data key is wrapped under the master key. A share
//! re-wraps the same data key under the recipient's key (`user-<id>`), so the
//! object itself is never re-encrypted.

use crate::error::{ServiceError, ServiceResult};
use murmur_core::ObjectId;
use murmur_keys::cipher::{self, DataKey};
use murmur_keys::{KeyManager, KeyMaterial};
use murmur_metadata::MetadataStore;
use murmur_metadata::models::{FileKeyRow, FileKeyShareRow};
use std::sync::Arc;
use time::OffsetDateTime;

/// Vault name of a user's key-encryption key.
pub fn user_kek_name(user_id: &str) -> String {
    format!("user-{user_id}")
}

/// Result of re-wrapping a file key after key rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrapOutcome {
    pub kek_version: u32,
    pub shares: usize,
}

pub struct FileKeyService {
    metadata: Arc<dyn MetadataStore>,
    keys: Arc<KeyManager>,
    master_key_name: String,
}

impl FileKeyService {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        keys: Arc<KeyManager>,
        master_key_name: impl Into<String>,
    ) -> Self {
        Self {
            metadata,
            keys,
            master_key_name: master_key_name.into(),
        }
    }

    /// Wrap a fresh data key for `file_id` under the current master key.
    ///
    /// The row is not persisted; the content store inserts it together with
    /// the object record.
    pub async fn wrap_new(&self, file_id: ObjectId, data_key: &DataKey) -> ServiceResult<FileKeyRow> {
        let kek = self.keys.get_or_create_key(&self.master_key_name).await?;
        let wrapped = cipher::wrap_key(
            kek.as_bytes(),
            data_key,
            &cipher::file_key_context(file_id),
        )?;
        let now = OffsetDateTime::now_utc();
        Ok(FileKeyRow {
            file_id: *file_id.as_uuid(),
            wrapped_key: wrapped,
            kek_name: kek.name().to_string(),
            kek_version: i64::from(kek.version()),
            created_at: now,
            updated_at: now,
        })
    }

    /// Recover the data key of `file_id`, through the owner's copy or the
    /// share held by `user_id`.
    pub async fn unwrap_for(&self, file_id: ObjectId, user_id: Option<&str>) -> ServiceResult<DataKey> {
        match user_id {
            None => {
                let row = self.file_key(file_id).await?;
                let kek = self.kek_at(&row.kek_name, row.kek_version).await?;
                Ok(cipher::unwrap_key(
                    kek.as_bytes(),
                    &row.wrapped_key,
                    &cipher::file_key_context(file_id),
                )?)
            }
            Some(user_id) => {
                let share = self
                    .metadata
                    .get_file_key_share(*file_id.as_uuid(), user_id)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::Authorization(format!("{user_id} has no share of {file_id}"))
                    })?;
                let kek = self.kek_at(&share.kek_name, share.kek_version).await?;
                Ok(cipher::unwrap_key(
                    kek.as_bytes(),
                    &share.wrapped_key,
                    &cipher::share_key_context(file_id, user_id),
                )?)
            }
        }
    }

    /// Grant `user_id` access to `file_id`. Re-sharing replaces the previous
    /// share.
    pub async fn share(&self, file_id: ObjectId, user_id: &str) -> ServiceResult<FileKeyShareRow> {
        if user_id.is_empty() {
            return Err(ServiceError::Validation("user id must not be empty".to_string()));
        }
        let data_key = self.unwrap_for(file_id, None).await?;
        let kek = self.keys.get_or_create_key(&user_kek_name(user_id)).await?;
        let share = self.seal_share(file_id, user_id, &data_key, &kek)?;
        self.metadata.create_file_key_share(&share).await?;
        tracing::info!(file_id = %file_id, user_id, "file key shared");
        Ok(share)
    }

    /// Revoke `user_id`'s share. Returns whether a share existed.
    pub async fn revoke(&self, file_id: ObjectId, user_id: &str) -> ServiceResult<bool> {
        let removed = self
            .metadata
            .delete_file_key_share(*file_id.as_uuid(), user_id)
            .await?;
        if removed {
            tracing::info!(file_id = %file_id, user_id, "file key share revoked");
        }
        Ok(removed)
    }

    pub async fn list_shares(&self, file_id: ObjectId) -> ServiceResult<Vec<FileKeyShareRow>> {
        Ok(self.metadata.list_file_key_shares(*file_id.as_uuid()).await?)
    }

    /// Drop every share of `file_id`, keeping the owner's key.
    pub async fn revoke_all(&self, file_id: ObjectId) -> ServiceResult<u64> {
        Ok(self
            .metadata
            .delete_all_file_key_shares(*file_id.as_uuid())
            .await?)
    }

    pub async fn get(&self, file_id: ObjectId) -> ServiceResult<Option<FileKeyRow>> {
        Ok(self.metadata.get_file_key(*file_id.as_uuid()).await?)
    }

    /// Re-wrap the data key of `file_id` and all of its shares under the
    /// current versions of their key-encryption keys.
    ///
    /// Run after rotating the master key or a user key. The key row and the
    /// shares are replaced in one transaction; a share revoked while this runs
    /// is not brought back.
    pub async fn rewrap(&self, file_id: ObjectId) -> ServiceResult<RewrapOutcome> {
        let row = self.file_key(file_id).await?;
        let data_key = self.unwrap_for(file_id, None).await?;

        let kek = self.keys.get_key(&self.master_key_name).await?;
        let now = OffsetDateTime::now_utc();
        let key_row = FileKeyRow {
            file_id: row.file_id,
            wrapped_key: cipher::wrap_key(
                kek.as_bytes(),
                &data_key,
                &cipher::file_key_context(file_id),
            )?,
            kek_name: kek.name().to_string(),
            kek_version: i64::from(kek.version()),
            created_at: row.created_at,
            updated_at: now,
        };

        let mut shares = Vec::new();
        for share in self.metadata.list_file_key_shares(row.file_id).await? {
            let user_kek = self.keys.get_key(&share.kek_name).await?;
            let mut resealed = self.seal_share(file_id, &share.user_id, &data_key, &user_kek)?;
            resealed.created_at = share.created_at;
            shares.push(resealed);
        }

        let resealed = self.metadata.rewrap_file_key(&key_row, &shares).await?;
        if resealed < shares.len() as u64 {
            tracing::debug!(
                file_id = %file_id,
                skipped = shares.len() as u64 - resealed,
                "shares revoked during re-wrap"
            );
        }
        tracing::info!(
            file_id = %file_id,
            kek_version = kek.version(),
            shares = resealed,
            "file key re-wrapped"
        );
        Ok(RewrapOutcome {
            kek_version: kek.version(),
            shares: usize::try_from(resealed).unwrap_or(shares.len()),
        })
    }

    fn seal_share(
        &self,
        file_id: ObjectId,
        user_id: &str,
        data_key: &DataKey,
        kek: &KeyMaterial,
    ) -> ServiceResult<FileKeyShareRow> {
        let wrapped = cipher::wrap_key(
            kek.as_bytes(),
            data_key,
            &cipher::share_key_context(file_id, user_id),
        )?;
        Ok(FileKeyShareRow {
            file_id: *file_id.as_uuid(),
            user_id: user_id.to_string(),
            wrapped_key: wrapped,
            kek_name: kek.name().to_string(),
            kek_version: i64::from(kek.version()),
            created_at: OffsetDateTime::now_utc(),
        })
    }

    async fn file_key(&self, file_id: ObjectId) -> ServiceResult<FileKeyRow> {
        self.metadata
            .get_file_key(*file_id.as_uuid())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("file key for {file_id}")))
    }

    async fn kek_at(&self, name: &str, version: i64) -> ServiceResult<KeyMaterial> {
        let version = u32::try_from(version).map_err(|_| {
            ServiceError::KeyManagement(murmur_keys::KeyError::InvalidKey(format!(
                "stored key version {version} for {name} is out of range"
            )))
        })?;
        Ok(self.keys.get_key_version(name, version).await?)
    }
}
