//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use murmur_core::{
    Bucket, Compression, ContentHash, HashAlgorithm, Job, JobId, JobPayload, JobPriority,
    JobStatus, ObjectId, ObjectInfo,
};
use sqlx::FromRow;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Jobs
// =============================================================================

/// Job ledger record.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub job_id: Uuid,
    pub job_type: String,
    pub user_id: String,
    pub object_id: Option<Uuid>,
    pub parameters_json: Option<String>,
    pub status: String,
    pub priority: i32,
    pub progress: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub owner_lease_id: Option<String>,
    pub lease_expires_at: Option<OffsetDateTime>,
    pub started_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
}

impl JobRow {
    /// Build a fresh pending row.
    pub fn pending(
        payload: &JobPayload,
        priority: JobPriority,
        max_retries: u32,
        now: OffsetDateTime,
    ) -> MetadataResult<Self> {
        let parameters_json = payload
            .parameters
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| MetadataError::Internal(format!("encode job parameters: {e}")))?;
        Ok(Self {
            job_id: *JobId::new().as_uuid(),
            job_type: payload.job_type.clone(),
            user_id: payload.user_id.clone(),
            object_id: payload.object_id.map(|id| *id.as_uuid()),
            parameters_json,
            status: JobStatus::Pending.as_str().to_string(),
            priority: priority.as_i32(),
            progress: 0,
            retry_count: 0,
            max_retries: to_i32(max_retries, "max_retries")?,
            owner_lease_id: None,
            lease_expires_at: None,
            started_at: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error_message: None,
        })
    }

    pub fn status(&self) -> MetadataResult<JobStatus> {
        Ok(self.status.parse()?)
    }
}

impl TryFrom<JobRow> for Job {
    type Error = MetadataError;

    fn try_from(row: JobRow) -> MetadataResult<Self> {
        let parameters = row
            .parameters_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| MetadataError::Internal(format!("decode job parameters: {e}")))?;
        Ok(Job {
            id: JobId::from_uuid(row.job_id),
            payload: JobPayload {
                job_type: row.job_type,
                user_id: row.user_id,
                object_id: row.object_id.map(ObjectId::from_uuid),
                parameters,
            },
            status: row.status.parse()?,
            priority: JobPriority::from_i32(row.priority)?,
            progress: row.progress.clamp(0, 100) as u8,
            retry_count: from_i32(row.retry_count, "retry_count")?,
            max_retries: from_i32(row.max_retries, "max_retries")?,
            owner_lease_id: row.owner_lease_id,
            lease_expires_at: row.lease_expires_at,
            started_at: row.started_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
        })
    }
}

// =============================================================================
// Stored objects
// =============================================================================

/// Stored object record.
#[derive(Debug, Clone, FromRow)]
pub struct ObjectRow {
    pub object_id: Uuid,
    pub bucket: String,
    pub user_id: String,
    pub name: String,
    pub content_type: Option<String>,
    /// Stored byte count (ciphertext and/or compressed size).
    pub size: i64,
    /// Hex digest of the stored bytes.
    pub content_hash: String,
    pub hash_algorithm: String,
    pub encrypted: bool,
    pub compression: String,
    /// Free-form metadata map as a JSON object.
    pub metadata_json: String,
    /// Versioned HMAC tag over the integrity-relevant columns, `v<N>:<base64>`.
    pub metadata_mac: Option<String>,
    pub created_at: OffsetDateTime,
}

impl ObjectRow {
    pub fn from_info(info: &ObjectInfo, metadata_mac: Option<String>) -> MetadataResult<Self> {
        let metadata_json = serde_json::to_string(&info.metadata)
            .map_err(|e| MetadataError::Internal(format!("encode object metadata: {e}")))?;
        Ok(Self {
            object_id: *info.object_id.as_uuid(),
            bucket: info.bucket.as_str().to_string(),
            user_id: info.user_id.clone(),
            name: info.name.clone(),
            content_type: info.content_type.clone(),
            size: i64::try_from(info.size)
                .map_err(|_| MetadataError::Internal(format!("object size {} too large", info.size)))?,
            content_hash: info.content_hash.to_hex(),
            hash_algorithm: info.hash_algorithm.as_str().to_string(),
            encrypted: info.encrypted,
            compression: info.compression.as_str().to_string(),
            metadata_json,
            metadata_mac,
            created_at: info.created_at,
        })
    }
}

impl TryFrom<&ObjectRow> for ObjectInfo {
    type Error = MetadataError;

    fn try_from(row: &ObjectRow) -> MetadataResult<Self> {
        let metadata: BTreeMap<String, String> = serde_json::from_str(&row.metadata_json)
            .map_err(|e| MetadataError::Internal(format!("decode object metadata: {e}")))?;
        let hash_algorithm: HashAlgorithm = row.hash_algorithm.parse()?;
        Ok(ObjectInfo {
            object_id: ObjectId::from_uuid(row.object_id),
            bucket: Bucket::new(row.bucket.clone())?,
            user_id: row.user_id.clone(),
            name: row.name.clone(),
            content_type: row.content_type.clone(),
            size: u64::try_from(row.size)
                .map_err(|_| MetadataError::Internal(format!("negative object size {}", row.size)))?,
            content_hash: ContentHash::from_hex(&row.content_hash)?,
            hash_algorithm,
            encrypted: row.encrypted,
            compression: row.compression.parse::<Compression>()?,
            created_at: row.created_at,
            metadata,
        })
    }
}

// =============================================================================
// File keys
// =============================================================================

/// Wrapped data key for one encrypted object.
#[derive(Debug, Clone, FromRow)]
pub struct FileKeyRow {
    pub file_id: Uuid,
    pub wrapped_key: Vec<u8>,
    /// Vault key name of the key-encryption key.
    pub kek_name: String,
    pub kek_version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Data key re-wrapped for another user.
#[derive(Debug, Clone, FromRow)]
pub struct FileKeyShareRow {
    pub file_id: Uuid,
    pub user_id: String,
    pub wrapped_key: Vec<u8>,
    pub kek_name: String,
    pub kek_version: i64,
    pub created_at: OffsetDateTime,
}

fn to_i32(value: u32, field: &str) -> MetadataResult<i32> {
    i32::try_from(value).map_err(|_| MetadataError::Internal(format!("{field} {value} out of range")))
}

fn from_i32(value: i32, field: &str) -> MetadataResult<u32> {
    u32::try_from(value).map_err(|_| MetadataError::Internal(format!("{field} {value} out of range")))
}
