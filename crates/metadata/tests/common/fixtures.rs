//! Row builders shared by metadata tests.

use murmur_core::{JobPayload, JobPriority, ObjectId};
use murmur_metadata::models::{FileKeyRow, FileKeyShareRow, JobRow, ObjectRow};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// A pending job created `age_ms` milliseconds ago.
#[allow(dead_code)]
pub fn pending_job(job_type: &str, priority: JobPriority, max_retries: u32, age_ms: i64) -> JobRow {
    let created = OffsetDateTime::now_utc() - Duration::milliseconds(age_ms);
    JobRow::pending(
        &JobPayload::new(job_type, "user-1"),
        priority,
        max_retries,
        created,
    )
    .expect("valid job row")
}

/// A pending job referencing `object_id`.
#[allow(dead_code)]
pub fn job_for_object(object_id: Uuid) -> JobRow {
    JobRow::pending(
        &JobPayload::new("transcription", "user-1").with_object(ObjectId::from_uuid(object_id)),
        JobPriority::Normal,
        3,
        OffsetDateTime::now_utc(),
    )
    .expect("valid job row")
}

#[allow(dead_code)]
pub fn object_row(bucket: &str, size: i64, encrypted: bool) -> ObjectRow {
    ObjectRow {
        object_id: Uuid::new_v4(),
        bucket: bucket.to_string(),
        user_id: "user-1".to_string(),
        name: "clip.wav".to_string(),
        content_type: Some("audio/wav".to_string()),
        size,
        content_hash: "00".repeat(32),
        hash_algorithm: "sha256".to_string(),
        encrypted,
        compression: "none".to_string(),
        metadata_json: "{}".to_string(),
        metadata_mac: None,
        created_at: OffsetDateTime::now_utc(),
    }
}

#[allow(dead_code)]
pub fn file_key_row(file_id: Uuid) -> FileKeyRow {
    let now = OffsetDateTime::now_utc();
    FileKeyRow {
        file_id,
        wrapped_key: vec![7u8; 72],
        kek_name: "master".to_string(),
        kek_version: 1,
        created_at: now,
        updated_at: now,
    }
}

#[allow(dead_code)]
pub fn share_row(file_id: Uuid, user_id: &str) -> FileKeyShareRow {
    FileKeyShareRow {
        file_id,
        user_id: user_id.to_string(),
        wrapped_key: vec![9u8; 72],
        kek_name: format!("user-{user_id}"),
        kek_version: 1,
        created_at: OffsetDateTime::now_utc(),
    }
}
