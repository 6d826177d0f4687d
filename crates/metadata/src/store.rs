//! Metadata store trait and the SQLite implementation.

use crate::error::MetadataResult;
use crate::repos::{FileKeyRepo, JobRepo, ObjectRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: JobRepo + ObjectRepo + FileKeyRepo + Send + Sync {
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn new(path: impl AsRef<Path>, busy_timeout: Duration) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            // SQLite serializes writers anyway; one connection keeps claims
            // and releases strictly ordered.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        tracing::debug!(path = %path.display(), "opened sqlite metadata store");

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// Timestamps are stored as RFC 3339 text whose fractional part varies in
// length, so every comparison goes through julianday().
mod sqlite_impl {
    use super::*;
    use crate::error::{MetadataError, map_constraint};
    use crate::models::*;
    use crate::repos::{JobFilter, JobUpdate};
    use time::OffsetDateTime;
    use uuid::Uuid;

    const STALE_CONDITION: &str = "status = 'processing' \
         AND (lease_expires_at IS NULL \
              OR julianday(lease_expires_at) <= julianday(?) \
              OR (started_at IS NOT NULL AND julianday(started_at) <= julianday(?)))";

    #[async_trait]
    impl JobRepo for SqliteStore {
        async fn create_job(&self, job: &JobRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO jobs (
                    job_id, job_type, user_id, object_id, parameters_json, status,
                    priority, progress, retry_count, max_retries, owner_lease_id,
                    lease_expires_at, started_at, created_at, updated_at,
                    completed_at, error_message
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(job.job_id)
            .bind(&job.job_type)
            .bind(&job.user_id)
            .bind(job.object_id)
            .bind(&job.parameters_json)
            .bind(&job.status)
            .bind(job.priority)
            .bind(job.progress)
            .bind(job.retry_count)
            .bind(job.max_retries)
            .bind(&job.owner_lease_id)
            .bind(job.lease_expires_at)
            .bind(job.started_at)
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(job.completed_at)
            .bind(&job.error_message)
            .execute(&self.pool)
            .await
            .map_err(|e| map_constraint(e, || format!("job {}", job.job_id)))?;
            Ok(())
        }

        async fn get_job(&self, job_id: Uuid) -> MetadataResult<Option<JobRow>> {
            let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE job_id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn claim_job(
            &self,
            owner: &str,
            now: OffsetDateTime,
            lease_expires_at: OffsetDateTime,
            job_types: &[String],
        ) -> MetadataResult<Option<JobRow>> {
            let type_filter = if job_types.is_empty() {
                None
            } else {
                Some(
                    serde_json::to_string(job_types)
                        .map_err(|e| MetadataError::Internal(format!("encode job types: {e}")))?,
                )
            };

            // The selecting sub-query and the status guard run inside one
            // statement; a row claimed by someone else no longer matches.
            let row = sqlx::query_as::<_, JobRow>(
                r#"
                UPDATE jobs
                SET status = 'processing',
                    owner_lease_id = ?,
                    lease_expires_at = ?,
                    started_at = ?,
                    updated_at = ?
                WHERE job_id = (
                    SELECT job_id FROM jobs
                    WHERE status = 'pending'
                      AND (? IS NULL OR job_type IN (SELECT value FROM json_each(?)))
                    ORDER BY priority DESC, julianday(created_at) ASC, rowid ASC
                    LIMIT 1
                )
                AND status = 'pending'
                RETURNING *
                "#,
            )
            .bind(owner)
            .bind(lease_expires_at)
            .bind(now)
            .bind(now)
            .bind(&type_filter)
            .bind(&type_filter)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_stale_jobs(
            &self,
            now: OffsetDateTime,
            started_before: OffsetDateTime,
            after: Option<(OffsetDateTime, Uuid)>,
            limit: u32,
        ) -> MetadataResult<Vec<JobRow>> {
            let keyset = if after.is_some() {
                "AND (julianday(updated_at) > julianday(?) \
                 OR (julianday(updated_at) = julianday(?) AND job_id > ?))"
            } else {
                ""
            };
            let sql = format!(
                "SELECT * FROM jobs WHERE {STALE_CONDITION} {keyset} \
                 ORDER BY julianday(updated_at) ASC, job_id ASC LIMIT ?"
            );
            let mut query = sqlx::query_as::<_, JobRow>(&sql).bind(now).bind(started_before);
            if let Some((updated_at, job_id)) = after {
                query = query.bind(updated_at).bind(updated_at).bind(job_id);
            }
            let rows = query.bind(limit as i64).fetch_all(&self.pool).await?;
            Ok(rows)
        }

        async fn release_stale_job(
            &self,
            job_id: Uuid,
            now: OffsetDateTime,
            started_before: OffsetDateTime,
            error_message: &str,
        ) -> MetadataResult<Option<JobRow>> {
            // Every CASE reads the pre-update retry_count.
            let sql = format!(
                r#"
                UPDATE jobs
                SET status = CASE WHEN retry_count < max_retries THEN 'pending' ELSE 'failed' END,
                    retry_count = CASE WHEN retry_count < max_retries THEN retry_count + 1 ELSE retry_count END,
                    error_message = CASE WHEN retry_count < max_retries THEN error_message ELSE ? END,
                    completed_at = CASE WHEN retry_count < max_retries THEN NULL ELSE ? END,
                    owner_lease_id = NULL,
                    lease_expires_at = NULL,
                    started_at = NULL,
                    updated_at = ?
                WHERE job_id = ? AND {STALE_CONDITION}
                RETURNING *
                "#
            );
            let row = sqlx::query_as::<_, JobRow>(&sql)
                .bind(error_message)
                .bind(now)
                .bind(now)
                .bind(job_id)
                .bind(now)
                .bind(started_before)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn update_job(
            &self,
            job_id: Uuid,
            expected_status: &str,
            expected_owner: Option<&str>,
            update: &JobUpdate,
        ) -> MetadataResult<Option<JobRow>> {
            let requeue = update.status == "pending";
            let row = sqlx::query_as::<_, JobRow>(
                r#"
                UPDATE jobs
                SET status = ?,
                    progress = CASE WHEN ? IS NULL THEN progress ELSE MAX(progress, ?) END,
                    error_message = COALESCE(?, error_message),
                    retry_count = retry_count + ?,
                    owner_lease_id = CASE WHEN ? THEN NULL ELSE owner_lease_id END,
                    lease_expires_at = CASE WHEN ? THEN NULL ELSE lease_expires_at END,
                    started_at = CASE WHEN ? THEN NULL ELSE started_at END,
                    completed_at = ?,
                    updated_at = ?
                WHERE job_id = ?
                  AND status = ?
                  AND (? IS NULL OR owner_lease_id = ?)
                RETURNING *
                "#,
            )
            .bind(&update.status)
            .bind(update.progress)
            .bind(update.progress)
            .bind(&update.error_message)
            .bind(i32::from(update.increment_retry))
            .bind(update.clear_lease)
            .bind(update.clear_lease)
            .bind(requeue)
            .bind(update.completed_at)
            .bind(update.updated_at)
            .bind(job_id)
            .bind(expected_status)
            .bind(expected_owner)
            .bind(expected_owner)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_jobs(
            &self,
            filter: &JobFilter,
            cursor: Option<(OffsetDateTime, Uuid)>,
            limit: u32,
        ) -> MetadataResult<Vec<JobRow>> {
            let (cursor_at, cursor_id) = cursor.unzip();
            let rows = sqlx::query_as::<_, JobRow>(
                r#"
                SELECT * FROM jobs
                WHERE (? IS NULL OR status = ?)
                  AND (? IS NULL OR owner_lease_id = ?)
                  AND (? IS NULL OR priority = ?)
                  AND (? IS NULL OR job_type = ?)
                  AND (? IS NULL OR user_id = ?)
                  AND (? IS NULL
                       OR julianday(created_at) < julianday(?)
                       OR (julianday(created_at) = julianday(?) AND job_id < ?))
                ORDER BY julianday(created_at) DESC, job_id DESC
                LIMIT ?
                "#,
            )
            .bind(&filter.status)
            .bind(&filter.status)
            .bind(&filter.owner_lease_id)
            .bind(&filter.owner_lease_id)
            .bind(filter.priority)
            .bind(filter.priority)
            .bind(&filter.job_type)
            .bind(&filter.job_type)
            .bind(&filter.user_id)
            .bind(&filter.user_id)
            .bind(cursor_at)
            .bind(cursor_at)
            .bind(cursor_at)
            .bind(cursor_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl ObjectRepo for SqliteStore {
        async fn create_object(
            &self,
            object: &ObjectRow,
            file_key: Option<&FileKeyRow>,
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                r#"
                INSERT INTO objects (
                    object_id, bucket, user_id, name, content_type, size, content_hash,
                    hash_algorithm, encrypted, compression, metadata_json, metadata_mac,
                    created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(object.object_id)
            .bind(&object.bucket)
            .bind(&object.user_id)
            .bind(&object.name)
            .bind(&object.content_type)
            .bind(object.size)
            .bind(&object.content_hash)
            .bind(&object.hash_algorithm)
            .bind(object.encrypted)
            .bind(&object.compression)
            .bind(&object.metadata_json)
            .bind(&object.metadata_mac)
            .bind(object.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_constraint(e, || format!("object {}", object.object_id)))?;

            if let Some(key) = file_key {
                insert_file_key(&mut tx, key).await?;
            }

            tx.commit().await?;
            Ok(())
        }

        async fn get_object(&self, object_id: Uuid) -> MetadataResult<Option<ObjectRow>> {
            let row = sqlx::query_as::<_, ObjectRow>("SELECT * FROM objects WHERE object_id = ?")
                .bind(object_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn list_objects(
            &self,
            bucket: Option<&str>,
            user_id: Option<&str>,
            limit: u32,
        ) -> MetadataResult<Vec<ObjectRow>> {
            let rows = sqlx::query_as::<_, ObjectRow>(
                r#"
                SELECT * FROM objects
                WHERE (? IS NULL OR bucket = ?)
                  AND (? IS NULL OR user_id = ?)
                ORDER BY julianday(created_at) DESC, object_id DESC
                LIMIT ?
                "#,
            )
            .bind(bucket)
            .bind(bucket)
            .bind(user_id)
            .bind(user_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_object_cascade(&self, object_id: Uuid) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;

            sqlx::query("DELETE FROM file_key_shares WHERE file_id = ?")
                .bind(object_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM file_keys WHERE file_id = ?")
                .bind(object_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM jobs WHERE object_id = ?")
                .bind(object_id)
                .execute(&mut *tx)
                .await?;
            let result = sqlx::query("DELETE FROM objects WHERE object_id = ?")
                .bind(object_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(result.rows_affected() > 0)
        }

        async fn bucket_size(&self, bucket: &str) -> MetadataResult<u64> {
            let total: i64 =
                sqlx::query_scalar("SELECT COALESCE(SUM(size), 0) FROM objects WHERE bucket = ?")
                    .bind(bucket)
                    .fetch_one(&self.pool)
                    .await?;
            Ok(total.max(0) as u64)
        }
    }

    async fn insert_file_key(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        key: &FileKeyRow,
    ) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO file_keys (file_id, wrapped_key, kek_name, kek_version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(key.file_id)
        .bind(&key.wrapped_key)
        .bind(&key.kek_name)
        .bind(key.kek_version)
        .bind(key.created_at)
        .bind(key.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_constraint(e, || format!("file key {}", key.file_id)))?;
        Ok(())
    }

    /// Replace the wrap of an existing share. A share revoked in the meantime
    /// stays revoked.
    async fn reseal_share(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        share: &FileKeyShareRow,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            "UPDATE file_key_shares SET wrapped_key = ?, kek_name = ?, kek_version = ? \
             WHERE file_id = ? AND user_id = ?",
        )
        .bind(&share.wrapped_key)
        .bind(&share.kek_name)
        .bind(share.kek_version)
        .bind(share.file_id)
        .bind(&share.user_id)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_share(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        share: &FileKeyShareRow,
    ) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO file_key_shares (file_id, user_id, wrapped_key, kek_name, kek_version, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_id, user_id) DO UPDATE SET
                wrapped_key = excluded.wrapped_key,
                kek_name = excluded.kek_name,
                kek_version = excluded.kek_version
            "#,
        )
        .bind(share.file_id)
        .bind(&share.user_id)
        .bind(&share.wrapped_key)
        .bind(&share.kek_name)
        .bind(share.kek_version)
        .bind(share.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_constraint(e, || format!("file key for {}", share.file_id)))?;
        Ok(())
    }

    #[async_trait]
    impl FileKeyRepo for SqliteStore {
        async fn create_file_key(&self, key: &FileKeyRow) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            insert_file_key(&mut tx, key).await?;
            tx.commit().await?;
            Ok(())
        }

        async fn get_file_key(&self, file_id: Uuid) -> MetadataResult<Option<FileKeyRow>> {
            let row = sqlx::query_as::<_, FileKeyRow>("SELECT * FROM file_keys WHERE file_id = ?")
                .bind(file_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn update_file_key(&self, key: &FileKeyRow) -> MetadataResult<()> {
            let result = sqlx::query(
                "UPDATE file_keys SET wrapped_key = ?, kek_name = ?, kek_version = ?, updated_at = ? WHERE file_id = ?",
            )
            .bind(&key.wrapped_key)
            .bind(&key.kek_name)
            .bind(key.kek_version)
            .bind(key.updated_at)
            .bind(key.file_id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("file key {}", key.file_id)));
            }
            Ok(())
        }

        async fn delete_file_key(&self, file_id: Uuid) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM file_key_shares WHERE file_id = ?")
                .bind(file_id)
                .execute(&mut *tx)
                .await?;
            let result = sqlx::query("DELETE FROM file_keys WHERE file_id = ?")
                .bind(file_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(result.rows_affected() > 0)
        }

        async fn create_file_key_share(&self, share: &FileKeyShareRow) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            upsert_share(&mut tx, share).await?;
            tx.commit().await?;
            Ok(())
        }

        async fn get_file_key_share(
            &self,
            file_id: Uuid,
            user_id: &str,
        ) -> MetadataResult<Option<FileKeyShareRow>> {
            let row = sqlx::query_as::<_, FileKeyShareRow>(
                "SELECT * FROM file_key_shares WHERE file_id = ? AND user_id = ?",
            )
            .bind(file_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_file_key_shares(&self, file_id: Uuid) -> MetadataResult<Vec<FileKeyShareRow>> {
            let rows = sqlx::query_as::<_, FileKeyShareRow>(
                "SELECT * FROM file_key_shares WHERE file_id = ? ORDER BY user_id",
            )
            .bind(file_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn delete_file_key_share(&self, file_id: Uuid, user_id: &str) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM file_key_shares WHERE file_id = ? AND user_id = ?")
                .bind(file_id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn delete_all_file_key_shares(&self, file_id: Uuid) -> MetadataResult<u64> {
            let result = sqlx::query("DELETE FROM file_key_shares WHERE file_id = ?")
                .bind(file_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        }

        async fn rewrap_file_key(
            &self,
            key: &FileKeyRow,
            shares: &[FileKeyShareRow],
        ) -> MetadataResult<u64> {
            let mut tx = self.pool.begin().await?;
            let result = sqlx::query(
                "UPDATE file_keys SET wrapped_key = ?, kek_name = ?, kek_version = ?, updated_at = ? WHERE file_id = ?",
            )
            .bind(&key.wrapped_key)
            .bind(&key.kek_name)
            .bind(key.kek_version)
            .bind(key.updated_at)
            .bind(key.file_id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("file key {}", key.file_id)));
            }
            let mut resealed = 0;
            for share in shares {
                if reseal_share(&mut tx, share).await? {
                    resealed += 1;
                }
            }
            tx.commit().await?;
            Ok(resealed)
        }
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS objects (
    object_id BLOB PRIMARY KEY,
    bucket TEXT NOT NULL,
    user_id TEXT NOT NULL,
    name TEXT NOT NULL,
    content_type TEXT,
    size INTEGER NOT NULL CHECK (size >= 0),
    content_hash TEXT NOT NULL,
    hash_algorithm TEXT NOT NULL,
    encrypted INTEGER NOT NULL,
    compression TEXT NOT NULL DEFAULT 'none',
    metadata_json TEXT NOT NULL DEFAULT '{}',
    metadata_mac TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_objects_bucket ON objects(bucket);
CREATE INDEX IF NOT EXISTS idx_objects_user ON objects(user_id);

CREATE TABLE IF NOT EXISTS file_keys (
    file_id BLOB PRIMARY KEY REFERENCES objects(object_id) ON DELETE CASCADE,
    wrapped_key BLOB NOT NULL,
    kek_name TEXT NOT NULL,
    kek_version INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS file_key_shares (
    file_id BLOB NOT NULL REFERENCES file_keys(file_id) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    wrapped_key BLOB NOT NULL,
    kek_name TEXT NOT NULL,
    kek_version INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (file_id, user_id)
);

CREATE TABLE IF NOT EXISTS jobs (
    job_id BLOB PRIMARY KEY,
    job_type TEXT NOT NULL,
    user_id TEXT NOT NULL,
    object_id BLOB REFERENCES objects(object_id) ON DELETE CASCADE,
    parameters_json TEXT,
    status TEXT NOT NULL CHECK (status IN ('pending', 'processing', 'completed', 'failed', 'cancelled')),
    priority INTEGER NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL,
    owner_lease_id TEXT,
    lease_expires_at TEXT,
    started_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_jobs_status_priority ON jobs(status, priority DESC);
CREATE INDEX IF NOT EXISTS idx_jobs_object ON jobs(object_id);
CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner_lease_id);
"#;
