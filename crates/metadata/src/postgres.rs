//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult, map_constraint};
use crate::models::*;
use crate::repos::{FileKeyRepo, JobFilter, JobRepo, JobUpdate, ObjectRepo};
use crate::store::MetadataStore;
use async_trait::async_trait;
use murmur_core::config::PgSslMode;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

const STALE_CONDITION: &str = "status = 'processing' \
     AND (lease_expires_at IS NULL \
          OR lease_expires_at <= $2 \
          OR (started_at IS NOT NULL AND started_at <= $3))";

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Connect using a full connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Connect using individual parameters, so the password can come from
    /// the environment rather than a config file.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        // Bounds every statement so a hung query cannot hold a lease forever.
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared statement,
        // so we split the schema and execute each statement separately.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl JobRepo for PostgresStore {
    async fn create_job(&self, job: &JobRow) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, job_type, user_id, object_id, parameters_json, status,
                priority, progress, retry_count, max_retries, owner_lease_id,
                lease_expires_at, started_at, created_at, updated_at,
                completed_at, error_message
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
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
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE job_id = $1")
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
        // SKIP LOCKED lets concurrent claimers pass over a row another
        // transaction is already taking instead of queueing behind it.
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'processing',
                owner_lease_id = $1,
                lease_expires_at = $2,
                started_at = $3,
                updated_at = $3
            WHERE job_id = (
                SELECT job_id FROM jobs
                WHERE status = 'pending'
                  AND (cardinality($4::text[]) = 0 OR job_type = ANY($4))
                ORDER BY priority DESC, created_at ASC, job_id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(owner)
        .bind(lease_expires_at)
        .bind(now)
        .bind(job_types)
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
            "AND (updated_at, job_id) > ($4, $5)"
        } else {
            ""
        };
        let sql = format!(
            "SELECT * FROM jobs WHERE {STALE_CONDITION} {keyset} \
             ORDER BY updated_at ASC, job_id ASC LIMIT $1"
        );
        let mut query = sqlx::query_as::<_, JobRow>(&sql)
            .bind(limit as i64)
            .bind(now)
            .bind(started_before);
        if let Some((updated_at, job_id)) = after {
            query = query.bind(updated_at).bind(job_id);
        }
        let rows = query.fetch_all(&self.pool).await?;
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
                error_message = CASE WHEN retry_count < max_retries THEN error_message ELSE $4 END,
                completed_at = CASE WHEN retry_count < max_retries THEN NULL ELSE $2 END,
                owner_lease_id = NULL,
                lease_expires_at = NULL,
                started_at = NULL,
                updated_at = $2
            WHERE job_id = $1 AND {STALE_CONDITION}
            RETURNING *
            "#
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id)
            .bind(now)
            .bind(started_before)
            .bind(error_message)
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
            SET status = $1,
                progress = CASE WHEN $2::integer IS NULL THEN progress ELSE GREATEST(progress, $2) END,
                error_message = COALESCE($3, error_message),
                retry_count = retry_count + $4,
                owner_lease_id = CASE WHEN $5 THEN NULL ELSE owner_lease_id END,
                lease_expires_at = CASE WHEN $5 THEN NULL ELSE lease_expires_at END,
                started_at = CASE WHEN $6 THEN NULL ELSE started_at END,
                completed_at = $7,
                updated_at = $8
            WHERE job_id = $9
              AND status = $10
              AND ($11::text IS NULL OR owner_lease_id = $11)
            RETURNING *
            "#,
        )
        .bind(&update.status)
        .bind(update.progress)
        .bind(&update.error_message)
        .bind(i32::from(update.increment_retry))
        .bind(update.clear_lease)
        .bind(requeue)
        .bind(update.completed_at)
        .bind(update.updated_at)
        .bind(job_id)
        .bind(expected_status)
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
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR owner_lease_id = $2)
              AND ($3::integer IS NULL OR priority = $3)
              AND ($4::text IS NULL OR job_type = $4)
              AND ($5::text IS NULL OR user_id = $5)
              AND ($6::timestamptz IS NULL OR (created_at, job_id) < ($6, $7))
            ORDER BY created_at DESC, job_id DESC
            LIMIT $8
            "#,
        )
        .bind(&filter.status)
        .bind(&filter.owner_lease_id)
        .bind(filter.priority)
        .bind(&filter.job_type)
        .bind(&filter.user_id)
        .bind(cursor_at)
        .bind(cursor_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

async fn insert_file_key(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    key: &FileKeyRow,
) -> MetadataResult<()> {
    sqlx::query(
        r#"
        INSERT INTO file_keys (file_id, wrapped_key, kek_name, kek_version, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6)
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
    tx: &mut sqlx::Transaction<'_, Postgres>,
    share: &FileKeyShareRow,
) -> MetadataResult<bool> {
    let result = sqlx::query(
        "UPDATE file_key_shares SET wrapped_key = $1, kek_name = $2, kek_version = $3 \
         WHERE file_id = $4 AND user_id = $5",
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
    tx: &mut sqlx::Transaction<'_, Postgres>,
    share: &FileKeyShareRow,
) -> MetadataResult<()> {
    sqlx::query(
        r#"
        INSERT INTO file_key_shares (file_id, user_id, wrapped_key, kek_name, kek_version, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (file_id, user_id) DO UPDATE SET
            wrapped_key = EXCLUDED.wrapped_key,
            kek_name = EXCLUDED.kek_name,
            kek_version = EXCLUDED.kek_version
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
impl ObjectRepo for PostgresStore {
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
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
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
        let row = sqlx::query_as::<_, ObjectRow>("SELECT * FROM objects WHERE object_id = $1")
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
            WHERE ($1::text IS NULL OR bucket = $1)
              AND ($2::text IS NULL OR user_id = $2)
            ORDER BY created_at DESC, object_id DESC
            LIMIT $3
            "#,
        )
        .bind(bucket)
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_object_cascade(&self, object_id: Uuid) -> MetadataResult<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM file_key_shares WHERE file_id = $1")
            .bind(object_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM file_keys WHERE file_id = $1")
            .bind(object_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE object_id = $1")
            .bind(object_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM objects WHERE object_id = $1")
            .bind(object_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn bucket_size(&self, bucket: &str) -> MetadataResult<u64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(size), 0)::BIGINT FROM objects WHERE bucket = $1",
        )
        .bind(bucket)
        .fetch_one(&self.pool)
        .await?;
        Ok(total.max(0) as u64)
    }
}

#[async_trait]
impl FileKeyRepo for PostgresStore {
    async fn create_file_key(&self, key: &FileKeyRow) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_file_key(&mut tx, key).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_file_key(&self, file_id: Uuid) -> MetadataResult<Option<FileKeyRow>> {
        let row = sqlx::query_as::<_, FileKeyRow>("SELECT * FROM file_keys WHERE file_id = $1")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn update_file_key(&self, key: &FileKeyRow) -> MetadataResult<()> {
        let result = sqlx::query(
            "UPDATE file_keys SET wrapped_key = $1, kek_name = $2, kek_version = $3, updated_at = $4 WHERE file_id = $5",
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
        sqlx::query("DELETE FROM file_key_shares WHERE file_id = $1")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM file_keys WHERE file_id = $1")
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
            "SELECT * FROM file_key_shares WHERE file_id = $1 AND user_id = $2",
        )
        .bind(file_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_file_key_shares(&self, file_id: Uuid) -> MetadataResult<Vec<FileKeyShareRow>> {
        let rows = sqlx::query_as::<_, FileKeyShareRow>(
            "SELECT * FROM file_key_shares WHERE file_id = $1 ORDER BY user_id",
        )
        .bind(file_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_file_key_share(&self, file_id: Uuid, user_id: &str) -> MetadataResult<bool> {
        let result = sqlx::query("DELETE FROM file_key_shares WHERE file_id = $1 AND user_id = $2")
            .bind(file_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_all_file_key_shares(&self, file_id: Uuid) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM file_key_shares WHERE file_id = $1")
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
            "UPDATE file_keys SET wrapped_key = $1, kek_name = $2, kek_version = $3, updated_at = $4 WHERE file_id = $5",
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
