//! Job ledger repository.

use crate::error::MetadataResult;
use crate::models::JobRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Filter for job listings. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<String>,
    pub owner_lease_id: Option<String>,
    pub priority: Option<i32>,
    pub job_type: Option<String>,
    pub user_id: Option<String>,
}

/// Conditional job mutation applied by [`JobRepo::update_job`].
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub status: String,
    /// New progress. The stored value never decreases.
    pub progress: Option<i32>,
    /// Replaces the stored message when set.
    pub error_message: Option<String>,
    pub increment_retry: bool,
    /// Drop owner and lease deadline.
    pub clear_lease: bool,
    /// Written as-is, so a requeue clears it.
    pub completed_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

/// Repository for job ledger rows.
///
/// Every mutation is a single conditional statement so concurrent callers
/// cannot interleave between a read and the write that depends on it.
#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Insert a new job.
    async fn create_job(&self, job: &JobRow) -> MetadataResult<()>;

    /// Get a job by ID.
    async fn get_job(&self, job_id: Uuid) -> MetadataResult<Option<JobRow>>;

    /// Atomically move the best pending job to processing.
    ///
    /// Best means highest priority, then earliest `created_at`. An empty
    /// `job_types` slice accepts every type. Returns `None` when nothing is
    /// pending.
    async fn claim_job(
        &self,
        owner: &str,
        now: OffsetDateTime,
        lease_expires_at: OffsetDateTime,
        job_types: &[String],
    ) -> MetadataResult<Option<JobRow>>;

    /// Processing jobs whose lease is missing or expired at `now`, or that
    /// started before `started_before`, ordered by `(updated_at, job_id)`.
    ///
    /// `after` is the `(updated_at, job_id)` of the last row of the previous
    /// page; only rows past it are returned.
    async fn list_stale_jobs(
        &self,
        now: OffsetDateTime,
        started_before: OffsetDateTime,
        after: Option<(OffsetDateTime, Uuid)>,
        limit: u32,
    ) -> MetadataResult<Vec<JobRow>>;

    /// Release one stale job: requeue it with `retry_count + 1` while retries
    /// remain, otherwise fail it with `error_message`.
    ///
    /// Re-checks staleness in the same statement. Returns the updated row, or
    /// `None` when the job is no longer stale.
    async fn release_stale_job(
        &self,
        job_id: Uuid,
        now: OffsetDateTime,
        started_before: OffsetDateTime,
        error_message: &str,
    ) -> MetadataResult<Option<JobRow>>;

    /// Apply `update` if the job is still in `expected_status` and, when
    /// `expected_owner` is set, still leased to that owner.
    ///
    /// Returns `None` when the condition no longer holds.
    async fn update_job(
        &self,
        job_id: Uuid,
        expected_status: &str,
        expected_owner: Option<&str>,
        update: &JobUpdate,
    ) -> MetadataResult<Option<JobRow>>;

    /// List jobs newest first, starting strictly after `cursor`.
    async fn list_jobs(
        &self,
        filter: &JobFilter,
        cursor: Option<(OffsetDateTime, Uuid)>,
        limit: u32,
    ) -> MetadataResult<Vec<JobRow>>;
}
