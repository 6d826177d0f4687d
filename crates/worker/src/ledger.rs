//! Job ledger: lease-based claiming, state transitions and stale-job release.
//!
//! All coordination between workers goes through single conditional
//! statements in the metadata store. The ledger adds transition checks,
//! bounded retries on transient database errors and typed results.

use crate::error::{ServiceError, ServiceResult};
use murmur_core::config::JobConfig;
use murmur_core::{Job, JobCursor, JobId, JobPayload, JobPriority, JobStatus};
use murmur_metadata::models::JobRow;
use murmur_metadata::{JobFilter, JobUpdate, MetadataResult, MetadataStore};
use std::future::Future;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

/// Error message recorded on jobs failed by the reaper.
pub const LEASE_EXHAUSTED_MESSAGE: &str = "lease expired, retries exhausted";

/// Upper bound on one page of [`JobLedger::list_jobs`].
pub const MAX_PAGE_SIZE: u32 = 500;

const STALE_BATCH_SIZE: u32 = 100;

/// Listing filter. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub status: Option<JobStatus>,
    pub owner_lease_id: Option<String>,
    pub priority: Option<JobPriority>,
    pub job_type: Option<String>,
    pub user_id: Option<String>,
}

impl JobQuery {
    fn to_filter(&self) -> JobFilter {
        JobFilter {
            status: self.status.map(|s| s.as_str().to_string()),
            owner_lease_id: self.owner_lease_id.clone(),
            priority: self.priority.map(|p| p.as_i32()),
            job_type: self.job_type.clone(),
            user_id: self.user_id.clone(),
        }
    }
}

/// One page of jobs, newest first.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// Pass back to fetch the next page. `None` on the last page.
    pub next_cursor: Option<String>,
}

/// Partial update for [`JobLedger::update_job`].
#[derive(Debug, Clone, Default)]
pub struct JobChange {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub error_message: Option<String>,
}

impl JobChange {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

/// Result of one [`JobLedger::release_stale_jobs`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// Jobs returned to pending.
    pub requeued: u64,
    /// Jobs failed because their retries ran out.
    pub failed: u64,
    /// Jobs that could not be released this pass.
    pub errors: u64,
}

impl ReleaseOutcome {
    pub fn affected(&self) -> u64 {
        self.requeued + self.failed
    }
}

pub struct JobLedger {
    metadata: Arc<dyn MetadataStore>,
    config: JobConfig,
}

impl JobLedger {
    pub fn new(metadata: Arc<dyn MetadataStore>, config: JobConfig) -> Self {
        Self { metadata, config }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Record a new pending job. `max_retries` falls back to
    /// `jobs.default_max_retries`.
    pub async fn create_job(
        &self,
        payload: JobPayload,
        priority: JobPriority,
        max_retries: Option<u32>,
    ) -> ServiceResult<Job> {
        if payload.job_type.trim().is_empty() {
            return Err(ServiceError::Validation("job type must not be empty".to_string()));
        }
        if payload.user_id.trim().is_empty() {
            return Err(ServiceError::Validation("user id must not be empty".to_string()));
        }
        let max_retries = max_retries.unwrap_or(self.config.default_max_retries);
        let row = JobRow::pending(&payload, priority, max_retries, OffsetDateTime::now_utc())?;
        self.metadata.create_job(&row).await?;
        let job = Job::try_from(row)?;

        tracing::info!(
            event = "job_created",
            job_id = %job.id,
            job_type = %job.payload.job_type,
            priority = %job.priority,
            max_retries,
            "job created"
        );
        Ok(job)
    }

    pub async fn get_job(&self, job_id: JobId) -> ServiceResult<Job> {
        Ok(Job::try_from(self.load(job_id).await?)?)
    }

    /// List jobs newest first. `cursor` is the `next_cursor` of a previous
    /// page.
    pub async fn list_jobs(
        &self,
        query: &JobQuery,
        cursor: Option<&str>,
        limit: u32,
    ) -> ServiceResult<JobPage> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let after = cursor
            .map(JobCursor::decode)
            .transpose()?
            .map(|c| (c.created_at, *c.job_id.as_uuid()));

        let rows = self
            .metadata
            .list_jobs(&query.to_filter(), after, limit + 1)
            .await?;
        let more = rows.len() > limit as usize;
        let jobs = rows
            .into_iter()
            .take(limit as usize)
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let next_cursor = if more {
            jobs.last().map(|job| job.cursor().encode())
        } else {
            None
        };
        Ok(JobPage { jobs, next_cursor })
    }

    /// Atomically lease the best pending job to `worker_id`.
    ///
    /// Highest priority wins, then the oldest job. Returns `None` when no
    /// pending job of an accepted type exists.
    pub async fn claim_job(&self, worker_id: &str, job_types: &[String]) -> ServiceResult<Option<Job>> {
        if worker_id.trim().is_empty() {
            return Err(ServiceError::Validation("worker id must not be empty".to_string()));
        }
        let lease = self.lease_duration()?;
        let claimed = self
            .with_db_retry("claim_job", || {
                let now = OffsetDateTime::now_utc();
                self.metadata.claim_job(worker_id, now, now + lease, job_types)
            })
            .await?;

        let Some(row) = claimed else {
            return Ok(None);
        };
        let job = Job::try_from(row)?;
        tracing::info!(
            event = "job_claimed",
            job_id = %job.id,
            job_type = %job.payload.job_type,
            worker_id,
            "job claimed"
        );
        Ok(Some(job))
    }

    /// Release processing jobs whose lease expired, or that have been
    /// processing for longer than `max_lease_minutes`.
    ///
    /// Each job is requeued with one more retry, or failed once its retries
    /// are used up. A job that cannot be released is logged and skipped.
    pub async fn release_stale_jobs(&self, max_lease_minutes: u64) -> ServiceResult<ReleaseOutcome> {
        let now = OffsetDateTime::now_utc();
        let max_age = i64::try_from(max_lease_minutes.saturating_mul(60)).unwrap_or(i64::MAX);
        let started_before = now
            .checked_sub(time::Duration::seconds(max_age))
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);

        let mut outcome = ReleaseOutcome::default();
        let mut after: Option<(OffsetDateTime, Uuid)> = None;
        loop {
            let batch = self
                .with_db_retry("list_stale_jobs", || {
                    self.metadata
                        .list_stale_jobs(now, started_before, after, STALE_BATCH_SIZE)
                })
                .await?;
            let full = batch.len() == STALE_BATCH_SIZE as usize;
            let Some(last) = batch.last() else {
                break;
            };
            after = Some((last.updated_at, last.job_id));

            for row in batch {
                let released = self
                    .with_db_retry("release_stale_job", || {
                        self.metadata.release_stale_job(
                            row.job_id,
                            now,
                            started_before,
                            LEASE_EXHAUSTED_MESSAGE,
                        )
                    })
                    .await;
                match released {
                    Ok(Some(updated)) if updated.status == JobStatus::Failed.as_str() => {
                        outcome.failed += 1;
                        tracing::warn!(
                            event = "job_lease_exhausted",
                            job_id = %updated.job_id,
                            retry_count = updated.retry_count,
                            "stale job failed, retries exhausted"
                        );
                    }
                    Ok(Some(updated)) => {
                        outcome.requeued += 1;
                        tracing::info!(
                            event = "job_requeued",
                            job_id = %updated.job_id,
                            previous_owner = row.owner_lease_id.as_deref().unwrap_or("-"),
                            retry_count = updated.retry_count,
                            "stale job requeued"
                        );
                    }
                    // Finished or re-claimed since it was listed.
                    Ok(None) => {}
                    Err(e) => {
                        outcome.errors += 1;
                        tracing::warn!(job_id = %row.job_id, error = %e, "failed to release stale job");
                    }
                }
            }

            if !full {
                break;
            }
        }

        if outcome.affected() > 0 || outcome.errors > 0 {
            tracing::info!(
                requeued = outcome.requeued,
                failed = outcome.failed,
                errors = outcome.errors,
                "stale jobs released"
            );
        }
        Ok(outcome)
    }

    /// Apply a partial update.
    ///
    /// A move into a state without a lease drops the lease. A progress value
    /// below the stored one is clamped and logged rather than rejected.
    pub async fn update_job(&self, job_id: JobId, change: JobChange) -> ServiceResult<Job> {
        let current = self.get_job(job_id).await?;
        let target = change.status.unwrap_or(current.status);
        if !current.status.can_transition_to(target) {
            return Err(ServiceError::Conflict(format!(
                "job {job_id} cannot move from {} to {target}",
                current.status
            )));
        }
        if current.status != target {
            match target {
                JobStatus::Processing => {
                    return Err(ServiceError::Conflict(format!(
                        "job {job_id} enters processing only by being claimed"
                    )));
                }
                JobStatus::Pending if current.status == JobStatus::Failed => {
                    return self.retry_job(job_id).await;
                }
                _ => {}
            }
        }
        let progress = self.checked_progress(&current, change.progress)?;

        let now = OffsetDateTime::now_utc();
        let update = JobUpdate {
            status: target.as_str().to_string(),
            progress,
            error_message: change.error_message,
            increment_retry: false,
            clear_lease: target.clears_lease(),
            completed_at: if target.is_terminal() {
                current.completed_at.or(Some(now))
            } else {
                None
            },
            updated_at: now,
        };
        let updated = self
            .metadata
            .update_job(*job_id.as_uuid(), current.status.as_str(), None, &update)
            .await?
            .ok_or_else(|| ServiceError::Conflict(format!("job {job_id} changed concurrently")))?;

        tracing::debug!(job_id = %job_id, from = %current.status, to = %target, "job updated");
        Ok(Job::try_from(updated)?)
    }

    /// Record progress on a job leased to `owner`.
    pub async fn report_progress(&self, job_id: JobId, owner: &str, progress: u8) -> ServiceResult<Job> {
        let current = self.get_job(job_id).await?;
        let progress = self.checked_progress(&current, Some(progress))?;
        let update = JobUpdate {
            status: JobStatus::Processing.as_str().to_string(),
            progress,
            error_message: None,
            increment_retry: false,
            clear_lease: false,
            completed_at: None,
            updated_at: OffsetDateTime::now_utc(),
        };
        self.leased_update(job_id, owner, &update).await
    }

    /// Mark a job leased to `owner` as completed.
    pub async fn complete_job(&self, job_id: JobId, owner: &str) -> ServiceResult<Job> {
        let now = OffsetDateTime::now_utc();
        let update = JobUpdate {
            status: JobStatus::Completed.as_str().to_string(),
            progress: Some(100),
            error_message: None,
            increment_retry: false,
            clear_lease: true,
            completed_at: Some(now),
            updated_at: now,
        };
        let job = self.leased_update(job_id, owner, &update).await?;
        tracing::info!(event = "job_completed", job_id = %job_id, owner, "job completed");
        Ok(job)
    }

    /// Mark a job leased to `owner` as failed with `message`.
    pub async fn fail_job(&self, job_id: JobId, owner: &str, message: &str) -> ServiceResult<Job> {
        let now = OffsetDateTime::now_utc();
        let update = JobUpdate {
            status: JobStatus::Failed.as_str().to_string(),
            progress: None,
            error_message: Some(message.to_string()),
            increment_retry: false,
            clear_lease: true,
            completed_at: Some(now),
            updated_at: now,
        };
        let job = self.leased_update(job_id, owner, &update).await?;
        tracing::warn!(event = "job_failed", job_id = %job_id, owner, error = message, "job failed");
        Ok(job)
    }

    /// Cancel a pending or processing job.
    ///
    /// A processing job is only marked; its worker notices and stops on its
    /// next status check.
    pub async fn cancel_job(&self, job_id: JobId) -> ServiceResult<Job> {
        let current = self.get_job(job_id).await?;
        if !current.status.is_cancellable() {
            return Err(ServiceError::Conflict(format!(
                "job {job_id} is {} and cannot be cancelled",
                current.status
            )));
        }
        let now = OffsetDateTime::now_utc();
        let update = JobUpdate {
            status: JobStatus::Cancelled.as_str().to_string(),
            progress: None,
            error_message: None,
            increment_retry: false,
            clear_lease: true,
            completed_at: Some(now),
            updated_at: now,
        };
        let cancelled = self
            .metadata
            .update_job(*job_id.as_uuid(), current.status.as_str(), None, &update)
            .await?
            .ok_or_else(|| {
                ServiceError::Conflict(format!("job {job_id} changed while being cancelled"))
            })?;

        tracing::info!(event = "job_cancelled", job_id = %job_id, from = %current.status, "job cancelled");
        Ok(Job::try_from(cancelled)?)
    }

    /// Requeue a failed job, consuming one retry.
    pub async fn retry_job(&self, job_id: JobId) -> ServiceResult<Job> {
        let current = self.get_job(job_id).await?;
        if current.status != JobStatus::Failed {
            return Err(ServiceError::Conflict(format!(
                "job {job_id} is {}, only failed jobs can be retried",
                current.status
            )));
        }
        if current.retry_count >= current.max_retries {
            return Err(ServiceError::Conflict(format!(
                "job {job_id} has used all {} retries",
                current.max_retries
            )));
        }
        let update = JobUpdate {
            status: JobStatus::Pending.as_str().to_string(),
            progress: None,
            error_message: None,
            increment_retry: true,
            clear_lease: true,
            completed_at: None,
            updated_at: OffsetDateTime::now_utc(),
        };
        let requeued = self
            .metadata
            .update_job(*job_id.as_uuid(), JobStatus::Failed.as_str(), None, &update)
            .await?
            .ok_or_else(|| ServiceError::Conflict(format!("job {job_id} changed while being retried")))?;
        let job = Job::try_from(requeued)?;

        tracing::info!(
            event = "job_retried",
            job_id = %job_id,
            retry_count = job.retry_count,
            max_retries = job.max_retries,
            "job requeued for retry"
        );
        Ok(job)
    }

    async fn load(&self, job_id: JobId) -> ServiceResult<JobRow> {
        self.metadata
            .get_job(*job_id.as_uuid())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("job {job_id}")))
    }

    async fn leased_update(&self, job_id: JobId, owner: &str, update: &JobUpdate) -> ServiceResult<Job> {
        let updated = self
            .metadata
            .update_job(
                *job_id.as_uuid(),
                JobStatus::Processing.as_str(),
                Some(owner),
                update,
            )
            .await?;
        match updated {
            Some(row) => Ok(Job::try_from(row)?),
            None => {
                // Distinguish a vanished job from a lost lease.
                self.load(job_id).await?;
                Err(ServiceError::Conflict(format!(
                    "job {job_id} is no longer leased to {owner}"
                )))
            }
        }
    }

    fn checked_progress(&self, current: &Job, progress: Option<u8>) -> ServiceResult<Option<i32>> {
        let Some(progress) = progress else {
            return Ok(None);
        };
        if progress > 100 {
            return Err(ServiceError::Validation(format!(
                "progress {progress} is outside 0..=100"
            )));
        }
        if progress < current.progress {
            tracing::warn!(
                job_id = %current.id,
                stored = current.progress,
                requested = progress,
                "ignoring backwards progress"
            );
            return Ok(Some(i32::from(current.progress)));
        }
        Ok(Some(i32::from(progress)))
    }

    fn lease_duration(&self) -> ServiceResult<time::Duration> {
        time::Duration::try_from(self.config.lease_duration())
            .map_err(|e| ServiceError::Validation(format!("lease duration: {e}")))
    }

    /// Run `op` again with exponential backoff while the database reports a
    /// transient failure.
    async fn with_db_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> ServiceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MetadataResult<T>>,
    {
        let attempts = self.config.db_retry_attempts.max(1);
        let mut backoff = self.config.db_retry_backoff();
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(op, attempt, error = %e, "transient database error, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
