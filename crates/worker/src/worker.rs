//! Worker pool: claim loops that run leased jobs through a typed handler.

use crate::content::ContentStore;
use crate::error::{ServiceError, ServiceResult};
use crate::ledger::JobLedger;
use async_trait::async_trait;
use murmur_core::config::WorkerConfig;
use murmur_core::{Job, JobId, JobStatus};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Failure reported by a [`JobHandler`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct JobError {
    pub message: String,
    /// Whether the job should be requeued while it has retries left.
    pub retryable: bool,
}

impl JobError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<ServiceError> for JobError {
    fn from(err: ServiceError) -> Self {
        Self {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

/// Work performed for a claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext) -> Result<(), JobError>;
}

/// What a handler sees of the job it runs.
pub struct JobContext {
    job: Job,
    owner: String,
    ledger: Arc<JobLedger>,
    content: Arc<ContentStore>,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Lease owner id this job is running under.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    /// Record progress. Losing the lease cancels the context.
    pub async fn report_progress(&self, progress: u8) -> ServiceResult<()> {
        match self
            .ledger
            .report_progress(self.job.id, &self.owner, progress)
            .await
        {
            Ok(_) => Ok(()),
            Err(e @ ServiceError::Conflict(_)) => {
                self.cancel.cancel();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Set once the job was cancelled or its lease was lost. Long-running
    /// handlers check this between units of work.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Lease owner id for this process: `<hostname>-<pid>`.
pub fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "murmur".to_string());
    format!("{host}-{}", std::process::id())
}

/// How a claimed job ended, from the pool's point of view.
enum Outcome {
    Finished(Result<(), JobError>),
    /// Cancelled or lease lost; nothing is written back.
    Abandoned,
    TimedOut,
    Panicked,
}

pub struct WorkerPool {
    ledger: Arc<JobLedger>,
    content: Arc<ContentStore>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    lease_duration: Duration,
    worker_id: String,
}

impl WorkerPool {
    pub fn new(
        ledger: Arc<JobLedger>,
        content: Arc<ContentStore>,
        handler: Arc<dyn JobHandler>,
        config: WorkerConfig,
        lease_duration: Duration,
    ) -> Self {
        let worker_id = config.worker_id.clone().unwrap_or_else(default_worker_id);
        Self {
            ledger,
            content,
            handler,
            config,
            lease_duration,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim one job as `owner` and run it to the end. Returns `false` when
    /// nothing was pending.
    pub async fn run_once(&self, owner: &str) -> ServiceResult<bool> {
        let Some(job) = self.ledger.claim_job(owner, &self.config.job_types).await? else {
            return Ok(false);
        };
        self.execute(job, owner).await?;
        Ok(true)
    }

    /// Run `concurrency` claim loops until `shutdown` is cancelled. Jobs in
    /// flight are allowed to finish.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let concurrency = self.config.concurrency.max(1);
        tracing::info!(worker_id = %self.worker_id, concurrency, "worker pool started");

        let mut loops = JoinSet::new();
        for slot in 0..concurrency {
            let owner = if concurrency > 1 {
                format!("{}/{slot}", self.worker_id)
            } else {
                self.worker_id.clone()
            };
            let pool = self.clone();
            let shutdown = shutdown.clone();
            loops.spawn(async move { pool.claim_loop(owner, shutdown).await });
        }
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "claim loop terminated abnormally");
            }
        }
        tracing::info!(worker_id = %self.worker_id, "worker pool stopped");
    }

    async fn claim_loop(&self, owner: String, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            let idle = match self.run_once(&owner).await {
                Ok(true) => false,
                Ok(false) => true,
                Err(e) => {
                    tracing::error!(owner = %owner, error = %e, "claim loop error");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                }
            }
        }
    }

    async fn execute(&self, job: Job, owner: &str) -> ServiceResult<()> {
        let job_id = job.id;
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let watcher = self.spawn_watcher(job_id, owner.to_string(), cancel.clone(), finished.clone());

        let ctx = Arc::new(JobContext {
            job,
            owner: owner.to_string(),
            ledger: self.ledger.clone(),
            content: self.content.clone(),
            cancel: cancel.clone(),
        });
        let handler = self.handler.clone();
        let mut task = tokio::spawn(async move { handler.handle(&ctx).await });

        let outcome = tokio::select! {
            joined = tokio::time::timeout(self.lease_duration, &mut task) => match joined {
                Ok(Ok(result)) => Outcome::Finished(result),
                Ok(Err(e)) if e.is_panic() => Outcome::Panicked,
                Ok(Err(_)) => Outcome::Abandoned,
                Err(_) => Outcome::TimedOut,
            },
            _ = cancel.cancelled() => Outcome::Abandoned,
        };
        task.abort();
        finished.cancel();
        if let Err(e) = watcher.await {
            tracing::warn!(job_id = %job_id, error = %e, "job watcher failed");
        }

        match outcome {
            Outcome::Finished(Ok(())) => {
                self.settle(self.ledger.complete_job(job_id, owner).await)
                    .map(|_| ())
            }
            Outcome::Finished(Err(e)) => self.fail(job_id, owner, &e).await,
            Outcome::TimedOut => {
                let e = JobError::retryable(format!(
                    "handler exceeded lease of {}s",
                    self.lease_duration.as_secs()
                ));
                self.fail(job_id, owner, &e).await
            }
            Outcome::Panicked => {
                self.fail(job_id, owner, &JobError::fatal("handler panicked"))
                    .await
            }
            Outcome::Abandoned => {
                tracing::info!(job_id = %job_id, owner, "job cancelled or lease lost, result discarded");
                Ok(())
            }
        }
    }

    async fn fail(&self, job_id: JobId, owner: &str, error: &JobError) -> ServiceResult<()> {
        let Some(failed) = self.settle(self.ledger.fail_job(job_id, owner, &error.message).await)?
        else {
            return Ok(());
        };
        if error.retryable && failed.can_retry() {
            self.ledger.retry_job(job_id).await?;
        }
        Ok(())
    }

    /// A lost lease is not an error of this worker; the job belongs to
    /// someone else now.
    fn settle(&self, result: ServiceResult<Job>) -> ServiceResult<Option<Job>> {
        match result {
            Ok(job) => Ok(Some(job)),
            Err(ServiceError::Conflict(msg)) => {
                tracing::warn!(reason = %msg, "job result discarded");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Poll the job row and cancel `cancel` once the job is cancelled or no
    /// longer leased to `owner`.
    fn spawn_watcher(
        &self,
        job_id: JobId,
        owner: String,
        cancel: CancellationToken,
        finished: CancellationToken,
    ) -> JoinHandle<()> {
        let ledger = self.ledger.clone();
        let every = self.config.cancel_poll_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = finished.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                match ledger.get_job(job_id).await {
                    Ok(job) if job.status == JobStatus::Cancelled => {
                        tracing::info!(job_id = %job_id, "job cancelled while running");
                        cancel.cancel();
                        return;
                    }
                    Ok(job) => {
                        let ours = job.owner_lease_id.as_deref() == Some(owner.as_str());
                        if !ours || !job.holds_lease_at(OffsetDateTime::now_utc()) {
                            tracing::warn!(job_id = %job_id, owner = %owner, "job lease lost");
                            cancel.cancel();
                            return;
                        }
                    }
                    Err(ServiceError::NotFound(_)) => {
                        tracing::warn!(job_id = %job_id, "job disappeared while running");
                        cancel.cancel();
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "job status check failed");
                    }
                }
            }
        })
    }
}
