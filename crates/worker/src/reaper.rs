//! Background release of stale job leases.

use crate::error::ServiceResult;
use crate::ledger::{JobLedger, ReleaseOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Periodically returns jobs of crashed or stalled workers to the ledger.
///
/// Runs independently of any worker, so a job is recovered even when every
/// worker that touched it is gone.
pub struct Reaper {
    ledger: Arc<JobLedger>,
    interval: Duration,
    max_lease_minutes: u64,
}

impl Reaper {
    pub fn new(ledger: Arc<JobLedger>, interval: Duration, max_lease_minutes: u64) -> Self {
        Self {
            ledger,
            interval,
            max_lease_minutes,
        }
    }

    pub async fn run_once(&self) -> ServiceResult<ReleaseOutcome> {
        self.ledger.release_stale_jobs(self.max_lease_minutes).await
    }

    /// Run until `shutdown` is cancelled. A failed pass is logged and the
    /// next tick tries again.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                interval_secs = self.interval.as_secs(),
                max_lease_minutes = self.max_lease_minutes,
                "reaper started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            tracing::error!(error = %e, "reaper pass failed");
                        }
                    }
                }
            }
            tracing::info!("reaper stopped");
        })
    }
}
