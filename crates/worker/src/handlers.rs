//! Built-in job handlers.

use crate::error::ServiceError;
use crate::worker::{JobContext, JobError, JobHandler};
use async_trait::async_trait;
use futures::StreamExt;

/// Job type served by [`VerifyHandler`].
pub const VERIFY_JOB_TYPE: &str = "verify";

/// Reads an object end to end, checking its integrity tag, digest and (for
/// encrypted objects) every authenticated block.
pub struct VerifyHandler;

#[async_trait]
impl JobHandler for VerifyHandler {
    async fn handle(&self, ctx: &JobContext) -> Result<(), JobError> {
        let job = ctx.job();
        if job.payload.job_type != VERIFY_JOB_TYPE {
            return Err(JobError::fatal(format!(
                "unsupported job type {}",
                job.payload.job_type
            )));
        }
        let object_id = job
            .payload
            .object_id
            .ok_or_else(|| JobError::fatal("verify job carries no object id"))?;

        let (info, mut stream) = ctx.content().retrieve(object_id, true).await?;
        let mut stored = 0u64;
        let mut reported = 0u8;
        while let Some(chunk) = stream.next().await {
            if ctx.is_cancelled() {
                return Err(JobError::fatal("cancelled"));
            }
            let chunk = chunk.map_err(|e| match e {
                ServiceError::HashVerification(msg) => {
                    JobError::fatal(format!("object {object_id} is corrupt: {msg}"))
                }
                other => JobError::from(other),
            })?;
            stored += chunk.len() as u64;

            // Plaintext may outgrow the stored size when compressed.
            let percent = if info.size == 0 {
                100
            } else {
                (stored.saturating_mul(100) / info.size).min(99) as u8
            };
            if percent >= reported.saturating_add(10) {
                reported = percent;
                ctx.report_progress(percent).await?;
            }
        }

        tracing::info!(object_id = %object_id, bytes = stored, "object verified");
        Ok(())
    }
}
