//! Background stale-lease reaper.

mod common;

use common::*;
use murmur_core::{JobPayload, JobPriority, JobStatus};
use murmur_worker::Reaper;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_reaper_recovers_crashed_worker_job() {
    let ctx = TestContext::new().await;
    let job = ctx
        .app
        .ledger
        .create_job(JobPayload::new("transcode", "alice"), JobPriority::Normal, None)
        .await
        .unwrap();
    ctx.app.ledger.claim_job("crashed", &[]).await.unwrap().unwrap();
    sqlx::query("UPDATE jobs SET lease_expires_at = ? WHERE job_id = ?")
        .bind(OffsetDateTime::now_utc() - time::Duration::seconds(5))
        .bind(*job.id.as_uuid())
        .execute(ctx.pool())
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let reaper = Reaper::new(ctx.app.ledger.clone(), Duration::from_millis(20), 60);
    let handle = reaper.spawn(shutdown.clone());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let current = ctx.app.ledger.get_job(job.id).await.unwrap();
        if current.status == JobStatus::Pending {
            assert_eq!(current.retry_count, 1);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "reaper never released the job");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("reaper should stop on shutdown")
        .unwrap();

    // A fresh claim picks the job up again.
    let reclaimed = ctx.app.ledger.claim_job("replacement", &[]).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, job.id);
}

#[tokio::test]
async fn test_run_once_reports_outcome() {
    let ctx = TestContext::new().await;
    let reaper = ctx.app.reaper();
    assert_eq!(reaper.run_once().await.unwrap().affected(), 0);
}
