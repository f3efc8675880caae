use std::sync::Arc;

use anyhow::Context;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::orchestrator::{RunError, RunOrchestrator};

/// Registers one cron job that starts a run on every tick. Ticks that land
/// while a run is active are skipped by the orchestrator's running guard.
pub async fn build_scheduler(
    orchestrator: Arc<RunOrchestrator>,
    cron: &str,
) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            match orchestrator.run().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    status = %summary.status,
                    persisted = summary.jobs_persisted,
                    "scheduled run finished"
                ),
                Err(RunError::AlreadyRunning) => {
                    warn!("scheduled tick skipped; previous run still active")
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
