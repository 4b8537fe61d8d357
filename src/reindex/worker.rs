//! Background host for reindex jobs.
//!
//! Polls the job store for runnable jobs and hands each to the orchestrator.
//! A job is runnable when it is `Queued`, or `Running` without any commit for
//! longer than its heartbeat timeout (its previous host died).

use super::error::{ReindexError, StoreError};
use super::job_store::StoredJob;
use super::models::{JobStatus, ReindexJobRecord};
use super::orchestrator::JobOrchestrator;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Jobs fetched per status on each poll.
const POLL_BATCH: usize = 32;

pub struct ReindexWorker {
    orchestrator: Arc<JobOrchestrator>,
    /// Delay between polls when no job is runnable.
    idle_interval: Duration,
}

impl ReindexWorker {
    pub fn new(orchestrator: Arc<JobOrchestrator>, idle_interval: Duration) -> Self {
        Self {
            orchestrator,
            idle_interval,
        }
    }

    /// Jobs this worker may pick up now, orphaned ones first.
    pub fn runnable_jobs(&self) -> Result<Vec<StoredJob>, StoreError> {
        let store = self.orchestrator.store();
        let now = self.orchestrator.clock().now();

        let mut jobs: Vec<StoredJob> = store
            .list_jobs(Some(JobStatus::Running), POLL_BATCH)?
            .into_iter()
            .filter(|job| is_orphaned(&job.record, now))
            .collect();
        jobs.extend(store.list_jobs(Some(JobStatus::Queued), POLL_BATCH)?);
        Ok(jobs)
    }

    /// Run every currently runnable job once. Returns how many were run.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<usize, StoreError> {
        let jobs = self.runnable_jobs()?;
        let mut ran = 0;
        for job in jobs {
            if shutdown.is_cancelled() {
                break;
            }
            let job_id = job.record.id.clone();
            let result = self
                .orchestrator
                .execute(job.record, job.version, shutdown.child_token())
                .await;
            ran += 1;

            match result {
                Ok(stored) => info!(
                    "Reindex job {} finished as {}",
                    job_id, stored.record.status
                ),
                Err(ReindexError::Cancelled) => {
                    info!("Reindex job {} interrupted by shutdown", job_id);
                    break;
                }
                Err(ReindexError::NotRunnable { status, .. }) => {
                    debug!("Reindex job {} became {} before it could run", job_id, status);
                }
                Err(e) if e.is_retryable() => {
                    warn!("Reindex job {} will be retried: {}", job_id, e);
                }
                Err(e) => error!("Reindex job {} could not run: {}", job_id, e),
            }
        }
        Ok(ran)
    }

    /// Main worker loop - call from a spawned task.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Reindex worker starting (idle_interval={}s)",
            self.idle_interval.as_secs()
        );

        loop {
            let ran = match self.run_once(&shutdown).await {
                Ok(ran) => ran,
                Err(e) => {
                    error!("Failed to poll reindex jobs: {}", e);
                    0
                }
            };
            if shutdown.is_cancelled() {
                break;
            }
            if ran > 0 {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.idle_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        info!("Reindex worker stopped");
    }
}

/// A running job whose last commit is older than its heartbeat timeout.
fn is_orphaned(record: &ReindexJobRecord, now: DateTime<Utc>) -> bool {
    record.status == JobStatus::Running
        && (now - record.updated_at)
            .to_std()
            .map(|age| age > record.config.heartbeat_timeout)
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reindex::models::ReindexJobConfig;
    use std::collections::{BTreeMap, BTreeSet};

    fn make_record(status: JobStatus, updated_at: DateTime<Utc>) -> ReindexJobRecord {
        let mut record = ReindexJobRecord::new(
            "job-1",
            BTreeMap::from([("Patient".to_string(), "h1".to_string())]),
            BTreeSet::new(),
            ReindexJobConfig {
                max_concurrency: 1,
                max_resources_per_page: 10,
                heartbeat_timeout: Duration::from_secs(60),
                consecutive_failure_threshold: 3,
            },
            updated_at,
        );
        record.status = status;
        record
    }

    #[test]
    fn test_is_orphaned() {
        let now = Utc::now();
        let old = now - chrono::Duration::seconds(120);
        let recent = now - chrono::Duration::seconds(10);

        assert!(is_orphaned(&make_record(JobStatus::Running, old), now));
        assert!(!is_orphaned(&make_record(JobStatus::Running, recent), now));
        assert!(!is_orphaned(&make_record(JobStatus::Queued, old), now));
        assert!(!is_orphaned(&make_record(JobStatus::Failed, old), now));
    }
}
