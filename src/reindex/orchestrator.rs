//! Scheduling loop of the reindex engine.
//!
//! A run goes through discovery (one count-only query per resource type),
//! partitioning of each type's id window into pages, a bounded pool of
//! workers claiming and executing pages, and finalization.
//!
//! Every state change is a step: a plain function applied to the job record
//! and committed with the record's version token. On a version conflict the
//! record is reloaded and the step is applied again to the fresh copy, so a
//! step never double-counts.

use super::collaborators::{Clock, IndexUpdater, SearchQuery, SearchService};
use super::error::{ReindexError, StoreError};
use super::job_store::{ReindexJobStore, StoredJob};
use super::models::*;
use super::notifier::ReindexNotifier;
use super::policy::{partition_window, ranges_fit_window, FailureOutcome, FailurePolicy};
use super::throttle::ThrottleController;
use crate::metrics;
use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Engine-level settings that are not part of a job's own configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Attempts to reconcile a step after a version conflict before giving up
    pub max_commit_retries: u32,
    /// How long an idle worker waits before looking for claimable pages again
    pub poll_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_commit_retries: 5,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

/// Drives reindex jobs to a terminal status.
pub struct JobOrchestrator {
    store: Arc<dyn ReindexJobStore>,
    search: Arc<dyn SearchService>,
    index_updater: Arc<dyn IndexUpdater>,
    throttle: Arc<dyn ThrottleController>,
    clock: Arc<dyn Clock>,
    notifier: ReindexNotifier,
    settings: OrchestratorSettings,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn ReindexJobStore>,
        search: Arc<dyn SearchService>,
        index_updater: Arc<dyn IndexUpdater>,
        throttle: Arc<dyn ThrottleController>,
        clock: Arc<dyn Clock>,
        notifier: ReindexNotifier,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            search,
            index_updater,
            throttle,
            clock,
            notifier,
            settings,
        }
    }

    pub fn notifier(&self) -> &ReindexNotifier {
        &self.notifier
    }

    pub fn store(&self) -> &Arc<dyn ReindexJobStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Load a job from the store and run it.
    pub async fn run_job(
        &self,
        job_id: &str,
        cancel: CancellationToken,
    ) -> Result<StoredJob, ReindexError> {
        let stored = self
            .store
            .get_job(job_id)?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        self.execute(stored.record, stored.version, cancel).await
    }

    /// Run a job until it reaches a terminal status.
    ///
    /// A `Queued` job is started, a `Running` job is resumed from whatever was
    /// last committed. On cancellation the run stops without touching the
    /// record; pages it left `Running` are recovered by the stale sweep of
    /// the next run.
    pub async fn execute(
        &self,
        record: ReindexJobRecord,
        version: VersionToken,
        cancel: CancellationToken,
    ) -> Result<StoredJob, ReindexError> {
        validate_config(&record.config)?;
        if record.status.is_terminal() {
            return Err(ReindexError::NotRunnable {
                job_id: record.id,
                status: record.status,
            });
        }

        let run = JobRun {
            orchestrator: self,
            job_id: record.id.clone(),
            policy: FailurePolicy::new(&record.config),
            page_size: record.config.max_resources_per_page,
            concurrency: record.config.max_concurrency as usize,
            state: Mutex::new(StoredJob { record, version }),
            wake: Notify::new(),
            cancel: cancel.child_token(),
        };
        run.drive().await
    }
}

/// Reject configurations the engine cannot make progress with.
pub fn validate_config(config: &ReindexJobConfig) -> Result<(), ReindexError> {
    if config.max_concurrency == 0 {
        return Err(ReindexError::InvalidConfig(
            "max_concurrency must be at least 1".to_string(),
        ));
    }
    if config.max_resources_per_page == 0 {
        return Err(ReindexError::InvalidConfig(
            "max_resources_per_page must be at least 1".to_string(),
        ));
    }
    if config.consecutive_failure_threshold == 0 {
        return Err(ReindexError::InvalidConfig(
            "consecutive_failure_threshold must be at least 1".to_string(),
        ));
    }
    if config.heartbeat_timeout.is_zero() {
        return Err(ReindexError::InvalidConfig(
            "heartbeat_timeout must be positive".to_string(),
        ));
    }
    Ok(())
}

/// State of one execution of one job.
struct JobRun<'a> {
    orchestrator: &'a JobOrchestrator,
    job_id: String,
    policy: FailurePolicy,
    page_size: u64,
    concurrency: usize,
    state: Mutex<StoredJob>,
    /// Signalled after every successful commit
    wake: Notify,
    cancel: CancellationToken,
}

impl JobRun<'_> {
    async fn drive(&self) -> Result<StoredJob, ReindexError> {
        match self.commit(start_job).await? {
            Ok(false) => info!("Starting reindex job {}", self.job_id),
            Ok(true) => info!("Resuming reindex job {}", self.job_id),
            Err(status) => {
                return Err(ReindexError::NotRunnable {
                    job_id: self.job_id.clone(),
                    status,
                })
            }
        }

        if self.discover().await? {
            self.partition().await?;
            self.run_workers().await?;
            self.finalize().await?;
        }
        Ok(self.finish().await)
    }

    /// Apply `step` to the record and commit it.
    ///
    /// A step that leaves the record unchanged is not committed.
    async fn commit<T>(
        &self,
        mut step: impl FnMut(&mut ReindexJobRecord, DateTime<Utc>) -> T,
    ) -> Result<T, ReindexError> {
        let store = &self.orchestrator.store;
        let mut state = self.state.lock().await;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let now = self.orchestrator.clock.now();
            let mut next = state.record.clone();
            let value = step(&mut next, now);
            if next == state.record {
                return Ok(value);
            }
            next.updated_at = now;

            match store.update_job(&next, state.version) {
                Ok(version) => {
                    state.record = next;
                    state.version = version;
                    self.wake.notify_waiters();
                    return Ok(value);
                }
                Err(StoreError::VersionConflict { expected, .. }) => {
                    metrics::record_commit_conflict();
                    if attempts > self.orchestrator.settings.max_commit_retries {
                        error!(
                            "Giving up on job {} after {} conflicting commits",
                            self.job_id, attempts
                        );
                        return Err(ReindexError::CommitConflict {
                            job_id: self.job_id.clone(),
                            attempts,
                        });
                    }
                    warn!(
                        "Version conflict on job {} at {}, reloading (attempt {})",
                        self.job_id, expected, attempts
                    );
                    let fresh = store
                        .get_job(&self.job_id)?
                        .ok_or_else(|| StoreError::NotFound(self.job_id.clone()))?;
                    *state = fresh;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn snapshot(&self) -> ReindexJobRecord {
        self.state.lock().await.record.clone()
    }

    /// Await `fut` unless the run is cancelled first.
    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, ReindexError> {
        tokio::select! {
            output = fut => Ok(output),
            _ = self.cancel.cancelled() => Err(ReindexError::Cancelled),
        }
    }

    async fn pause(&self, delay: Duration) -> Result<(), ReindexError> {
        self.cancellable(tokio::time::sleep(delay)).await
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// Count resources needing reindex for every type not yet discovered.
    /// Returns false if the job ended during discovery.
    async fn discover(&self) -> Result<bool, ReindexError> {
        let snapshot = self.snapshot().await;
        let threshold = self.policy.consecutive_failure_threshold;

        for (resource_type, param_hash) in &snapshot.param_hash_by_resource_type {
            if snapshot.progress_by_resource_type.contains_key(resource_type) {
                continue;
            }

            let mut attempt = 0;
            let result = loop {
                attempt += 1;
                let query = SearchQuery::count(resource_type, param_hash);
                let counted = self
                    .cancellable(self.orchestrator.search.query(query))
                    .await?
                    .and_then(|result| match result.total_count {
                        Some(total) => Ok((total, result.id_range)),
                        None => Err(anyhow!(
                            "count query for {} returned no total",
                            resource_type
                        )),
                    });
                match counted {
                    Ok(counted) => break Ok(counted),
                    Err(e) if attempt < threshold => {
                        warn!(
                            "Count query for {} failed (attempt {}/{}): {:#}",
                            resource_type, attempt, threshold, e
                        );
                        self.pause(self.orchestrator.settings.poll_interval).await?;
                    }
                    Err(e) => break Err(e),
                }
            };

            match result {
                Ok((total, id_range)) => {
                    let window = discovered_window(total, id_range);
                    info!(
                        "Discovered {} {} resources to reindex (ids {}..{})",
                        total, resource_type, window.start_id, window.end_id
                    );
                    let progress =
                        ResourceTypeProgress::new(total, window.start_id, window.end_id);
                    self.commit(|record, _| record_discovery(record, resource_type, &progress))
                        .await?;
                }
                Err(e) => {
                    let reason = format!(
                        "count query for {} failed after {} attempts: {:#}",
                        resource_type, attempt, e
                    );
                    error!("Reindex job {} failed: {}", self.job_id, reason);
                    self.commit(|record, now| fail_job(record, &reason, now))
                        .await?;
                    return Ok(false);
                }
            }
        }

        let ended = self.commit(cancel_if_empty).await?;
        if ended {
            let status = self.state.lock().await.record.status;
            if status == JobStatus::Canceled {
                info!(
                    "Nothing to reindex for job {}, canceling",
                    self.job_id
                );
            }
        }
        Ok(!ended)
    }

    // =========================================================================
    // Partitioning
    // =========================================================================

    async fn partition(&self) -> Result<(), ReindexError> {
        let snapshot = self.snapshot().await;
        if snapshot.status != JobStatus::Running {
            return Ok(());
        }

        for (resource_type, progress) in &snapshot.progress_by_resource_type {
            if progress.total_count == 0
                || progress.is_exhausted()
                || snapshot.has_pages_for(resource_type)
            {
                continue;
            }
            let param_hash = snapshot
                .param_hash_by_resource_type
                .get(resource_type)
                .cloned()
                .unwrap_or_default();
            let window = IdWindow::new(progress.cursor_id, progress.window_end_id);

            let proposed = self
                .cancellable(self.orchestrator.search.surrogate_id_ranges(
                    resource_type,
                    &param_hash,
                    window,
                    self.page_size,
                ))
                .await?;
            let ranges = match proposed {
                Ok(ranges) if ranges_fit_window(window, &ranges) => ranges,
                Ok(_) => {
                    warn!(
                        "Store proposed ranges not covering {}..{} for {}, splitting evenly",
                        window.start_id, window.end_id, resource_type
                    );
                    partition_window(window, self.page_size)
                }
                Err(e) => {
                    warn!(
                        "Range lookup for {} failed, splitting evenly: {:#}",
                        resource_type, e
                    );
                    partition_window(window, self.page_size)
                }
            };

            info!(
                "Partitioned {} into {} pages of at most {} resources",
                resource_type,
                ranges.len(),
                self.page_size
            );
            self.commit(|record, _| enqueue_partition(record, resource_type, &ranges))
                .await?;
        }
        Ok(())
    }

    // =========================================================================
    // Worker pool
    // =========================================================================

    async fn run_workers(&self) -> Result<(), ReindexError> {
        debug!(
            "Running job {} with {} workers",
            self.job_id, self.concurrency
        );
        let results = join_all((0..self.concurrency).map(|worker| self.worker(worker))).await;

        let mut first_error: Option<ReindexError> = None;
        for result in results {
            if let Err(e) = result {
                let replace = match &first_error {
                    None => true,
                    Some(ReindexError::Cancelled) => !matches!(e, ReindexError::Cancelled),
                    Some(_) => false,
                };
                if replace {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn worker(&self, worker: usize) -> Result<(), ReindexError> {
        let result = self.worker_loop(worker).await;
        if let Err(e) = &result {
            if !matches!(e, ReindexError::Cancelled) {
                error!("Worker {} of job {} stopped: {}", worker, self.job_id, e);
            }
            // stop the siblings too
            self.cancel.cancel();
        }
        result
    }

    async fn worker_loop(&self, worker: usize) -> Result<(), ReindexError> {
        loop {
            self.throttle_before_claim().await?;

            let wake = self.wake.notified();
            tokio::pin!(wake);

            let claim = self
                .commit(|record, now| claim_next(record, &self.policy, now))
                .await?;
            if !claim.demoted.is_empty() {
                warn!(
                    "Requeued stale pages {:?} of job {}",
                    claim.demoted, self.job_id
                );
                metrics::record_stale_requeues(claim.demoted.len());
            }

            match claim.outcome {
                Claim::Page(claimed) => self.process_page(worker, claimed).await?,
                Claim::Wait => {
                    tokio::select! {
                        _ = &mut wake => {}
                        _ = tokio::time::sleep(self.orchestrator.settings.poll_interval) => {}
                        _ = self.cancel.cancelled() => return Err(ReindexError::Cancelled),
                    }
                }
                Claim::Done | Claim::Halt => return Ok(()),
            }
        }
    }

    async fn throttle_before_claim(&self) -> Result<(), ReindexError> {
        let delay = match self.orchestrator.throttle.next_delay().await {
            Ok(delay) => delay,
            Err(e) => {
                warn!("Throttle unavailable, claiming without delay: {:#}", e);
                metrics::record_throttle_error();
                Duration::ZERO
            }
        };
        metrics::record_throttle_delay(delay);
        if !delay.is_zero() {
            debug!("Throttling next claim of job {} by {:?}", self.job_id, delay);
            self.pause(delay).await?;
        }
        Ok(())
    }

    async fn process_page(&self, worker: usize, claimed: ClaimedPage) -> Result<(), ReindexError> {
        let ClaimedPage {
            page,
            param_hash,
            fingerprints,
        } = claimed;
        let key = page.key();
        debug!(
            "Worker {} claimed page {} (seq {}, ids {}..{})",
            worker, key, page.seq, page.start_id, page.end_id
        );

        let started = Instant::now();
        let execution =
            AssertUnwindSafe(self.execute_page(&page, &param_hash, &fingerprints)).catch_unwind();
        tokio::pin!(execution);

        let interval = self.policy.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                result = &mut execution => break result,
                _ = self.cancel.cancelled() => return Err(ReindexError::Cancelled),
                _ = heartbeat.tick() => {
                    self.commit(|record, now| renew_heartbeat(record, page.seq, now)).await?;
                }
            }
        };
        let outcome = outcome.unwrap_or_else(|panic| {
            Err(anyhow!(
                "page execution panicked: {}",
                panic_message(panic.as_ref())
            ))
        });

        match outcome {
            Ok(work) => {
                let elapsed = started.elapsed();
                let completion = self
                    .commit(|record, _| complete_page(record, page.seq, work.continuation.as_ref()))
                    .await?;
                if completion.completed {
                    metrics::record_page_completed(elapsed);
                    debug!(
                        "Completed page {} of job {}: {} resources in {:?}",
                        key, self.job_id, work.resources, elapsed
                    );
                    if let Some(seq) = completion.continuation_seq {
                        debug!(
                            "Page {} was partially consumed, continuing as page {}",
                            key, seq
                        );
                    }
                } else {
                    debug!("Page {} already settled, dropping duplicate result", key);
                }
                self.orchestrator
                    .throttle
                    .record_page(work.resources, elapsed)
                    .await;
            }
            Err(e) => {
                let message = format!("{:#}", e);
                let failure = self
                    .commit(|record, now| fail_page(record, &self.policy, page.seq, &message, now))
                    .await?;
                match failure {
                    Some(FailureOutcome::Retry { failure_count }) => {
                        metrics::record_page_failure("retry");
                        warn!(
                            "Page {} failed ({}/{}), requeued: {}",
                            key, failure_count, self.policy.consecutive_failure_threshold, message
                        );
                    }
                    Some(FailureOutcome::Permanent { failure_count }) => {
                        metrics::record_page_failure("permanent");
                        error!(
                            "Page {} failed {} times, failing job {}: {}",
                            key, failure_count, self.job_id, message
                        );
                    }
                    None => debug!("Ignoring failure of settled page {}: {}", key, message),
                }
            }
        }
        Ok(())
    }

    /// Query one page window and apply the index updates for what it returned.
    async fn execute_page(
        &self,
        page: &QueryPage,
        param_hash: &str,
        fingerprints: &BTreeMap<String, String>,
    ) -> anyhow::Result<PageWork> {
        let query = SearchQuery::page(
            &page.resource_type,
            param_hash,
            page.window(),
            page.continuation_cursor.clone(),
            self.page_size,
        );
        let result = self
            .orchestrator
            .search
            .query(query)
            .await
            .with_context(|| format!("result-page query for {} failed", page.key()))?;
        if result.continuation.is_some() && result.entries.is_empty() {
            bail!(
                "result-page query for {} returned a continuation without resources",
                page.key()
            );
        }

        self.orchestrator
            .index_updater
            .apply(&result.entries, fingerprints)
            .await
            .with_context(|| format!("index update for {} failed", page.key()))?;

        let last_id = result.entries.iter().map(|e| e.surrogate_id).max();
        let continuation = match (result.continuation, last_id) {
            (Some(cursor), Some(last_id))
                if last_id >= page.start_id && last_id + 1 < page.end_id =>
            {
                Some(Continuation {
                    next_start_id: last_id + 1,
                    cursor,
                })
            }
            _ => None,
        };

        Ok(PageWork {
            resources: result.entries.len() as u64,
            continuation,
        })
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    async fn finalize(&self) -> Result<(), ReindexError> {
        let snapshot = self.snapshot().await;
        if snapshot.status != JobStatus::Running || snapshot.outstanding_pages() > 0 {
            return Ok(());
        }
        if snapshot.count_pages(PageStatus::Failed) > 0 {
            self.commit(|record, now| fail_job(record, "query page failed", now))
                .await?;
            return Ok(());
        }

        let uncovered = uncovered_windows(&snapshot);
        if !uncovered.is_empty() {
            let reason = format!("ids left unprocessed: {}", uncovered.join(", "));
            error!("Reindex job {} failed: {}", self.job_id, reason);
            self.commit(|record, now| fail_job(record, &reason, now))
                .await?;
            return Ok(());
        }

        let urls: Vec<String> = snapshot.search_param_urls_in_scope.iter().cloned().collect();
        let update = self
            .cancellable(self.orchestrator.index_updater.mark_searchable(&urls))
            .await?;
        let failure = match update {
            Ok(update) if update.success => None,
            Ok(update) => Some(format!(
                "marking search parameters searchable failed: {}",
                update.error_detail.as_deref().unwrap_or("no detail")
            )),
            Err(e) => Some(format!(
                "marking search parameters searchable failed: {:#}",
                e
            )),
        };

        match failure {
            None => {
                self.commit(complete_job).await?;
            }
            Some(reason) => {
                error!("Reindex job {} failed: {}", self.job_id, reason);
                self.commit(|record, now| fail_job(record, &reason, now))
                    .await?;
            }
        }
        Ok(())
    }

    async fn finish(&self) -> StoredJob {
        let stored = self.state.lock().await.clone();
        let record = &stored.record;
        if record.status.is_terminal() {
            metrics::record_job_finished(record.status.as_db_str());
            info!(
                "Reindex job {} is {}: {} pages, {} resources",
                record.id, record.status, record.completed_page_count, record.total_resource_count
            );
            self.orchestrator.notifier.notify(record);
        }
        stored
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Window of a type after discovery. Without an id range from the store the
/// window is assumed dense, starting at 1.
fn discovered_window(total: u64, id_range: Option<IdWindow>) -> IdWindow {
    if total == 0 {
        return IdWindow::new(1, 1);
    }
    match id_range {
        Some(range) if !range.is_empty() => range,
        _ => IdWindow::new(1, 1 + i64::try_from(total).unwrap_or(i64::MAX - 1)),
    }
}

// =============================================================================
// Steps
// =============================================================================

/// Outcome of a page execution that returned normally.
struct PageWork {
    resources: u64,
    continuation: Option<Continuation>,
}

/// Remainder of a partially consumed page window.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Continuation {
    next_start_id: i64,
    cursor: String,
}

/// A page claimed by a worker, with what it needs to execute it.
#[derive(Debug, Clone)]
struct ClaimedPage {
    page: QueryPage,
    param_hash: String,
    fingerprints: BTreeMap<String, String>,
}

#[derive(Debug)]
enum Claim {
    Page(ClaimedPage),
    /// Nothing claimable right now, but pages are still outstanding
    Wait,
    /// Every page is settled
    Done,
    /// The job is no longer running
    Halt,
}

#[derive(Debug)]
struct ClaimResult {
    outcome: Claim,
    /// Pages requeued by the stale sweep
    demoted: Vec<i64>,
}

#[derive(Debug, PartialEq, Eq)]
struct PageCompletion {
    completed: bool,
    continuation_seq: Option<i64>,
}

/// Queued → Running. Returns whether the job was already running, or the
/// status that prevents it from running.
fn start_job(record: &mut ReindexJobRecord, now: DateTime<Utc>) -> Result<bool, JobStatus> {
    match record.status {
        JobStatus::Queued => {
            record.status = JobStatus::Running;
            record.started_at = Some(now);
            Ok(false)
        }
        JobStatus::Running => Ok(true),
        status => Err(status),
    }
}

fn record_discovery(
    record: &mut ReindexJobRecord,
    resource_type: &str,
    progress: &ResourceTypeProgress,
) {
    if record.status != JobStatus::Running
        || record.progress_by_resource_type.contains_key(resource_type)
    {
        return;
    }
    record
        .progress_by_resource_type
        .insert(resource_type.to_string(), progress.clone());
    record.total_resource_count = record.discovered_total();
}

/// Cancel a job whose discovery found nothing. Returns true if the job is no
/// longer running.
fn cancel_if_empty(record: &mut ReindexJobRecord, now: DateTime<Utc>) -> bool {
    let fully_discovered = record
        .param_hash_by_resource_type
        .keys()
        .all(|t| record.progress_by_resource_type.contains_key(t));
    if record.status == JobStatus::Running
        && fully_discovered
        && record.query_queue.is_empty()
        && record.discovered_total() == 0
    {
        record.status = JobStatus::Canceled;
        record.resource_types_in_scope.clear();
        record.completed_at = Some(now);
    }
    record.status != JobStatus::Running
}

fn enqueue_partition(record: &mut ReindexJobRecord, resource_type: &str, ranges: &[IdWindow]) {
    if record.status != JobStatus::Running || record.has_pages_for(resource_type) {
        return;
    }
    for range in ranges {
        record.enqueue_page(resource_type, *range);
    }
}

/// Demote stale pages, then claim the next eligible page.
///
/// Only the lowest-window unsettled page of each resource type is eligible,
/// so pages of one type run one at a time and in order. Across types the
/// oldest page wins. Concurrency therefore never exceeds the number of types
/// with outstanding pages: a single-type job runs on one worker whatever
/// `max_concurrency` says.
fn claim_next(
    record: &mut ReindexJobRecord,
    policy: &FailurePolicy,
    now: DateTime<Utc>,
) -> ClaimResult {
    if record.status != JobStatus::Running {
        return ClaimResult {
            outcome: Claim::Halt,
            demoted: Vec::new(),
        };
    }
    let demoted = policy.demote_stale_pages(record, now);
    if record.outstanding_pages() == 0 {
        return ClaimResult {
            outcome: Claim::Done,
            demoted,
        };
    }

    let next_seq = {
        let mut heads: BTreeMap<&str, &QueryPage> = BTreeMap::new();
        for page in record
            .query_queue
            .iter()
            .filter(|p| p.status != PageStatus::Completed)
        {
            heads
                .entry(page.resource_type.as_str())
                .and_modify(|head| {
                    if page.start_id < head.start_id {
                        *head = page;
                    }
                })
                .or_insert(page);
        }
        heads
            .values()
            .filter(|p| p.status == PageStatus::Queued)
            .min_by_key(|p| p.seq)
            .map(|p| p.seq)
    };

    let Some(seq) = next_seq else {
        return ClaimResult {
            outcome: Claim::Wait,
            demoted,
        };
    };
    let fingerprints = record.param_hash_by_resource_type.clone();
    let Some(page) = record.page_mut(seq) else {
        return ClaimResult {
            outcome: Claim::Wait,
            demoted,
        };
    };
    page.status = PageStatus::Running;
    page.last_heartbeat = Some(now);
    let page = page.clone();
    let param_hash = fingerprints
        .get(&page.resource_type)
        .cloned()
        .unwrap_or_default();

    ClaimResult {
        outcome: Claim::Page(ClaimedPage {
            page,
            param_hash,
            fingerprints,
        }),
        demoted,
    }
}

fn renew_heartbeat(record: &mut ReindexJobRecord, seq: i64, now: DateTime<Utc>) {
    if let Some(page) = record.page_mut(seq) {
        if page.status == PageStatus::Running {
            page.last_heartbeat = Some(now);
        }
    }
}

/// Mark a page Completed and advance its type's cursor.
///
/// A partially consumed page is shrunk to what was processed and the rest
/// of its window is enqueued as a continuation page first. Completing a page
/// that is already settled changes nothing.
fn complete_page(
    record: &mut ReindexJobRecord,
    seq: i64,
    continuation: Option<&Continuation>,
) -> PageCompletion {
    let unchanged = PageCompletion {
        completed: false,
        continuation_seq: None,
    };
    if !matches!(record.status, JobStatus::Running | JobStatus::Failed) {
        return unchanged;
    }
    let Some(page) = record.page(seq) else {
        return unchanged;
    };
    if page.status.is_terminal() {
        return unchanged;
    }
    let resource_type = page.resource_type.clone();
    let start_id = page.start_id;
    let mut end_id = page.end_id;

    let mut continuation_seq = None;
    if let Some(continuation) = continuation {
        if record.status == JobStatus::Running
            && continuation.next_start_id > start_id
            && continuation.next_start_id < end_id
        {
            let next = record.enqueue_page(
                &resource_type,
                IdWindow::new(continuation.next_start_id, end_id),
            );
            if let Some(next_page) = record.page_mut(next) {
                next_page.continuation_cursor = Some(continuation.cursor.clone());
            }
            end_id = continuation.next_start_id;
            continuation_seq = Some(next);
        }
    }

    if let Some(page) = record.page_mut(seq) {
        page.end_id = end_id;
        page.status = PageStatus::Completed;
        page.last_heartbeat = None;
    }
    record.completed_page_count += 1;
    if let Some(progress) = record.progress_by_resource_type.get_mut(&resource_type) {
        progress.cursor_id = progress.cursor_id.max(end_id);
    }

    PageCompletion {
        completed: true,
        continuation_seq,
    }
}

/// Count a failed attempt. Reaching the threshold fails the page and the job.
fn fail_page(
    record: &mut ReindexJobRecord,
    policy: &FailurePolicy,
    seq: i64,
    message: &str,
    now: DateTime<Utc>,
) -> Option<FailureOutcome> {
    if record.status != JobStatus::Running {
        return None;
    }
    let page = record.page_mut(seq)?;
    if page.status.is_terminal() {
        return None;
    }
    let failure_count = (page.failure_count + 1).min(policy.consecutive_failure_threshold);
    page.failure_count = failure_count;
    page.last_error = Some(message.to_string());
    page.last_heartbeat = None;

    let outcome = policy.classify(failure_count);
    match outcome {
        FailureOutcome::Retry { .. } => page.status = PageStatus::Queued,
        FailureOutcome::Permanent { .. } => {
            page.status = PageStatus::Failed;
            let key = page.key();
            record.status = JobStatus::Failed;
            record.failure_reason = Some(format!(
                "page {} failed {} consecutive times: {}",
                key, failure_count, message
            ));
            record.completed_at = Some(now);
        }
    }
    Some(outcome)
}

fn fail_job(record: &mut ReindexJobRecord, reason: &str, now: DateTime<Utc>) {
    if record.status != JobStatus::Running {
        return;
    }
    record.status = JobStatus::Failed;
    record.failure_reason = Some(reason.to_string());
    record.completed_at = Some(now);
}

/// Types with work whose cursor stopped short of the window end, as
/// `type (cursor..end)`.
fn uncovered_windows(record: &ReindexJobRecord) -> Vec<String> {
    record
        .progress_by_resource_type
        .iter()
        .filter(|(_, p)| p.total_count > 0 && !p.is_exhausted())
        .map(|(t, p)| format!("{} ({}..{})", t, p.cursor_id, p.window_end_id))
        .collect()
}

/// Running → Completed once every page is Completed and every cursor has
/// passed the end of its window. Returns false otherwise.
fn complete_job(record: &mut ReindexJobRecord, now: DateTime<Utc>) -> bool {
    if record.status != JobStatus::Running
        || record.outstanding_pages() > 0
        || !uncovered_windows(record).is_empty()
    {
        return false;
    }
    record.completed_page_count = record.count_pages(PageStatus::Completed) as u64;
    record.total_resource_count = record.discovered_total();
    record.resource_types_in_scope = record
        .progress_by_resource_type
        .iter()
        .filter(|(_, p)| p.total_count > 0)
        .map(|(t, _)| t.clone())
        .collect();
    record.status = JobStatus::Completed;
    record.completed_at = Some(now);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn make_config(threshold: u32) -> ReindexJobConfig {
        ReindexJobConfig {
            max_concurrency: 2,
            max_resources_per_page: 10,
            heartbeat_timeout: Duration::from_secs(60),
            consecutive_failure_threshold: threshold,
        }
    }

    fn running_record(threshold: u32) -> ReindexJobRecord {
        let mut record = ReindexJobRecord::new(
            "job-1",
            BTreeMap::from([
                ("Patient".to_string(), "h1".to_string()),
                ("Observation".to_string(), "h2".to_string()),
            ]),
            BTreeSet::from(["http://example.org/sp/name".to_string()]),
            make_config(threshold),
            Utc::now(),
        );
        record.status = JobStatus::Running;
        record
            .progress_by_resource_type
            .insert("Patient".to_string(), ResourceTypeProgress::new(25, 1, 26));
        record
            .progress_by_resource_type
            .insert("Observation".to_string(), ResourceTypeProgress::new(5, 1, 6));
        record.total_resource_count = 30;
        enqueue_partition(&mut record, "Patient", &partition_window(IdWindow::new(1, 26), 10));
        enqueue_partition(&mut record, "Observation", &[IdWindow::new(1, 6)]);
        record
    }

    fn claimed_seq(result: &ClaimResult) -> Option<i64> {
        match &result.outcome {
            Claim::Page(claimed) => Some(claimed.page.seq),
            _ => None,
        }
    }

    #[test]
    fn test_validate_config_rejects_zeros() {
        assert!(validate_config(&make_config(3)).is_ok());
        let bad = [
            ReindexJobConfig {
                max_concurrency: 0,
                ..make_config(3)
            },
            ReindexJobConfig {
                max_resources_per_page: 0,
                ..make_config(3)
            },
            make_config(0),
            ReindexJobConfig {
                heartbeat_timeout: Duration::ZERO,
                ..make_config(3)
            },
        ];
        for config in bad {
            assert!(matches!(
                validate_config(&config),
                Err(ReindexError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_start_job_transitions() {
        let mut record = running_record(3);
        record.status = JobStatus::Queued;
        let now = Utc::now();
        assert_eq!(start_job(&mut record, now), Ok(false));
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.started_at, Some(now));
        assert_eq!(start_job(&mut record, now), Ok(true));

        record.status = JobStatus::Completed;
        assert_eq!(start_job(&mut record, now), Err(JobStatus::Completed));
    }

    #[test]
    fn test_discovered_window() {
        assert_eq!(discovered_window(0, None), IdWindow::new(1, 1));
        assert_eq!(discovered_window(5, None), IdWindow::new(1, 6));
        assert_eq!(
            discovered_window(5, Some(IdWindow::new(40, 90))),
            IdWindow::new(40, 90)
        );
        assert_eq!(
            discovered_window(5, Some(IdWindow::new(9, 9))),
            IdWindow::new(1, 6)
        );
    }

    #[test]
    fn test_cancel_if_empty_only_when_all_discovered() {
        let mut record = ReindexJobRecord::new(
            "job-1",
            BTreeMap::from([
                ("Patient".to_string(), "h1".to_string()),
                ("Observation".to_string(), "h2".to_string()),
            ]),
            BTreeSet::new(),
            make_config(3),
            Utc::now(),
        );
        record.status = JobStatus::Running;
        record_discovery(&mut record, "Patient", &ResourceTypeProgress::new(0, 1, 1));
        assert!(!cancel_if_empty(&mut record, Utc::now()));

        record_discovery(&mut record, "Observation", &ResourceTypeProgress::new(0, 1, 1));
        assert!(cancel_if_empty(&mut record, Utc::now()));
        assert_eq!(record.status, JobStatus::Canceled);
        assert!(record.query_queue.is_empty());
    }

    #[test]
    fn test_discovery_is_recorded_once() {
        let mut record = running_record(3);
        record_discovery(&mut record, "Patient", &ResourceTypeProgress::new(999, 1, 1000));
        assert_eq!(record.progress_by_resource_type["Patient"].total_count, 25);
        assert_eq!(record.total_resource_count, 30);
    }

    #[test]
    fn test_partition_enqueues_in_ascending_order() {
        let record = running_record(3);
        let starts: Vec<i64> = record
            .query_queue
            .iter()
            .filter(|p| p.resource_type == "Patient")
            .map(|p| p.start_id)
            .collect();
        assert_eq!(starts, vec![1, 11, 21]);
        assert_eq!(record.query_queue.len(), 4);
    }

    #[test]
    fn test_claim_one_page_per_type_at_a_time() {
        let mut record = running_record(3);
        let policy = FailurePolicy::new(&record.config);
        let now = Utc::now();

        let first = claim_next(&mut record, &policy, now);
        assert_eq!(claimed_seq(&first), Some(1));
        // Patient@1 is running, so the next claim goes to Observation
        let second = claim_next(&mut record, &policy, now);
        assert_eq!(claimed_seq(&second), Some(4));
        let third = claim_next(&mut record, &policy, now);
        assert!(matches!(third.outcome, Claim::Wait));

        complete_page(&mut record, 1, None);
        let fourth = claim_next(&mut record, &policy, now);
        assert_eq!(claimed_seq(&fourth), Some(2));
    }

    #[test]
    fn test_claim_demotes_stale_page_keeping_failure_count() {
        let mut record = running_record(3);
        let policy = FailurePolicy::new(&record.config);
        let start = Utc::now();

        claim_next(&mut record, &policy, start);
        record.page_mut(1).unwrap().failure_count = 1;

        let later = start + chrono::Duration::seconds(61);
        let result = claim_next(&mut record, &policy, later);
        assert_eq!(result.demoted, vec![1]);
        // the demoted page is the head of its type again and the oldest
        assert_eq!(claimed_seq(&result), Some(1));
        assert_eq!(record.page(1).unwrap().failure_count, 1);
        assert_eq!(record.page(1).unwrap().last_heartbeat, Some(later));
    }

    #[test]
    fn test_claim_done_and_halt() {
        let mut record = running_record(3);
        let policy = FailurePolicy::new(&record.config);
        let seqs: Vec<i64> = record.query_queue.iter().map(|p| p.seq).collect();
        for seq in seqs {
            complete_page(&mut record, seq, None);
        }
        assert!(matches!(
            claim_next(&mut record, &policy, Utc::now()).outcome,
            Claim::Done
        ));

        record.status = JobStatus::Failed;
        assert!(matches!(
            claim_next(&mut record, &policy, Utc::now()).outcome,
            Claim::Halt
        ));
    }

    #[test]
    fn test_complete_page_is_idempotent() {
        let mut record = running_record(3);
        let first = complete_page(&mut record, 1, None);
        assert!(first.completed);
        assert_eq!(record.progress_by_resource_type["Patient"].cursor_id, 11);

        let again = complete_page(&mut record, 1, None);
        assert!(!again.completed);
        assert_eq!(record.completed_page_count, 1);
        assert_eq!(record.count_pages(PageStatus::Completed), 1);
        assert_eq!(record.total_resource_count, 30);
    }

    #[test]
    fn test_complete_page_with_continuation_splits_window() {
        let mut record = running_record(3);
        let continuation = Continuation {
            next_start_id: 6,
            cursor: "after-5".to_string(),
        };
        let completion = complete_page(&mut record, 1, Some(&continuation));
        assert_eq!(completion.continuation_seq, Some(5));

        let original = record.page(1).unwrap();
        assert_eq!((original.start_id, original.end_id), (1, 6));
        let rest = record.page(5).unwrap();
        assert_eq!((rest.start_id, rest.end_id), (6, 11));
        assert_eq!(rest.continuation_cursor.as_deref(), Some("after-5"));
        assert_eq!(rest.status, PageStatus::Queued);
        assert_eq!(record.progress_by_resource_type["Patient"].cursor_id, 6);

        // the continuation runs before the next partition of the same type
        let policy = FailurePolicy::new(&record.config);
        let result = claim_next(&mut record, &policy, Utc::now());
        assert_eq!(claimed_seq(&result), Some(4));
        let result = claim_next(&mut record, &policy, Utc::now());
        assert_eq!(claimed_seq(&result), Some(5));
    }

    #[test]
    fn test_fail_page_escalates_exactly_at_threshold() {
        let mut record = running_record(3);
        let policy = FailurePolicy::new(&record.config);
        let now = Utc::now();

        assert_eq!(
            fail_page(&mut record, &policy, 1, "boom", now),
            Some(FailureOutcome::Retry { failure_count: 1 })
        );
        assert_eq!(record.page(1).unwrap().status, PageStatus::Queued);
        assert_eq!(
            fail_page(&mut record, &policy, 1, "boom", now),
            Some(FailureOutcome::Retry { failure_count: 2 })
        );
        assert_eq!(
            fail_page(&mut record, &policy, 1, "boom", now),
            Some(FailureOutcome::Permanent { failure_count: 3 })
        );

        let page = record.page(1).unwrap();
        assert_eq!(page.status, PageStatus::Failed);
        assert_eq!(page.failure_count, 3);
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.failure_reason.as_deref().unwrap().contains("Patient@1"));

        // further failures are ignored once the job has failed
        assert_eq!(fail_page(&mut record, &policy, 1, "boom", now), None);
        assert_eq!(record.page(1).unwrap().failure_count, 3);
    }

    #[test]
    fn test_in_flight_page_completes_after_job_failed() {
        let mut record = running_record(1);
        let policy = FailurePolicy::new(&record.config);
        let now = Utc::now();
        claim_next(&mut record, &policy, now);
        claim_next(&mut record, &policy, now);

        fail_page(&mut record, &policy, 4, "boom", now);
        assert_eq!(record.status, JobStatus::Failed);

        let completion = complete_page(
            &mut record,
            1,
            Some(&Continuation {
                next_start_id: 5,
                cursor: "c".to_string(),
            }),
        );
        assert!(completion.completed);
        assert_eq!(completion.continuation_seq, None);
        assert_eq!(record.status, JobStatus::Failed);
    }

    #[test]
    fn test_complete_job_aggregates() {
        let mut record = running_record(3);
        record
            .progress_by_resource_type
            .insert("Encounter".to_string(), ResourceTypeProgress::new(0, 1, 1));
        assert!(!complete_job(&mut record, Utc::now()));

        let seqs: Vec<i64> = record.query_queue.iter().map(|p| p.seq).collect();
        for seq in seqs {
            complete_page(&mut record, seq, None);
        }
        assert!(complete_job(&mut record, Utc::now()));
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.completed_page_count, 4);
        assert_eq!(record.total_resource_count, 30);
        assert_eq!(
            record.resource_types_in_scope,
            BTreeSet::from(["Observation".to_string(), "Patient".to_string()])
        );
        assert!(record
            .progress_by_resource_type
            .values()
            .all(|p| p.is_exhausted()));
    }

    #[test]
    fn test_complete_job_requires_every_window_covered() {
        let mut record = running_record(3);
        // Observation pages only reach id 4 of its 1..6 window
        let observation_seq = record
            .query_queue
            .iter()
            .find(|p| p.resource_type == "Observation")
            .map(|p| p.seq)
            .unwrap();
        record.page_mut(observation_seq).unwrap().end_id = 4;
        let seqs: Vec<i64> = record.query_queue.iter().map(|p| p.seq).collect();
        for seq in seqs {
            complete_page(&mut record, seq, None);
        }

        assert_eq!(
            uncovered_windows(&record),
            vec!["Observation (4..6)".to_string()]
        );
        assert!(!complete_job(&mut record, Utc::now()));
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.progress_by_resource_type["Observation"].cursor_id, 4);
    }

    #[test]
    fn test_renew_heartbeat_only_for_running_page() {
        let mut record = running_record(3);
        let policy = FailurePolicy::new(&record.config);
        let start = Utc::now();
        claim_next(&mut record, &policy, start);

        let later = start + chrono::Duration::seconds(20);
        renew_heartbeat(&mut record, 1, later);
        renew_heartbeat(&mut record, 2, later);
        assert_eq!(record.page(1).unwrap().last_heartbeat, Some(later));
        assert_eq!(record.page(2).unwrap().last_heartbeat, None);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("index blew up");
        assert_eq!(panic_message(boxed.as_ref()), "index blew up");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
