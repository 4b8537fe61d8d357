//! Common test infrastructure
//!
//! Scriptable fakes for the services the reindex engine drives, plus a
//! harness wiring them to an in-memory job store.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{make_job, FakeIndexUpdater, FakeSearch, Harness};
//!
//! #[tokio::test]
//! async fn test_runs() {
//!     let harness = Harness::new(FakeSearch::with_counts(&[("Patient", 5)]), FakeIndexUpdater::new());
//!     let job = harness.create(make_job("job-1", &[("Patient", "h1")], 2, 10, 3));
//!     let stored = harness.run(&job).await.unwrap();
//! }
//! ```

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use search_reindex::reindex::{
    partition_window, IdWindow, IndexUpdater, JobOrchestrator, ManualClock, OrchestratorSettings, ReindexError,
    ReindexJobConfig, ReindexJobRecord, ReindexJobStore, ReindexNotifier, ResourceEntry,
    SearchQuery, SearchResult, SearchService, SearchableUpdate, SqliteReindexJobStore,
    StoreError, StoredJob, ThrottleController, VersionToken,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub fn make_config(
    max_concurrency: u32,
    max_resources_per_page: u64,
    threshold: u32,
) -> ReindexJobConfig {
    ReindexJobConfig {
        max_concurrency,
        max_resources_per_page,
        heartbeat_timeout: Duration::from_secs(60),
        consecutive_failure_threshold: threshold,
    }
}

/// A queued job over `types` (resource type, fingerprint), reindexing one
/// parameter URL per type.
pub fn make_job(
    id: &str,
    types: &[(&str, &str)],
    max_concurrency: u32,
    max_resources_per_page: u64,
    threshold: u32,
) -> ReindexJobRecord {
    let hashes: BTreeMap<String, String> = types
        .iter()
        .map(|(t, h)| (t.to_string(), h.to_string()))
        .collect();
    let urls: BTreeSet<String> = types.iter().map(|(t, _)| param_url(t)).collect();
    ReindexJobRecord::new(
        id,
        hashes,
        urls,
        make_config(max_concurrency, max_resources_per_page, threshold),
        start_time(),
    )
}

pub fn param_url(resource_type: &str) -> String {
    format!("http://example.org/sp/{}-name", resource_type)
}

pub fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

// =============================================================================
// Search service
// =============================================================================

/// Search service over dense surrogate ids `1..=count` per type.
pub struct FakeSearch {
    counts: BTreeMap<String, u64>,
    queries: Mutex<Vec<SearchQuery>>,
    /// Entries returned per round-trip at most, below the requested maximum
    round_trip_cap: Option<u64>,
    /// Count queries that fail before one succeeds
    failing_counts: AtomicU32,
    /// Count queries answered without a total
    missing_totals: AtomicU32,
    /// Page queries answered with a continuation but no resources
    empty_continuations: AtomicU32,
    /// Ranges offered for every partitioned window instead of an even split
    proposed_ranges: Option<Vec<IdWindow>>,
}

impl FakeSearch {
    pub fn with_counts(counts: &[(&str, u64)]) -> Self {
        Self {
            counts: counts.iter().map(|(t, n)| (t.to_string(), *n)).collect(),
            queries: Mutex::new(Vec::new()),
            round_trip_cap: None,
            failing_counts: AtomicU32::new(0),
            missing_totals: AtomicU32::new(0),
            empty_continuations: AtomicU32::new(0),
            proposed_ranges: None,
        }
    }

    pub fn capped_at(mut self, cap: u64) -> Self {
        self.round_trip_cap = Some(cap);
        self
    }

    pub fn failing_counts(self, failures: u32) -> Self {
        self.failing_counts.store(failures, Ordering::SeqCst);
        self
    }

    pub fn missing_totals(self, times: u32) -> Self {
        self.missing_totals.store(times, Ordering::SeqCst);
        self
    }

    pub fn empty_continuations(self, times: u32) -> Self {
        self.empty_continuations.store(times, Ordering::SeqCst);
        self
    }

    pub fn proposing_ranges(mut self, ranges: Vec<IdWindow>) -> Self {
        self.proposed_ranges = Some(ranges);
        self
    }

    pub fn queries(&self) -> Vec<SearchQuery> {
        self.queries.lock().unwrap().clone()
    }

    pub fn count_queries(&self) -> Vec<SearchQuery> {
        self.queries().into_iter().filter(|q| q.count_only).collect()
    }

    pub fn page_queries(&self) -> Vec<SearchQuery> {
        self.queries().into_iter().filter(|q| !q.count_only).collect()
    }

    pub fn page_queries_for(&self, resource_type: &str) -> Vec<SearchQuery> {
        self.page_queries()
            .into_iter()
            .filter(|q| q.resource_type == resource_type)
            .collect()
    }
}

#[async_trait]
impl SearchService for FakeSearch {
    async fn query(&self, query: SearchQuery) -> Result<SearchResult> {
        self.queries.lock().unwrap().push(query.clone());
        let count = self.counts.get(&query.resource_type).copied().unwrap_or(0);

        if query.count_only {
            let remaining = self.failing_counts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_counts.store(remaining - 1, Ordering::SeqCst);
                bail!("count query for {} timed out", query.resource_type);
            }
            if take_one(&self.missing_totals) {
                return Ok(SearchResult::default());
            }
            return Ok(SearchResult {
                total_count: Some(count),
                ..Default::default()
            });
        }

        let window = query.window.ok_or_else(|| anyhow!("page query without window"))?;
        if take_one(&self.empty_continuations) {
            return Ok(SearchResult {
                continuation: Some(format!("after:{}", window.start_id - 1)),
                ..Default::default()
            });
        }
        let mut start = window.start_id;
        if let Some(cursor) = &query.continuation {
            let after: i64 = cursor
                .strip_prefix("after:")
                .and_then(|id| id.parse().ok())
                .ok_or_else(|| anyhow!("bad cursor {}", cursor))?;
            start = start.max(after + 1);
        }
        let end = window.end_id.min(count as i64 + 1);
        let limit = match self.round_trip_cap {
            Some(cap) => cap.min(query.max_results),
            None => query.max_results,
        } as i64;

        let entries: Vec<ResourceEntry> = (start..end)
            .take(limit as usize)
            .map(|id| ResourceEntry {
                resource_type: query.resource_type.clone(),
                surrogate_id: id,
                resource_id: format!("{}-{}", query.resource_type, id),
                payload: serde_json::json!({ "id": id }),
            })
            .collect();
        let continuation = match entries.last() {
            Some(last) if last.surrogate_id + 1 < end => Some(format!("after:{}", last.surrogate_id)),
            _ => None,
        };
        Ok(SearchResult {
            total_count: None,
            id_range: None,
            entries,
            continuation,
        })
    }

    async fn surrogate_id_ranges(
        &self,
        _resource_type: &str,
        _param_hash: &str,
        window: IdWindow,
        max_per_range: u64,
    ) -> Result<Vec<IdWindow>> {
        match &self.proposed_ranges {
            Some(ranges) => Ok(ranges.clone()),
            None => Ok(partition_window(window, max_per_range)),
        }
    }
}

/// Decrement `counter` if positive. Returns whether it was.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// =============================================================================
// Index updater
// =============================================================================

/// Index updater that records what it applied and can be told to misbehave.
pub struct FakeIndexUpdater {
    /// (resource type, surrogate id, fingerprint) per applied entry
    applied: Mutex<Vec<(String, i64, String)>>,
    marked: Mutex<Vec<Vec<String>>>,
    /// Apply calls that fail before one succeeds
    failures_left: AtomicU32,
    fail_always: AtomicBool,
    panic_once: AtomicBool,
    apply_delay: Mutex<Duration>,
    searchable: Mutex<Result<SearchableUpdate, String>>,
    in_flight: AtomicU32,
    peak_in_flight: AtomicU32,
}

impl FakeIndexUpdater {
    pub fn new() -> Self {
        Self {
            applied: Mutex::new(Vec::new()),
            marked: Mutex::new(Vec::new()),
            failures_left: AtomicU32::new(0),
            fail_always: AtomicBool::new(false),
            panic_once: AtomicBool::new(false),
            apply_delay: Mutex::new(Duration::ZERO),
            searchable: Mutex::new(Ok(SearchableUpdate::ok())),
            in_flight: AtomicU32::new(0),
            peak_in_flight: AtomicU32::new(0),
        }
    }

    pub fn failing_times(self, failures: u32) -> Self {
        self.failures_left.store(failures, Ordering::SeqCst);
        self
    }

    pub fn failing_always(self) -> Self {
        self.fail_always.store(true, Ordering::SeqCst);
        self
    }

    pub fn panicking_once(self) -> Self {
        self.panic_once.store(true, Ordering::SeqCst);
        self
    }

    pub fn slow(self, delay: Duration) -> Self {
        *self.apply_delay.lock().unwrap() = delay;
        self
    }

    pub fn searchable_result(self, result: Result<SearchableUpdate, String>) -> Self {
        *self.searchable.lock().unwrap() = result;
        self
    }

    pub fn applied(&self) -> Vec<(String, i64, String)> {
        self.applied.lock().unwrap().clone()
    }

    pub fn marked(&self) -> Vec<Vec<String>> {
        self.marked.lock().unwrap().clone()
    }

    /// Most apply calls ever running at once.
    pub fn peak_in_flight(&self) -> u32 {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IndexUpdater for FakeIndexUpdater {
    async fn apply(
        &self,
        entries: &[ResourceEntry],
        fingerprint_by_type: &BTreeMap<String, String>,
    ) -> Result<()> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = *self.apply_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.panic_once.swap(false, Ordering::SeqCst) {
            panic!("index writer crashed");
        }
        if self.fail_always.load(Ordering::SeqCst) {
            bail!("index store unavailable");
        }
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            bail!("index store unavailable");
        }

        let mut applied = self.applied.lock().unwrap();
        for entry in entries {
            let fingerprint = fingerprint_by_type
                .get(&entry.resource_type)
                .cloned()
                .unwrap_or_default();
            applied.push((entry.resource_type.clone(), entry.surrogate_id, fingerprint));
        }
        Ok(())
    }

    async fn mark_searchable(&self, param_urls: &[String]) -> Result<SearchableUpdate> {
        self.marked.lock().unwrap().push(param_urls.to_vec());
        self.searchable.lock().unwrap().clone().map_err(|e| anyhow!(e))
    }
}

// =============================================================================
// Throttles
// =============================================================================

/// Throttle whose every call fails.
#[derive(Default)]
pub struct FailingThrottle {
    calls: AtomicU32,
}

impl FailingThrottle {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ThrottleController for FailingThrottle {
    async fn next_delay(&self) -> Result<Duration> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        bail!("load metrics unavailable")
    }
}

/// Throttle that never delays and counts claims.
#[derive(Default)]
pub struct CountingThrottle {
    calls: AtomicU32,
    recorded_resources: Mutex<u64>,
}

impl CountingThrottle {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn recorded_resources(&self) -> u64 {
        *self.recorded_resources.lock().unwrap()
    }
}

#[async_trait]
impl ThrottleController for CountingThrottle {
    async fn next_delay(&self) -> Result<Duration> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Duration::ZERO)
    }

    async fn record_page(&self, resources: u64, _elapsed: Duration) {
        *self.recorded_resources.lock().unwrap() += resources;
    }
}

// =============================================================================
// Job store
// =============================================================================

/// Job store where another writer sneaks in before the next `conflicts`
/// updates, so they fail with a version conflict.
pub struct ConflictingStore {
    inner: SqliteReindexJobStore,
    conflicts: AtomicU32,
    injected: AtomicU32,
}

impl ConflictingStore {
    pub fn new(conflicts: u32) -> Self {
        Self {
            inner: SqliteReindexJobStore::in_memory().unwrap(),
            conflicts: AtomicU32::new(conflicts),
            injected: AtomicU32::new(0),
        }
    }

    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }
}

impl ReindexJobStore for ConflictingStore {
    fn create_job(&self, record: &ReindexJobRecord) -> Result<VersionToken, StoreError> {
        self.inner.create_job(record)
    }

    fn get_job(&self, id: &str) -> Result<Option<StoredJob>, StoreError> {
        self.inner.get_job(id)
    }

    fn update_job(
        &self,
        record: &ReindexJobRecord,
        expected: VersionToken,
    ) -> Result<VersionToken, StoreError> {
        let left = self.conflicts.load(Ordering::SeqCst);
        if left > 0 {
            self.conflicts.store(left - 1, Ordering::SeqCst);
            self.injected.fetch_add(1, Ordering::SeqCst);
            // the other writer re-commits what is stored, bumping the version
            if let Some(current) = self.inner.get_job(&record.id)? {
                self.inner.update_job(&current.record, current.version)?;
            }
            return Err(StoreError::VersionConflict {
                job_id: record.id.clone(),
                expected,
            });
        }
        self.inner.update_job(record, expected)
    }

    fn list_jobs(
        &self,
        status: Option<search_reindex::reindex::JobStatus>,
        limit: usize,
    ) -> Result<Vec<StoredJob>, StoreError> {
        self.inner.list_jobs(status, limit)
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub store: Arc<dyn ReindexJobStore>,
    pub search: Arc<FakeSearch>,
    pub updater: Arc<FakeIndexUpdater>,
    pub throttle: Arc<dyn ThrottleController>,
    pub clock: Arc<ManualClock>,
    pub notifier: ReindexNotifier,
    pub settings: OrchestratorSettings,
}

impl Harness {
    pub fn new(search: FakeSearch, updater: FakeIndexUpdater) -> Self {
        Self {
            store: Arc::new(SqliteReindexJobStore::in_memory().unwrap()),
            search: Arc::new(search),
            updater: Arc::new(updater),
            throttle: Arc::new(CountingThrottle::default()),
            clock: Arc::new(ManualClock::new(start_time())),
            notifier: ReindexNotifier::new(),
            settings: OrchestratorSettings {
                max_commit_retries: 5,
                poll_interval: POLL_INTERVAL,
            },
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ReindexJobStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_throttle(mut self, throttle: Arc<dyn ThrottleController>) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_updater(mut self, updater: FakeIndexUpdater) -> Self {
        self.updater = Arc::new(updater);
        self
    }

    pub fn orchestrator(&self) -> JobOrchestrator {
        JobOrchestrator::new(
            self.store.clone(),
            self.search.clone(),
            self.updater.clone(),
            self.throttle.clone(),
            self.clock.clone(),
            self.notifier.clone(),
            self.settings.clone(),
        )
    }

    /// Persist `record` and return its id.
    pub fn create(&self, record: ReindexJobRecord) -> String {
        self.store.create_job(&record).unwrap();
        record.id
    }

    pub async fn run(&self, job_id: &str) -> Result<StoredJob, ReindexError> {
        self.orchestrator()
            .run_job(job_id, CancellationToken::new())
            .await
    }

    pub fn load(&self, job_id: &str) -> ReindexJobRecord {
        self.store.get_job(job_id).unwrap().unwrap().record
    }
}
