//! Data models for the reindex engine.
//!
//! Defines the durable job record, its query-page queue, per-resource-type
//! progress and the job configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Status of a reindex job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed, // terminal
    Failed,    // terminal
    Canceled,  // terminal
}

impl JobStatus {
    /// Returns true if the job can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(JobStatus::Queued),
            "RUNNING" => Some(JobStatus::Running),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            "CANCELED" => Some(JobStatus::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Status of a single query page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageStatus {
    Queued,
    Running,
    Completed, // terminal
    Failed,    // terminal, fails the job
}

impl PageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PageStatus::Completed | PageStatus::Failed)
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            PageStatus::Queued => "QUEUED",
            PageStatus::Running => "RUNNING",
            PageStatus::Completed => "COMPLETED",
            PageStatus::Failed => "FAILED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(PageStatus::Queued),
            "RUNNING" => Some(PageStatus::Running),
            "COMPLETED" => Some(PageStatus::Completed),
            "FAILED" => Some(PageStatus::Failed),
            _ => None,
        }
    }
}

/// Opaque optimistic-concurrency token of a persisted job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionToken(i64);

impl VersionToken {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Half-open surrogate id window `[start_id, end_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdWindow {
    pub start_id: i64,
    pub end_id: i64,
}

impl IdWindow {
    pub fn new(start_id: i64, end_id: i64) -> Self {
        Self { start_id, end_id }
    }

    pub fn is_empty(&self) -> bool {
        self.end_id <= self.start_id
    }

    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            (self.end_id - self.start_id) as u64
        }
    }

    pub fn overlaps(&self, other: &IdWindow) -> bool {
        self.start_id < other.end_id && other.start_id < self.end_id
    }
}

/// Per-resource-type discovery result and page window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTypeProgress {
    /// Number of resources discovered as needing reindex
    pub total_count: u64,
    /// First surrogate id of the window (inclusive)
    pub window_start_id: i64,
    /// End of the window (exclusive, one past the highest discovered id)
    pub window_end_id: i64,
    /// Everything below this id has been reindexed by a completed page
    pub cursor_id: i64,
}

impl ResourceTypeProgress {
    pub fn new(total_count: u64, window_start_id: i64, window_end_id: i64) -> Self {
        Self {
            total_count,
            window_start_id,
            window_end_id,
            cursor_id: window_start_id,
        }
    }

    pub fn window(&self) -> IdWindow {
        IdWindow::new(self.window_start_id, self.window_end_id)
    }

    /// True once the cursor has moved past the whole window.
    pub fn is_exhausted(&self) -> bool {
        self.cursor_id >= self.window_end_id
    }
}

/// One bounded unit of work: a surrogate id window of a single resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPage {
    /// Position in the queue. Strictly increasing, never reused.
    pub seq: i64,
    pub resource_type: String,
    pub start_id: i64,
    pub end_id: i64,
    /// Store-issued cursor for resuming inside the window
    pub continuation_cursor: Option<String>,
    pub status: PageStatus,
    /// Last liveness signal while Running
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Consecutive failures of this page
    pub failure_count: u32,
    /// Most recent failure message, kept for operators
    pub last_error: Option<String>,
}

impl QueryPage {
    pub fn new(seq: i64, resource_type: impl Into<String>, window: IdWindow) -> Self {
        Self {
            seq,
            resource_type: resource_type.into(),
            start_id: window.start_id,
            end_id: window.end_id,
            continuation_cursor: None,
            status: PageStatus::Queued,
            last_heartbeat: None,
            failure_count: 0,
            last_error: None,
        }
    }

    /// Identity of the page, independent of its queue position.
    pub fn key(&self) -> PageKey {
        PageKey {
            resource_type: self.resource_type.clone(),
            start_id: self.start_id,
        }
    }

    pub fn window(&self) -> IdWindow {
        IdWindow::new(self.start_id, self.end_id)
    }
}

/// Derived identity of a query page: resource type plus window start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    pub resource_type: String,
    pub start_id: i64,
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.resource_type, self.start_id)
    }
}

/// Caller-supplied execution limits of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexJobConfig {
    pub max_concurrency: u32,
    pub max_resources_per_page: u64,
    #[serde(with = "duration_millis")]
    pub heartbeat_timeout: Duration,
    pub consecutive_failure_threshold: u32,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Durable state of one reindex run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReindexJobRecord {
    pub id: String,
    pub status: JobStatus,
    /// Resource types discovered as needing reindex
    pub resource_types_in_scope: BTreeSet<String>,
    /// Search parameter URLs being reindexed
    pub search_param_urls_in_scope: BTreeSet<String>,
    /// Fingerprint of the parameter set currently applied to each resource type
    pub param_hash_by_resource_type: BTreeMap<String, String>,
    pub progress_by_resource_type: BTreeMap<String, ResourceTypeProgress>,
    /// Query pages in discovery order
    pub query_queue: Vec<QueryPage>,
    /// Sequence number the next enqueued page will get
    pub next_page_seq: i64,
    pub completed_page_count: u64,
    pub total_resource_count: u64,
    pub config: ReindexJobConfig,
    /// Why the job failed, for operators
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Time of the last committed transition
    pub updated_at: DateTime<Utc>,
}

impl ReindexJobRecord {
    /// Create a new queued job.
    ///
    /// `param_hash_by_resource_type` holds the fingerprint every in-scope type
    /// should carry once reindexed; its keys are the resource types in scope.
    pub fn new(
        id: impl Into<String>,
        param_hash_by_resource_type: BTreeMap<String, String>,
        search_param_urls: BTreeSet<String>,
        config: ReindexJobConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Queued,
            resource_types_in_scope: param_hash_by_resource_type.keys().cloned().collect(),
            search_param_urls_in_scope: search_param_urls,
            param_hash_by_resource_type,
            progress_by_resource_type: BTreeMap::new(),
            query_queue: Vec::new(),
            next_page_seq: 1,
            completed_page_count: 0,
            total_resource_count: 0,
            config,
            failure_reason: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn page(&self, seq: i64) -> Option<&QueryPage> {
        self.query_queue.iter().find(|p| p.seq == seq)
    }

    pub fn page_mut(&mut self, seq: i64) -> Option<&mut QueryPage> {
        self.query_queue.iter_mut().find(|p| p.seq == seq)
    }

    /// Append a page for `window`, assigning it the next sequence number.
    pub fn enqueue_page(&mut self, resource_type: &str, window: IdWindow) -> i64 {
        let seq = self.next_page_seq;
        self.next_page_seq += 1;
        self.query_queue
            .push(QueryPage::new(seq, resource_type, window));
        seq
    }

    pub fn has_pages_for(&self, resource_type: &str) -> bool {
        self.query_queue
            .iter()
            .any(|p| p.resource_type == resource_type)
    }

    pub fn count_pages(&self, status: PageStatus) -> usize {
        self.query_queue
            .iter()
            .filter(|p| p.status == status)
            .count()
    }

    /// Pages still to be executed by someone (Queued or Running).
    pub fn outstanding_pages(&self) -> usize {
        self.query_queue
            .iter()
            .filter(|p| !p.status.is_terminal())
            .count()
    }

    /// Sum of discovered totals across resource types.
    pub fn discovered_total(&self) -> u64 {
        self.progress_by_resource_type
            .values()
            .map(|p| p.total_count)
            .sum()
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            status: self.status,
            resource_types: self.resource_types_in_scope.len(),
            pages_total: self.query_queue.len(),
            pages_completed: self.completed_page_count,
            total_resource_count: self.total_resource_count,
            failure_reason: self.failure_reason.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Condensed view of a job, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub status: JobStatus,
    pub resource_types: usize,
    pub pages_total: usize,
    pub pages_completed: u64,
    pub total_resource_count: u64,
    pub failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}
