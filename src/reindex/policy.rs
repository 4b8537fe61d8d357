//! Failure, staleness and partitioning rules of the reindex engine.
//!
//! Kept free of I/O so that every rule is a plain function over the job record.

use super::models::{IdWindow, PageStatus, QueryPage, ReindexJobConfig, ReindexJobRecord};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Outcome of recording a failed page attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Page goes back to Queued for another attempt
    Retry { failure_count: u32 },
    /// Threshold reached: the page and the job fail
    Permanent { failure_count: u32 },
}

/// Failure and heartbeat policy derived from a job's configuration.
#[derive(Debug, Clone)]
pub struct FailurePolicy {
    pub consecutive_failure_threshold: u32,
    pub heartbeat_timeout: Duration,
}

impl FailurePolicy {
    pub fn new(config: &ReindexJobConfig) -> Self {
        Self {
            consecutive_failure_threshold: config.consecutive_failure_threshold,
            heartbeat_timeout: config.heartbeat_timeout,
        }
    }

    /// Classify a failure given the page's failure count *after* the increment.
    ///
    /// Reaching the threshold is terminal; the count never goes past it.
    pub fn classify(&self, failure_count: u32) -> FailureOutcome {
        if failure_count >= self.consecutive_failure_threshold {
            FailureOutcome::Permanent { failure_count }
        } else {
            FailureOutcome::Retry { failure_count }
        }
    }

    /// A Running page whose last heartbeat is older than the timeout.
    pub fn is_stale(&self, page: &QueryPage, now: DateTime<Utc>) -> bool {
        if page.status != PageStatus::Running {
            return false;
        }
        match page.last_heartbeat {
            Some(heartbeat) => match (now - heartbeat).to_std() {
                Ok(age) => age > self.heartbeat_timeout,
                // heartbeat in the future (clock skew between runs)
                Err(_) => false,
            },
            None => true,
        }
    }

    /// How often a live worker refreshes the heartbeat of the page it runs.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.heartbeat_timeout / 3).max(Duration::from_millis(10))
    }

    /// Demote every stale Running page back to Queued without touching its
    /// failure count. Returns the sequence numbers of demoted pages.
    pub fn demote_stale_pages(
        &self,
        record: &mut ReindexJobRecord,
        now: DateTime<Utc>,
    ) -> Vec<i64> {
        let mut demoted = Vec::new();
        for page in record.query_queue.iter_mut() {
            if self.is_stale(page, now) {
                page.status = PageStatus::Queued;
                page.last_heartbeat = None;
                demoted.push(page.seq);
            }
        }
        demoted
    }
}

/// Split `window` into consecutive spans of at most `max_len` surrogate ids,
/// in ascending order.
pub fn partition_window(window: IdWindow, max_len: u64) -> Vec<IdWindow> {
    if window.is_empty() || max_len == 0 {
        return Vec::new();
    }
    let step = i64::try_from(max_len).unwrap_or(i64::MAX);
    let mut pages = Vec::new();
    let mut start = window.start_id;
    while start < window.end_id {
        let end = start.saturating_add(step).min(window.end_id);
        pages.push(IdWindow::new(start, end));
        start = end;
    }
    pages
}

/// Check that ranges proposed for a window cover it exactly: non-empty,
/// ascending and contiguous from its start to its end.
pub fn ranges_fit_window(window: IdWindow, ranges: &[IdWindow]) -> bool {
    if window.is_empty() {
        return ranges.is_empty();
    }
    let mut previous_end = window.start_id;
    for range in ranges {
        if range.is_empty() || range.start_id != previous_end || range.end_id > window.end_id {
            return false;
        }
        previous_end = range.end_id;
    }
    previous_end == window.end_id
}
