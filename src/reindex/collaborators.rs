//! Contracts of the services the reindex engine drives.
//!
//! The engine never touches the resource store directly: it counts and pages
//! through resources with a [`SearchService`], writes recomputed index entries
//! through an [`IndexUpdater`] and reads time from a [`Clock`].

use super::models::IdWindow;
use super::policy::partition_window;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// A single query against one resource type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub resource_type: String,
    /// Resources already carrying this fingerprint are skipped
    pub param_hash: String,
    /// Discovery mode: only `total_count` and `id_range` are filled in
    pub count_only: bool,
    /// Restricts the query to a surrogate id window
    pub window: Option<IdWindow>,
    /// Resume point returned by a previous partial result
    pub continuation: Option<String>,
    /// Upper bound on entries returned by one round-trip
    pub max_results: u64,
}

impl SearchQuery {
    pub fn count(resource_type: &str, param_hash: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            param_hash: param_hash.to_string(),
            count_only: true,
            window: None,
            continuation: None,
            max_results: 0,
        }
    }

    pub fn page(
        resource_type: &str,
        param_hash: &str,
        window: IdWindow,
        continuation: Option<String>,
        max_results: u64,
    ) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            param_hash: param_hash.to_string(),
            count_only: false,
            window: Some(window),
            continuation,
            max_results,
        }
    }
}

/// A resource handed to the index updater.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEntry {
    pub resource_type: String,
    pub surrogate_id: i64,
    pub resource_id: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResult {
    /// Number of matching resources (count-only queries)
    pub total_count: Option<u64>,
    /// Smallest and one-past-largest surrogate id of the matching resources
    pub id_range: Option<IdWindow>,
    pub entries: Vec<ResourceEntry>,
    /// Set when the window was only partially consumed
    pub continuation: Option<String>,
}

/// Outcome of flipping search parameters to searchable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchableUpdate {
    pub success: bool,
    pub error_detail: Option<String>,
}

impl SearchableUpdate {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            error_detail: Some(detail.into()),
        }
    }
}

/// Paginated query access to the resource store.
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait SearchService: Send + Sync {
    /// Execute a count-only or result-page query.
    async fn query(&self, query: SearchQuery) -> Result<SearchResult>;

    /// Split `window` into consecutive ranges holding at most `max_per_range`
    /// resources that still need reindexing under `param_hash`.
    ///
    /// Stores that can count cheaply should override this. The default splits
    /// the window into spans of `max_per_range` surrogate ids.
    async fn surrogate_id_ranges(
        &self,
        _resource_type: &str,
        _param_hash: &str,
        window: IdWindow,
        max_per_range: u64,
    ) -> Result<Vec<IdWindow>> {
        Ok(partition_window(window, max_per_range))
    }
}

/// Applies recomputed search index entries.
#[cfg_attr(feature = "mock", mockall::automock)]
#[async_trait]
pub trait IndexUpdater: Send + Sync {
    /// Recompute and commit index entries for `entries`, stamping each
    /// resource with the fingerprint of its type. Must be idempotent.
    async fn apply(
        &self,
        entries: &[ResourceEntry],
        fingerprint_by_type: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Mark search parameters searchable once every type using them is done.
    async fn mark_searchable(&self, param_urls: &[String]) -> Result<SearchableUpdate>;
}

/// Source of "now" for heartbeats and staleness checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SpanOnlySearch;

    #[async_trait]
    impl SearchService for SpanOnlySearch {
        async fn query(&self, _query: SearchQuery) -> Result<SearchResult> {
            Ok(SearchResult::default())
        }
    }

    #[tokio::test]
    async fn test_default_ranges_split_by_id_span() {
        let search = SpanOnlySearch;
        let ranges = search
            .surrogate_id_ranges("Patient", "h1", IdWindow::new(1, 26), 10)
            .await
            .unwrap();
        assert_eq!(
            ranges,
            vec![
                IdWindow::new(1, 11),
                IdWindow::new(11, 21),
                IdWindow::new(21, 26)
            ]
        );
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_query_constructors() {
        let count = SearchQuery::count("Patient", "h1");
        assert!(count.count_only);
        assert!(count.window.is_none());

        let page = SearchQuery::page("Patient", "h1", IdWindow::new(1, 11), None, 10);
        assert!(!page.count_only);
        assert_eq!(page.window, Some(IdWindow::new(1, 11)));
        assert_eq!(page.max_results, 10);
    }
}
