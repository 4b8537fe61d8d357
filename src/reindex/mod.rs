//! Reindex job engine
//!
//! Recomputes search index entries after search parameter definitions change,
//! as a resumable background job split into bounded query pages.

mod collaborators;
mod error;
mod job_store;
mod models;
mod notifier;
mod orchestrator;
mod policy;
mod schema;
mod throttle;
mod worker;

pub use collaborators::{
    Clock, IndexUpdater, ManualClock, ResourceEntry, SearchQuery, SearchResult, SearchService,
    SearchableUpdate, SystemClock,
};
#[cfg(feature = "mock")]
pub use collaborators::{MockIndexUpdater, MockSearchService};
pub use error::{ReindexError, StoreError};
pub use job_store::{ReindexJobStore, SqliteReindexJobStore, StoredJob};
pub use models::*;
pub use notifier::{ReindexEvent, ReindexNotifier};
pub use orchestrator::{validate_config, JobOrchestrator, OrchestratorSettings};
pub use policy::{partition_window, ranges_fit_window, FailureOutcome, FailurePolicy};
pub use schema::REINDEX_JOB_VERSIONED_SCHEMAS;
#[cfg(feature = "mock")]
pub use throttle::MockThrottleController;
pub use throttle::{NoOpThrottle, ResourceRateThrottle, ResourceRateThrottleConfig, ThrottleController};
pub use worker::ReindexWorker;
