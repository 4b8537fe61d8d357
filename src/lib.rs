//! Search Reindex Library
//!
//! Resumable background reindexing of search index entries after search
//! parameter definitions change.

pub mod config;
pub mod metrics;
pub mod reindex;
pub mod resource_store;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use reindex::{
    JobOrchestrator, JobStatus, ReindexJobRecord, ReindexJobStore, ReindexWorker,
    SqliteReindexJobStore,
};
pub use resource_store::{SearchParamDefinition, SqliteResourceStore};
