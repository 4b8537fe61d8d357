use super::models::{JobStatus, VersionToken};
use thiserror::Error;

/// Errors raised by a [`ReindexJobStore`](super::ReindexJobStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("version conflict on job {job_id}: expected {expected}")]
    VersionConflict {
        job_id: String,
        expected: VersionToken,
    },

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("schema error: {0}")]
    Schema(#[from] anyhow::Error),

    #[error("corrupt job record {job_id}: {detail}")]
    Corrupt { job_id: String, detail: String },
}

/// Errors surfaced by the orchestrator to its caller.
///
/// Page-level failures never show up here: they are folded into the page's
/// failure count and, past the threshold, into a `Failed` job.
#[derive(Debug, Error)]
pub enum ReindexError {
    #[error("invalid job configuration: {0}")]
    InvalidConfig(String),

    #[error("job {job_id} cannot run from status {status}")]
    NotRunnable { job_id: String, status: JobStatus },

    #[error("job {job_id} kept conflicting after {attempts} commit attempts")]
    CommitConflict { job_id: String, attempts: u32 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("reindex run was cancelled")]
    Cancelled,
}

impl ReindexError {
    /// Whether running the job again later may succeed. Durable state is
    /// whatever was last committed, so a retry resumes from there.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReindexError::CommitConflict { .. } | ReindexError::Cancelled
        )
    }
}
