//! Job outcome notifications.
//!
//! Emits an event after a job reaches a terminal status. Delivery is
//! fire-and-forget: nobody listening is not an error, and a slow listener
//! only loses events (it never blocks the engine).

use super::models::{JobStatus, ReindexJobRecord};
use tokio::sync::broadcast;
use tracing::{debug, info};

const CHANNEL_CAPACITY: usize = 64;

/// Terminal outcome of a reindex job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReindexEvent {
    JobCompleted {
        job_id: String,
        completed_page_count: u64,
        total_resource_count: u64,
        search_param_urls: Vec<String>,
    },
    JobFailed {
        job_id: String,
        reason: String,
    },
    JobCanceled {
        job_id: String,
    },
}

impl ReindexEvent {
    /// Build the event for a record in a terminal status.
    pub fn from_record(record: &ReindexJobRecord) -> Option<Self> {
        match record.status {
            JobStatus::Completed => Some(ReindexEvent::JobCompleted {
                job_id: record.id.clone(),
                completed_page_count: record.completed_page_count,
                total_resource_count: record.total_resource_count,
                search_param_urls: record.search_param_urls_in_scope.iter().cloned().collect(),
            }),
            JobStatus::Failed => Some(ReindexEvent::JobFailed {
                job_id: record.id.clone(),
                reason: record
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            }),
            JobStatus::Canceled => Some(ReindexEvent::JobCanceled {
                job_id: record.id.clone(),
            }),
            JobStatus::Queued | JobStatus::Running => None,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            ReindexEvent::JobCompleted { job_id, .. }
            | ReindexEvent::JobFailed { job_id, .. }
            | ReindexEvent::JobCanceled { job_id } => job_id,
        }
    }
}

/// Broadcasts [`ReindexEvent`]s to any number of observers.
#[derive(Clone)]
pub struct ReindexNotifier {
    event_tx: broadcast::Sender<ReindexEvent>,
}

impl ReindexNotifier {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { event_tx }
    }

    /// Subscribe to job outcome events.
    pub fn subscribe(&self) -> broadcast::Receiver<ReindexEvent> {
        self.event_tx.subscribe()
    }

    /// Publish the outcome of a finished job.
    pub fn notify(&self, record: &ReindexJobRecord) {
        let Some(event) = ReindexEvent::from_record(record) else {
            return;
        };
        info!("Reindex job {} finished with status {}", record.id, record.status);
        if self.event_tx.send(event).is_err() {
            debug!("No subscribers for reindex job {} outcome", record.id);
        }
    }
}

impl Default for ReindexNotifier {
    fn default() -> Self {
        Self::new()
    }
}
