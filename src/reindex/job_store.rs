//! Reindex job storage and persistence.
//!
//! Provides SQLite-backed storage for reindex job records with
//! version-token optimistic concurrency.

use super::error::StoreError;
use super::models::*;
use super::schema::REINDEX_JOB_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::{open_in_memory, open_versioned};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// A job record together with the version token it was read at.
#[derive(Debug, Clone)]
pub struct StoredJob {
    pub record: ReindexJobRecord,
    pub version: VersionToken,
}

/// Durable read/update of reindex job records.
///
/// Every update carries the version token the caller last observed; a
/// mismatch means someone else committed in between and is reported as
/// [`StoreError::VersionConflict`].
pub trait ReindexJobStore: Send + Sync {
    /// Persist a new job record and return its initial version token.
    fn create_job(&self, record: &ReindexJobRecord) -> Result<VersionToken, StoreError>;

    /// Load a job record and its current version token.
    fn get_job(&self, id: &str) -> Result<Option<StoredJob>, StoreError>;

    /// Replace a job record if its version still equals `expected`.
    fn update_job(
        &self,
        record: &ReindexJobRecord,
        expected: VersionToken,
    ) -> Result<VersionToken, StoreError>;

    /// List jobs, oldest first, optionally filtered by status.
    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<StoredJob>, StoreError>;
}

/// SQLite-backed implementation of [`ReindexJobStore`].
pub struct SqliteReindexJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteReindexJobStore {
    /// Open an existing job database or create a new one with the current schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let conn = open_versioned(db_path, REINDEX_JOB_VERSIONED_SCHEMAS, "reindex job")?;
        Ok(SqliteReindexJobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = open_in_memory(REINDEX_JOB_VERSIONED_SCHEMAS)?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        Ok(SqliteReindexJobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert_children(tx: &Transaction, record: &ReindexJobRecord) -> Result<(), StoreError> {
        let mut progress_stmt = tx.prepare_cached(
            r#"INSERT INTO reindex_resource_progress (
                job_id, resource_type, total_count, window_start_id, window_end_id, cursor_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
        )?;
        for (resource_type, progress) in &record.progress_by_resource_type {
            progress_stmt.execute(params![
                record.id,
                resource_type,
                progress.total_count as i64,
                progress.window_start_id,
                progress.window_end_id,
                progress.cursor_id,
            ])?;
        }

        let mut page_stmt = tx.prepare_cached(
            r#"INSERT INTO reindex_query_pages (
                job_id, seq, resource_type, start_id, end_id, continuation_cursor,
                status, last_heartbeat, failure_count, last_error
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
        )?;
        for page in &record.query_queue {
            page_stmt.execute(params![
                record.id,
                page.seq,
                page.resource_type,
                page.start_id,
                page.end_id,
                page.continuation_cursor,
                page.status.as_db_str(),
                page.last_heartbeat.map(|t| t.timestamp_millis()),
                page.failure_count,
                page.last_error,
            ])?;
        }
        Ok(())
    }

    fn delete_children(tx: &Transaction, job_id: &str) -> Result<(), StoreError> {
        tx.execute(
            "DELETE FROM reindex_resource_progress WHERE job_id = ?1",
            [job_id],
        )?;
        tx.execute("DELETE FROM reindex_query_pages WHERE job_id = ?1", [job_id])?;
        Ok(())
    }

    /// Columns of `reindex_jobs` as read back by [`Self::row_to_job`].
    const JOB_COLUMNS: &'static str = r#"id, status, version, resource_types, search_param_urls,
        param_hashes, next_page_seq, completed_page_count, total_resource_count,
        max_concurrency, max_resources_per_page, heartbeat_timeout_ms, failure_threshold,
        failure_reason, created_at, started_at, completed_at, updated_at"#;

    /// Helper to convert a database row to a job record without its children.
    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<JobRow> {
        Ok(JobRow {
            id: row.get("id")?,
            status: row.get("status")?,
            version: row.get("version")?,
            resource_types: row.get("resource_types")?,
            search_param_urls: row.get("search_param_urls")?,
            param_hashes: row.get("param_hashes")?,
            next_page_seq: row.get("next_page_seq")?,
            completed_page_count: row.get("completed_page_count")?,
            total_resource_count: row.get("total_resource_count")?,
            max_concurrency: row.get("max_concurrency")?,
            max_resources_per_page: row.get("max_resources_per_page")?,
            heartbeat_timeout_ms: row.get("heartbeat_timeout_ms")?,
            failure_threshold: row.get("failure_threshold")?,
            failure_reason: row.get("failure_reason")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn load_children(conn: &Connection, row: JobRow) -> Result<StoredJob, StoreError> {
        let job_id = row.id.clone();
        let corrupt = |detail: String| StoreError::Corrupt {
            job_id: job_id.clone(),
            detail,
        };

        let mut progress_by_resource_type = BTreeMap::new();
        let mut stmt = conn.prepare_cached(
            r#"SELECT resource_type, total_count, window_start_id, window_end_id, cursor_id
               FROM reindex_resource_progress WHERE job_id = ?1"#,
        )?;
        let rows = stmt.query_map([&row.id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                ResourceTypeProgress {
                    total_count: r.get::<_, i64>(1)? as u64,
                    window_start_id: r.get(2)?,
                    window_end_id: r.get(3)?,
                    cursor_id: r.get(4)?,
                },
            ))
        })?;
        for entry in rows {
            let (resource_type, progress) = entry?;
            progress_by_resource_type.insert(resource_type, progress);
        }

        let mut query_queue = Vec::new();
        let mut stmt = conn.prepare_cached(
            r#"SELECT seq, resource_type, start_id, end_id, continuation_cursor,
                      status, last_heartbeat, failure_count, last_error
               FROM reindex_query_pages WHERE job_id = ?1 ORDER BY seq ASC"#,
        )?;
        let rows = stmt.query_map([&row.id], |r| {
            Ok((
                QueryPage {
                    seq: r.get(0)?,
                    resource_type: r.get(1)?,
                    start_id: r.get(2)?,
                    end_id: r.get(3)?,
                    continuation_cursor: r.get(4)?,
                    status: PageStatus::Queued,
                    last_heartbeat: None,
                    failure_count: r.get(7)?,
                    last_error: r.get(8)?,
                },
                r.get::<_, String>(5)?,
                r.get::<_, Option<i64>>(6)?,
            ))
        })?;
        for entry in rows {
            let (mut page, status, heartbeat) = entry?;
            page.status = PageStatus::from_db_str(&status)
                .ok_or_else(|| corrupt(format!("page {} has status {}", page.seq, status)))?;
            page.last_heartbeat = heartbeat.map(from_millis).transpose().map_err(corrupt)?;
            query_queue.push(page);
        }

        let status = JobStatus::from_db_str(&row.status)
            .ok_or_else(|| corrupt(format!("unknown status {}", row.status)))?;
        let record = ReindexJobRecord {
            id: row.id,
            status,
            resource_types_in_scope: serde_json::from_str::<BTreeSet<String>>(
                &row.resource_types,
            )?,
            search_param_urls_in_scope: serde_json::from_str(&row.search_param_urls)?,
            param_hash_by_resource_type: serde_json::from_str(&row.param_hashes)?,
            progress_by_resource_type,
            query_queue,
            next_page_seq: row.next_page_seq,
            completed_page_count: row.completed_page_count as u64,
            total_resource_count: row.total_resource_count as u64,
            config: ReindexJobConfig {
                max_concurrency: row.max_concurrency,
                max_resources_per_page: row.max_resources_per_page as u64,
                heartbeat_timeout: Duration::from_millis(row.heartbeat_timeout_ms as u64),
                consecutive_failure_threshold: row.failure_threshold,
            },
            failure_reason: row.failure_reason,
            created_at: from_millis(row.created_at).map_err(corrupt)?,
            started_at: row.started_at.map(from_millis).transpose().map_err(corrupt)?,
            completed_at: row
                .completed_at
                .map(from_millis)
                .transpose()
                .map_err(corrupt)?,
            updated_at: from_millis(row.updated_at).map_err(corrupt)?,
        };
        Ok(StoredJob {
            record,
            version: VersionToken::new(row.version),
        })
    }
}

/// Raw `reindex_jobs` row.
struct JobRow {
    id: String,
    status: String,
    version: i64,
    resource_types: String,
    search_param_urls: String,
    param_hashes: String,
    next_page_seq: i64,
    completed_page_count: i64,
    total_resource_count: i64,
    max_concurrency: u32,
    max_resources_per_page: i64,
    heartbeat_timeout_ms: i64,
    failure_threshold: u32,
    failure_reason: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    updated_at: i64,
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, String> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| format!("bad timestamp {}", millis))
}

impl ReindexJobStore for SqliteReindexJobStore {
    fn create_job(&self, record: &ReindexJobRecord) -> Result<VersionToken, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM reindex_jobs WHERE id = ?1",
                [&record.id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Err(StoreError::AlreadyExists(record.id.clone()));
        }

        tx.execute(
            r#"INSERT INTO reindex_jobs (
                id, status, version, resource_types, search_param_urls, param_hashes,
                next_page_seq, completed_page_count, total_resource_count,
                max_concurrency, max_resources_per_page, heartbeat_timeout_ms,
                failure_threshold, failure_reason, created_at, started_at,
                completed_at, updated_at
            ) VALUES (
                ?1, ?2, 1, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17
            )"#,
            params![
                record.id,
                record.status.as_db_str(),
                serde_json::to_string(&record.resource_types_in_scope)?,
                serde_json::to_string(&record.search_param_urls_in_scope)?,
                serde_json::to_string(&record.param_hash_by_resource_type)?,
                record.next_page_seq,
                record.completed_page_count as i64,
                record.total_resource_count as i64,
                record.config.max_concurrency,
                record.config.max_resources_per_page as i64,
                record.config.heartbeat_timeout.as_millis() as i64,
                record.config.consecutive_failure_threshold,
                record.failure_reason,
                record.created_at.timestamp_millis(),
                record.started_at.map(|t| t.timestamp_millis()),
                record.completed_at.map(|t| t.timestamp_millis()),
                record.updated_at.timestamp_millis(),
            ],
        )?;
        Self::insert_children(&tx, record)?;
        tx.commit()?;

        debug!("Created reindex job {}", record.id);
        Ok(VersionToken::new(1))
    }

    fn get_job(&self, id: &str) -> Result<Option<StoredJob>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM reindex_jobs WHERE id = ?1", Self::JOB_COLUMNS),
                [id],
                Self::row_to_job,
            )
            .optional()?;
        match row {
            Some(row) => Ok(Some(Self::load_children(&conn, row)?)),
            None => Ok(None),
        }
    }

    fn update_job(
        &self,
        record: &ReindexJobRecord,
        expected: VersionToken,
    ) -> Result<VersionToken, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let updated = tx.execute(
            r#"UPDATE reindex_jobs SET
                status = ?3, version = version + 1, resource_types = ?4,
                search_param_urls = ?5, param_hashes = ?6, next_page_seq = ?7,
                completed_page_count = ?8, total_resource_count = ?9,
                max_concurrency = ?10, max_resources_per_page = ?11,
                heartbeat_timeout_ms = ?12, failure_threshold = ?13,
                failure_reason = ?14, started_at = ?15, completed_at = ?16,
                updated_at = ?17
               WHERE id = ?1 AND version = ?2"#,
            params![
                record.id,
                expected.value(),
                record.status.as_db_str(),
                serde_json::to_string(&record.resource_types_in_scope)?,
                serde_json::to_string(&record.search_param_urls_in_scope)?,
                serde_json::to_string(&record.param_hash_by_resource_type)?,
                record.next_page_seq,
                record.completed_page_count as i64,
                record.total_resource_count as i64,
                record.config.max_concurrency,
                record.config.max_resources_per_page as i64,
                record.config.heartbeat_timeout.as_millis() as i64,
                record.config.consecutive_failure_threshold,
                record.failure_reason,
                record.started_at.map(|t| t.timestamp_millis()),
                record.completed_at.map(|t| t.timestamp_millis()),
                record.updated_at.timestamp_millis(),
            ],
        )?;

        if updated == 0 {
            let exists = tx
                .query_row(
                    "SELECT 1 FROM reindex_jobs WHERE id = ?1",
                    [&record.id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            return Err(if exists {
                StoreError::VersionConflict {
                    job_id: record.id.clone(),
                    expected,
                }
            } else {
                StoreError::NotFound(record.id.clone())
            });
        }

        Self::delete_children(&tx, &record.id)?;
        Self::insert_children(&tx, record)?;
        tx.commit()?;

        Ok(VersionToken::new(expected.value() + 1))
    }

    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<StoredJob>, StoreError> {
        let conn = self.lock();
        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM reindex_jobs WHERE status = ?1 ORDER BY created_at ASC, id ASC LIMIT ?2",
                    Self::JOB_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![status.as_db_str(), limit as i64], Self::row_to_job)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM reindex_jobs ORDER BY created_at ASC, id ASC LIMIT ?1",
                    Self::JOB_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(params![limit as i64], Self::row_to_job)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };

        rows.into_iter()
            .map(|row| Self::load_children(&conn, row))
            .collect()
    }
}
