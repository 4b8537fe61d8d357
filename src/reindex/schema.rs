//! Database schema for reindex_jobs.db.
//!
//! Defines versioned schema migrations for the reindex job database.

use crate::sqlite_column;
use crate::sqlite_persistence::{ForeignKey, SqlType, Table, VersionedSchema};
use anyhow::Result;
use rusqlite::Connection;

// =============================================================================
// Jobs Table
// =============================================================================

const REINDEX_JOBS_TABLE_V0: Table = Table {
    name: "reindex_jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("version", &SqlType::Integer, non_null = true),
        sqlite_column!("resource_types", &SqlType::Text, non_null = true), // JSON array
        sqlite_column!("search_param_urls", &SqlType::Text, non_null = true), // JSON array
        sqlite_column!("param_hashes", &SqlType::Text, non_null = true), // JSON object
        sqlite_column!("next_page_seq", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "completed_page_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "total_resource_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("max_concurrency", &SqlType::Integer, non_null = true),
        sqlite_column!("max_resources_per_page", &SqlType::Integer, non_null = true),
        sqlite_column!("heartbeat_timeout_ms", &SqlType::Integer, non_null = true),
        sqlite_column!("failure_threshold", &SqlType::Integer, non_null = true),
        sqlite_column!("failure_reason", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("completed_at", &SqlType::Integer),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_reindex_jobs_status", "status, created_at")],
    unique_constraints: &[],
};

// =============================================================================
// Per-Resource-Type Progress Table
// =============================================================================

const JOB_FK: ForeignKey = ForeignKey {
    foreign_table: "reindex_jobs",
    foreign_column: "id",
    cascade_on_delete: true,
};

const REINDEX_RESOURCE_PROGRESS_TABLE_V0: Table = Table {
    name: "reindex_resource_progress",
    columns: &[
        sqlite_column!(
            "job_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&JOB_FK)
        ),
        sqlite_column!("resource_type", &SqlType::Text, non_null = true),
        sqlite_column!("total_count", &SqlType::Integer, non_null = true),
        sqlite_column!("window_start_id", &SqlType::Integer, non_null = true),
        sqlite_column!("window_end_id", &SqlType::Integer, non_null = true),
        sqlite_column!("cursor_id", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[&["job_id", "resource_type"]],
};

// =============================================================================
// Query Pages Table
// =============================================================================

const REINDEX_QUERY_PAGES_TABLE_V0: Table = Table {
    name: "reindex_query_pages",
    columns: &[
        sqlite_column!(
            "job_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&JOB_FK)
        ),
        sqlite_column!("seq", &SqlType::Integer, non_null = true),
        sqlite_column!("resource_type", &SqlType::Text, non_null = true),
        sqlite_column!("start_id", &SqlType::Integer, non_null = true),
        sqlite_column!("end_id", &SqlType::Integer, non_null = true),
        sqlite_column!("continuation_cursor", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("last_heartbeat", &SqlType::Integer),
        sqlite_column!(
            "failure_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[("idx_reindex_pages_status", "job_id, status")],
    unique_constraints: &[&["job_id", "seq"]],
};

// =============================================================================
// Version 1: last_error on query pages
// =============================================================================

const REINDEX_QUERY_PAGES_TABLE_V1: Table = Table {
    name: "reindex_query_pages",
    columns: &[
        sqlite_column!(
            "job_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&JOB_FK)
        ),
        sqlite_column!("seq", &SqlType::Integer, non_null = true),
        sqlite_column!("resource_type", &SqlType::Text, non_null = true),
        sqlite_column!("start_id", &SqlType::Integer, non_null = true),
        sqlite_column!("end_id", &SqlType::Integer, non_null = true),
        sqlite_column!("continuation_cursor", &SqlType::Text),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("last_heartbeat", &SqlType::Integer),
        sqlite_column!(
            "failure_count",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("last_error", &SqlType::Text),
    ],
    indices: &[("idx_reindex_pages_status", "job_id, status")],
    unique_constraints: &[&["job_id", "seq"]],
};

fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
    conn.execute(
        "ALTER TABLE reindex_query_pages ADD COLUMN last_error TEXT",
        [],
    )?;
    Ok(())
}

pub const REINDEX_JOB_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 0,
        tables: &[
            REINDEX_JOBS_TABLE_V0,
            REINDEX_RESOURCE_PROGRESS_TABLE_V0,
            REINDEX_QUERY_PAGES_TABLE_V0,
        ],
        migration: None,
    },
    VersionedSchema {
        version: 1,
        tables: &[
            REINDEX_JOBS_TABLE_V0,
            REINDEX_RESOURCE_PROGRESS_TABLE_V0,
            REINDEX_QUERY_PAGES_TABLE_V1,
        ],
        migration: Some(migrate_v0_to_v1),
    },
];
