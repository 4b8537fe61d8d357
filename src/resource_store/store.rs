//! SQLite-backed resource store.
//!
//! Holds resources, search parameter definitions and the derived search
//! index, and exposes them to the reindex engine as a [`SearchService`] and
//! an [`IndexUpdater`].

use super::schema::RESOURCE_STORE_VERSIONED_SCHEMAS;
use crate::reindex::{
    IdWindow, IndexUpdater, ResourceEntry, SearchQuery, SearchResult, SearchService,
    SearchableUpdate,
};
use crate::sqlite_persistence::{open_in_memory, open_versioned};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// A search parameter definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParamDefinition {
    pub url: String,
    pub resource_type: String,
    pub code: String,
    /// JSON pointer (RFC 6901) selecting the indexed value(s) in a payload
    pub expression: String,
}

pub struct SqliteResourceStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteResourceStore {
    /// Open an existing resource database or create a new one.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path, RESOURCE_STORE_VERSIONED_SCHEMAS, "resource")?;
        Ok(SqliteResourceStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store.
    pub fn in_memory() -> Result<Self> {
        let conn = open_in_memory(RESOURCE_STORE_VERSIONED_SCHEMAS)?;
        Ok(SqliteResourceStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    // === Resources ===

    /// Insert or replace a resource. A changed payload clears its applied
    /// fingerprint so the next reindex picks it up. Returns the surrogate id.
    pub fn put_resource(&self, resource_type: &str, resource_id: &str, payload: &Value) -> Result<i64> {
        let conn = self.lock();
        let payload = serde_json::to_string(payload)?;
        conn.execute(
            r#"INSERT INTO resources (resource_type, resource_id, payload, param_hash, updated_at)
               VALUES (?1, ?2, ?3, NULL, ?4)
               ON CONFLICT(resource_type, resource_id) DO UPDATE SET
                   payload = excluded.payload,
                   param_hash = CASE WHEN payload = excluded.payload THEN param_hash ELSE NULL END,
                   updated_at = excluded.updated_at"#,
            params![resource_type, resource_id, payload, Self::now_millis()],
        )?;
        let surrogate_id = conn.query_row(
            "SELECT surrogate_id FROM resources WHERE resource_type = ?1 AND resource_id = ?2",
            params![resource_type, resource_id],
            |row| row.get(0),
        )?;
        Ok(surrogate_id)
    }

    /// Fingerprint a resource was last indexed with, if any.
    pub fn applied_fingerprint(&self, surrogate_id: i64) -> Result<Option<String>> {
        let conn = self.lock();
        let hash = conn
            .query_row(
                "SELECT param_hash FROM resources WHERE surrogate_id = ?1",
                [surrogate_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
        Ok(hash)
    }

    /// Indexed `(param_url, value)` pairs of a resource.
    pub fn index_entries(&self, surrogate_id: i64) -> Result<Vec<(String, String)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT param_url, value FROM search_index WHERE surrogate_id = ?1 ORDER BY param_url, value",
        )?;
        let rows = stmt
            .query_map([surrogate_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Surrogate ids of resources indexed under `param_url` with `value`.
    pub fn lookup(&self, param_url: &str, value: &str) -> Result<Vec<i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT surrogate_id FROM search_index WHERE param_url = ?1 AND value = ?2 ORDER BY surrogate_id",
        )?;
        let ids = stmt
            .query_map(params![param_url, value], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    // === Search parameters ===

    /// Add or redefine a search parameter. A new or changed definition is not
    /// searchable until a reindex marks it so.
    pub fn put_search_param(&self, definition: &SearchParamDefinition) -> Result<()> {
        if !definition.expression.is_empty() && !definition.expression.starts_with('/') {
            bail!(
                "Search parameter {} has invalid JSON pointer '{}'",
                definition.url,
                definition.expression
            );
        }
        let conn = self.lock();
        conn.execute(
            r#"INSERT INTO search_params (url, resource_type, code, expression, is_searchable)
               VALUES (?1, ?2, ?3, ?4, 0)
               ON CONFLICT(url) DO UPDATE SET
                   is_searchable = CASE
                       WHEN resource_type = excluded.resource_type
                            AND expression = excluded.expression THEN is_searchable
                       ELSE 0 END,
                   resource_type = excluded.resource_type,
                   code = excluded.code,
                   expression = excluded.expression"#,
            params![
                definition.url,
                definition.resource_type,
                definition.code,
                definition.expression
            ],
        )?;
        Ok(())
    }

    /// Parameter definitions that apply to `resource_type`, ordered by URL.
    pub fn search_params(&self, resource_type: &str) -> Result<Vec<SearchParamDefinition>> {
        let conn = self.lock();
        Self::load_search_params(&conn, resource_type)
    }

    fn load_search_params(conn: &Connection, resource_type: &str) -> Result<Vec<SearchParamDefinition>> {
        let mut stmt = conn.prepare_cached(
            "SELECT url, resource_type, code, expression FROM search_params WHERE resource_type = ?1 ORDER BY url",
        )?;
        let params = stmt
            .query_map([resource_type], |row| {
                Ok(SearchParamDefinition {
                    url: row.get(0)?,
                    resource_type: row.get(1)?,
                    code: row.get(2)?,
                    expression: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(params)
    }

    pub fn is_searchable(&self, url: &str) -> Result<Option<bool>> {
        let conn = self.lock();
        let flag = conn
            .query_row(
                "SELECT is_searchable FROM search_params WHERE url = ?1",
                [url],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(flag.map(|f| f != 0))
    }

    /// URLs of parameters of `resource_types` that are not searchable yet.
    pub fn pending_param_urls(&self, resource_types: &[String]) -> Result<BTreeSet<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT url FROM search_params WHERE resource_type = ?1 AND is_searchable = 0",
        )?;
        let mut urls = BTreeSet::new();
        for resource_type in resource_types {
            let rows = stmt.query_map([resource_type], |row| row.get::<_, String>(0))?;
            for url in rows {
                urls.insert(url?);
            }
        }
        Ok(urls)
    }

    /// Distinct resource types with at least one parameter definition.
    pub fn indexed_resource_types(&self) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT DISTINCT resource_type FROM search_params ORDER BY resource_type")?;
        let types = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(types)
    }

    // === Fingerprints ===

    /// SHA-256 over the sorted parameter definitions of `resource_type`.
    pub fn fingerprint(&self, resource_type: &str) -> Result<String> {
        let conn = self.lock();
        let params = Self::load_search_params(&conn, resource_type)?;
        Ok(fingerprint_of(&params))
    }

    /// Current fingerprint of every type in `resource_types`.
    pub fn current_param_hashes(&self, resource_types: &[String]) -> Result<BTreeMap<String, String>> {
        let conn = self.lock();
        let mut hashes = BTreeMap::new();
        for resource_type in resource_types {
            let params = Self::load_search_params(&conn, resource_type)?;
            hashes.insert(resource_type.clone(), fingerprint_of(&params));
        }
        Ok(hashes)
    }
}

/// Fingerprint of a parameter set. `params` must be sorted by URL.
fn fingerprint_of(params: &[SearchParamDefinition]) -> String {
    let mut hasher = Sha256::new();
    for param in params {
        hasher.update(param.url.as_bytes());
        hasher.update(b"\t");
        hasher.update(param.expression.as_bytes());
        hasher.update(b"\n");
    }
    format!("sha256:{:x}", hasher.finalize())
}

/// Values selected by a JSON pointer, flattening arrays. Strings are indexed
/// as-is, other values as their JSON text.
fn extract_values(payload: &Value, pointer: &str) -> Vec<String> {
    fn push(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::Null => {}
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => items.iter().for_each(|item| push(item, out)),
            other => out.push(other.to_string()),
        }
    }
    let mut values = Vec::new();
    if let Some(selected) = payload.pointer(pointer) {
        push(selected, &mut values);
    }
    values.sort();
    values.dedup();
    values
}

/// Continuation cursor: the last surrogate id returned.
fn parse_cursor(cursor: &str) -> Result<i64> {
    cursor
        .strip_prefix("after:")
        .and_then(|id| id.parse().ok())
        .with_context(|| format!("Malformed continuation cursor '{}'", cursor))
}

const STALE_FILTER: &str = "resource_type = ?1 AND (param_hash IS NULL OR param_hash != ?2)";

#[async_trait]
impl SearchService for SqliteResourceStore {
    async fn query(&self, query: SearchQuery) -> Result<SearchResult> {
        let conn = self.lock();

        if query.count_only {
            let (count, min_id, max_id): (i64, Option<i64>, Option<i64>) = conn.query_row(
                &format!(
                    "SELECT COUNT(*), MIN(surrogate_id), MAX(surrogate_id) FROM resources WHERE {}",
                    STALE_FILTER
                ),
                params![query.resource_type, query.param_hash],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            let id_range = match (min_id, max_id) {
                (Some(min), Some(max)) => Some(IdWindow::new(min, max + 1)),
                _ => None,
            };
            return Ok(SearchResult {
                total_count: Some(count as u64),
                id_range,
                entries: Vec::new(),
                continuation: None,
            });
        }

        let window = query
            .window
            .context("Result-page query without an id window")?;
        let start_id = match &query.continuation {
            Some(cursor) => window.start_id.max(parse_cursor(cursor)? + 1),
            None => window.start_id,
        };
        let limit = query.max_results.max(1);

        let mut stmt = conn.prepare_cached(&format!(
            r#"SELECT surrogate_id, resource_id, payload FROM resources
               WHERE {} AND surrogate_id >= ?3 AND surrogate_id < ?4
               ORDER BY surrogate_id LIMIT ?5"#,
            STALE_FILTER
        ))?;
        let rows = stmt
            .query_map(
                params![
                    query.resource_type,
                    query.param_hash,
                    start_id,
                    window.end_id,
                    (limit + 1) as i64
                ],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let has_more = rows.len() as u64 > limit;
        let mut entries = Vec::with_capacity(rows.len());
        for (surrogate_id, resource_id, payload) in rows.into_iter().take(limit as usize) {
            entries.push(ResourceEntry {
                resource_type: query.resource_type.clone(),
                surrogate_id,
                resource_id,
                payload: serde_json::from_str(&payload)
                    .with_context(|| format!("Corrupt payload for resource {}", surrogate_id))?,
            });
        }
        let continuation = if has_more {
            entries.last().map(|e| format!("after:{}", e.surrogate_id))
        } else {
            None
        };

        debug!(
            "Page query {} ids {}..{} returned {} resources",
            query.resource_type,
            start_id,
            window.end_id,
            entries.len()
        );
        Ok(SearchResult {
            total_count: None,
            id_range: None,
            entries,
            continuation,
        })
    }

    /// Boundaries fall on every `max_per_range`-th stale resource, so each
    /// range holds at most that many resources however sparse the ids are.
    async fn surrogate_id_ranges(
        &self,
        resource_type: &str,
        param_hash: &str,
        window: IdWindow,
        max_per_range: u64,
    ) -> Result<Vec<IdWindow>> {
        if window.is_empty() || max_per_range == 0 {
            return Ok(Vec::new());
        }
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            r#"SELECT surrogate_id FROM resources
               WHERE {} AND surrogate_id >= ?3 AND surrogate_id < ?4
               ORDER BY surrogate_id LIMIT 1 OFFSET ?5"#,
            STALE_FILTER
        ))?;

        let first: Option<i64> = stmt
            .query_row(
                params![resource_type, param_hash, window.start_id, window.end_id, 0],
                |row| row.get(0),
            )
            .optional()?;
        if first.is_none() {
            return Ok(Vec::new());
        }

        let mut ranges = Vec::new();
        let mut range_start = window.start_id;
        let mut offset = max_per_range as i64;
        loop {
            let boundary: Option<i64> = stmt
                .query_row(
                    params![resource_type, param_hash, window.start_id, window.end_id, offset],
                    |row| row.get(0),
                )
                .optional()?;
            match boundary {
                Some(boundary) => {
                    ranges.push(IdWindow::new(range_start, boundary));
                    range_start = boundary;
                    offset += max_per_range as i64;
                }
                None => {
                    ranges.push(IdWindow::new(range_start, window.end_id));
                    break;
                }
            }
        }
        Ok(ranges)
    }
}

#[async_trait]
impl IndexUpdater for SqliteResourceStore {
    async fn apply(
        &self,
        entries: &[ResourceEntry],
        fingerprint_by_type: &BTreeMap<String, String>,
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let mut params_by_type: BTreeMap<&str, Vec<SearchParamDefinition>> = BTreeMap::new();
        for entry in entries {
            if !params_by_type.contains_key(entry.resource_type.as_str()) {
                let params = Self::load_search_params(&tx, &entry.resource_type)?;
                params_by_type.insert(&entry.resource_type, params);
            }
        }

        {
            let mut clear = tx.prepare_cached("DELETE FROM search_index WHERE surrogate_id = ?1")?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO search_index (surrogate_id, param_url, value) VALUES (?1, ?2, ?3)",
            )?;
            let mut stamp = tx.prepare_cached(
                "UPDATE resources SET param_hash = ?2 WHERE surrogate_id = ?1",
            )?;

            for entry in entries {
                let fingerprint = fingerprint_by_type
                    .get(&entry.resource_type)
                    .with_context(|| format!("No fingerprint for type {}", entry.resource_type))?;
                clear.execute([entry.surrogate_id])?;
                for param in params_by_type
                    .get(entry.resource_type.as_str())
                    .map(Vec::as_slice)
                    .unwrap_or_default()
                {
                    for value in extract_values(&entry.payload, &param.expression) {
                        insert.execute(params![entry.surrogate_id, param.url, value])?;
                    }
                }
                stamp.execute(params![entry.surrogate_id, fingerprint])?;
            }
        }
        tx.commit()?;

        debug!("Reindexed {} resources", entries.len());
        Ok(())
    }

    async fn mark_searchable(&self, param_urls: &[String]) -> Result<SearchableUpdate> {
        let conn = self.lock();
        let mut unknown = Vec::new();
        for url in param_urls {
            let updated = conn.execute(
                "UPDATE search_params SET is_searchable = 1 WHERE url = ?1",
                [url],
            )?;
            if updated == 0 {
                unknown.push(url.as_str());
            }
        }
        if !unknown.is_empty() {
            return Ok(SearchableUpdate::failed(format!(
                "unknown search parameters: {}",
                unknown.join(", ")
            )));
        }
        info!("Marked {} search parameters searchable", param_urls.len());
        Ok(SearchableUpdate::ok())
    }
}
