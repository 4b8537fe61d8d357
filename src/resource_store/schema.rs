//! Database schema for resources.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{ForeignKey, SqlType, Table, VersionedSchema};

/// Stored resources. `param_hash` is the fingerprint of the parameter set
/// the resource's index entries were last computed with.
const RESOURCES_TABLE_V0: Table = Table {
    name: "resources",
    columns: &[
        sqlite_column!("surrogate_id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("resource_type", &SqlType::Text, non_null = true),
        sqlite_column!("resource_id", &SqlType::Text, non_null = true),
        sqlite_column!("payload", &SqlType::Text, non_null = true), // JSON
        sqlite_column!("param_hash", &SqlType::Text),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_resources_type_id", "resource_type, surrogate_id")],
    unique_constraints: &[&["resource_type", "resource_id"]],
};

/// Search parameter definitions. `expression` is a JSON pointer into the
/// resource payload.
const SEARCH_PARAMS_TABLE_V0: Table = Table {
    name: "search_params",
    columns: &[
        sqlite_column!("url", &SqlType::Text, is_primary_key = true),
        sqlite_column!("resource_type", &SqlType::Text, non_null = true),
        sqlite_column!("code", &SqlType::Text, non_null = true),
        sqlite_column!("expression", &SqlType::Text, non_null = true),
        sqlite_column!(
            "is_searchable",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[("idx_search_params_type", "resource_type")],
    unique_constraints: &[],
};

const RESOURCE_FK: ForeignKey = ForeignKey {
    foreign_table: "resources",
    foreign_column: "surrogate_id",
    cascade_on_delete: true,
};

const SEARCH_INDEX_TABLE_V0: Table = Table {
    name: "search_index",
    columns: &[
        sqlite_column!(
            "surrogate_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&RESOURCE_FK)
        ),
        sqlite_column!("param_url", &SqlType::Text, non_null = true),
        sqlite_column!("value", &SqlType::Text, non_null = true),
    ],
    indices: &[
        ("idx_search_index_resource", "surrogate_id"),
        ("idx_search_index_lookup", "param_url, value"),
    ],
    unique_constraints: &[],
};

pub const RESOURCE_STORE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[
        RESOURCES_TABLE_V0,
        SEARCH_PARAMS_TABLE_V0,
        SEARCH_INDEX_TABLE_V0,
    ],
    migration: None,
}];
