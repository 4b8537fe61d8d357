//! Resource storage with a search parameter index.

mod schema;
mod store;

pub use schema::RESOURCE_STORE_VERSIONED_SCHEMAS;
pub use store::{SearchParamDefinition, SqliteResourceStore};
