//! Scoped JSON side data.

use crate::error::MetadataResult;
use async_trait::async_trait;
use serde_json::Value;

/// Key for headers the update server asks clients to echo back.
pub const SERVER_DEFINED_HEADERS_KEY: &str = "serverDefinedHeaders";

/// Key for the server's manifest filters.
pub const MANIFEST_FILTERS_KEY: &str = "manifestFilters";

/// Repository for small JSON values keyed per scope.
#[async_trait]
pub trait JsonDataRepo: Send + Sync {
    async fn get_json_data(&self, key: &str, scope_key: &str) -> MetadataResult<Option<Value>>;

    /// Insert or replace a value.
    async fn set_json_data(&self, key: &str, value: &Value, scope_key: &str)
    -> MetadataResult<()>;
}
