//! Shared helpers for metadata integration tests.

#![allow(dead_code)]

use serde_json::json;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use updraft_core::{ContentHash, NewAsset, Update, UpdateStatus, asset_relative_path};
use updraft_metadata::{MetadataResult, MetadataStore, SqliteStore};
use uuid::Uuid;

pub const SCOPE: &str = "https://updates.example.com";

/// A test metadata store wrapper.
pub struct TestMetadata {
    pub store: Arc<SqliteStore>,
}

impl TestMetadata {
    /// Create a new in-memory SQLite store.
    pub async fn in_memory() -> MetadataResult<Self> {
        let store = SqliteStore::new(":memory:").await?;
        Ok(Self {
            store: Arc::new(store),
        })
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }
}

/// A PENDING update committed `age_secs` before a fixed reference time.
pub fn pending_update(runtime: &str, age_secs: i64) -> Update {
    let id = Uuid::new_v4();
    Update {
        id,
        scope_key: SCOPE.to_string(),
        commit_time: OffsetDateTime::UNIX_EPOCH + Duration::days(20_000)
            - Duration::seconds(age_secs),
        runtime_version: runtime.to_string(),
        manifest: json!({"id": id.to_string(), "metadata": {}}),
        status: UpdateStatus::Pending,
        keep: false,
        last_accessed: OffsetDateTime::now_utc(),
        successful_launch_count: 0,
        failed_launch_count: 0,
        launch_asset_id: None,
    }
}

pub fn new_asset(key: &str, is_launch_asset: bool) -> NewAsset {
    NewAsset {
        key: key.to_string(),
        relative_path: asset_relative_path(key),
        hash: ContentHash::compute(key.as_bytes()),
        url: url::Url::parse(&format!("https://cdn.example.com/{key}")).ok(),
        embedded_locator: None,
        content_type: "application/octet-stream".to_string(),
        is_launch_asset,
        expected_hash: None,
        download_time: OffsetDateTime::now_utc(),
    }
}
