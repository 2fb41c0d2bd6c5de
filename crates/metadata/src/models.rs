//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use sqlx::FromRow;
use time::OffsetDateTime;
use updraft_core::{Asset, ContentHash, Update, UpdateStatus};
use url::Url;
use uuid::Uuid;

// =============================================================================
// Updates
// =============================================================================

/// Update record.
#[derive(Debug, Clone, FromRow)]
pub struct UpdateRow {
    pub id: Uuid,
    pub scope_key: String,
    pub commit_time: OffsetDateTime,
    pub runtime_version: String,
    /// Manifest JSON as received.
    pub manifest: String,
    pub status: String,
    pub keep: bool,
    pub last_accessed: OffsetDateTime,
    pub successful_launch_count: i64,
    pub failed_launch_count: i64,
    pub launch_asset_id: Option<i64>,
}

impl UpdateRow {
    pub fn from_update(update: &Update) -> Self {
        Self {
            id: update.id,
            scope_key: update.scope_key.clone(),
            commit_time: update.commit_time,
            runtime_version: update.runtime_version.clone(),
            manifest: update.manifest.to_string(),
            status: update.status.as_str().to_string(),
            keep: update.keep,
            last_accessed: update.last_accessed,
            successful_launch_count: update.successful_launch_count,
            failed_launch_count: update.failed_launch_count,
            launch_asset_id: update.launch_asset_id,
        }
    }

    pub fn into_update(self) -> MetadataResult<Update> {
        let manifest = serde_json::from_str(&self.manifest)
            .map_err(|e| MetadataError::Corrupt(format!("manifest of update {}: {e}", self.id)))?;
        let status: UpdateStatus = self.status.parse()?;
        Ok(Update {
            id: self.id,
            scope_key: self.scope_key,
            commit_time: self.commit_time,
            runtime_version: self.runtime_version,
            manifest,
            status,
            keep: self.keep,
            last_accessed: self.last_accessed,
            successful_launch_count: self.successful_launch_count,
            failed_launch_count: self.failed_launch_count,
            launch_asset_id: self.launch_asset_id,
        })
    }
}

// =============================================================================
// Assets
// =============================================================================

/// Asset record. One row per asset key, shared by every update using it.
#[derive(Debug, Clone, FromRow)]
pub struct AssetRow {
    pub id: i64,
    pub key: String,
    pub relative_path: String,
    /// Hex SHA-256 of the stored file.
    pub hash: String,
    pub url: Option<String>,
    pub embedded_locator: Option<String>,
    pub content_type: String,
    pub is_launch_asset: bool,
    pub expected_hash: Option<String>,
    pub download_time: OffsetDateTime,
    pub marked_for_deletion: bool,
}

impl AssetRow {
    pub fn into_asset(self) -> MetadataResult<Asset> {
        let hash = ContentHash::from_hex(&self.hash)?;
        let url = self
            .url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| MetadataError::Corrupt(format!("url of asset {}: {e}", self.key)))?;
        Ok(Asset {
            id: self.id,
            key: self.key,
            relative_path: self.relative_path,
            hash,
            url,
            embedded_locator: self.embedded_locator,
            content_type: self.content_type,
            is_launch_asset: self.is_launch_asset,
            expected_hash: self.expected_hash,
            download_time: self.download_time,
        })
    }
}

/// Link between an update and one of its assets.
#[derive(Debug, Clone, FromRow)]
pub struct UpdateAssetRow {
    pub update_id: Uuid,
    pub asset_id: i64,
}

// =============================================================================
// JSON side data
// =============================================================================

/// Scoped JSON value persisted between launches.
#[derive(Debug, Clone, FromRow)]
pub struct JsonDataRow {
    pub key: String,
    pub value: String,
    pub scope_key: String,
    pub last_updated: OffsetDateTime,
}

pub(crate) fn rows_into_updates(rows: Vec<UpdateRow>) -> MetadataResult<Vec<Update>> {
    rows.into_iter().map(UpdateRow::into_update).collect()
}

pub(crate) fn rows_into_assets(rows: Vec<AssetRow>) -> MetadataResult<Vec<Asset>> {
    rows.into_iter().map(AssetRow::into_asset).collect()
}
