//! Updates and the assets they reference.

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::manifest::{ManifestAsset, UpdateManifest};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use url::Url;
use uuid::Uuid;

/// Lifecycle status of a stored update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    /// Row exists but at least one asset is missing.
    Pending,
    /// Every asset is stored.
    Ready,
    /// Launched straight from the embedded package.
    Embedded,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Embedded => "embedded",
        }
    }

    /// Statuses from which an update may launch.
    pub fn is_launchable(&self) -> bool {
        matches!(self, Self::Ready | Self::Embedded)
    }
}

impl FromStr for UpdateStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "embedded" => Ok(Self::Embedded),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored update.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub id: Uuid,
    pub scope_key: String,
    pub commit_time: OffsetDateTime,
    pub runtime_version: String,
    pub manifest: Value,
    pub status: UpdateStatus,
    pub keep: bool,
    pub last_accessed: OffsetDateTime,
    pub successful_launch_count: i64,
    pub failed_launch_count: i64,
    pub launch_asset_id: Option<i64>,
}

impl Update {
    /// A fresh PENDING update for a manifest.
    pub fn from_manifest(manifest: &UpdateManifest, scope_key: &str) -> Self {
        Self {
            id: manifest.id,
            scope_key: scope_key.to_string(),
            commit_time: manifest.commit_time,
            runtime_version: manifest.runtime_version.clone(),
            manifest: manifest.raw.clone(),
            status: UpdateStatus::Pending,
            keep: false,
            last_accessed: OffsetDateTime::now_utc(),
            successful_launch_count: 0,
            failed_launch_count: 0,
            launch_asset_id: None,
        }
    }

    /// The manifest `metadata` object, used for filter matching.
    pub fn manifest_metadata(&self) -> Map<String, Value> {
        self.manifest
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }

    /// Has launched successfully, or never failed.
    pub fn has_usable_launch_history(&self) -> bool {
        self.successful_launch_count > 0 || self.failed_launch_count < 1
    }
}

/// An asset ready to be inserted.
#[derive(Clone, Debug, PartialEq)]
pub struct NewAsset {
    pub key: String,
    pub relative_path: String,
    pub hash: ContentHash,
    pub url: Option<Url>,
    pub embedded_locator: Option<String>,
    pub content_type: String,
    pub is_launch_asset: bool,
    pub expected_hash: Option<String>,
    pub download_time: OffsetDateTime,
}

impl NewAsset {
    /// Describe a manifest asset whose bytes hashed to `hash`.
    pub fn from_manifest(asset: &ManifestAsset, hash: ContentHash) -> Self {
        Self {
            key: asset.key.clone(),
            relative_path: asset_relative_path(&asset.key),
            hash,
            url: asset.url().cloned(),
            embedded_locator: asset.embedded_locator().map(str::to_string),
            content_type: asset.content_type.clone(),
            is_launch_asset: asset.is_launch_asset,
            expected_hash: asset.expected_hash.clone(),
            download_time: OffsetDateTime::now_utc(),
        }
    }
}

/// A stored asset.
#[derive(Clone, Debug, PartialEq)]
pub struct Asset {
    pub id: i64,
    pub key: String,
    pub relative_path: String,
    pub hash: ContentHash,
    pub url: Option<Url>,
    pub embedded_locator: Option<String>,
    pub content_type: String,
    pub is_launch_asset: bool,
    pub expected_hash: Option<String>,
    pub download_time: OffsetDateTime,
}

/// Store-relative file name for an asset key.
///
/// Hex SHA-256 of the key, keeping the key's extension so hosts can infer
/// file types.
pub fn asset_relative_path(key: &str) -> String {
    let hash = ContentHash::compute(key.as_bytes()).to_hex();
    let file_name = key.rsplit('/').next().unwrap_or(key);
    match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => format!("{hash}.{ext}"),
        _ => hash,
    }
}
