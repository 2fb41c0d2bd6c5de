//! Asset repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use updraft_core::{Asset, ManifestAsset, NewAsset};
use uuid::Uuid;

/// Repository for asset rows and their links to updates.
#[async_trait]
pub trait AssetRepo: Send + Sync {
    /// Get an asset by its content-addressing key.
    async fn get_asset_by_key(&self, key: &str) -> MetadataResult<Option<Asset>>;

    /// Fold fields from a manifest entry into an existing row.
    ///
    /// A changed URL is persisted. Stored fields win otherwise; the launch
    /// flag of the returned asset follows the manifest.
    async fn merge_asset(&self, existing: &Asset, incoming: &ManifestAsset)
    -> MetadataResult<Asset>;

    /// Link the asset stored under `key` to an update.
    ///
    /// Returns false when no row exists for the key.
    async fn link_existing_asset(
        &self,
        update_id: Uuid,
        key: &str,
        is_launch_asset: bool,
    ) -> MetadataResult<bool>;

    /// Insert assets and link them to an update in one transaction.
    ///
    /// A key that already has a row keeps it (first writer wins) and the
    /// existing row is linked instead.
    async fn insert_assets(&self, update_id: Uuid, assets: &[NewAsset])
    -> MetadataResult<Vec<Asset>>;

    /// Link existing assets, insert new ones, and optionally promote the
    /// update to READY, all in one transaction.
    ///
    /// Existing assets are re-resolved by key inside the transaction. Keys
    /// whose row has since been deleted are skipped and returned; the update
    /// is not promoted when any are.
    async fn commit_update_assets(
        &self,
        update_id: Uuid,
        existing: &[Asset],
        new_assets: &[NewAsset],
        mark_ready: bool,
    ) -> MetadataResult<Vec<String>>;

    /// Assets linked to an update.
    async fn assets_for_update(&self, update_id: Uuid) -> MetadataResult<Vec<Asset>>;

    /// The entry-point asset of an update.
    async fn launch_asset_for_update(&self, update_id: Uuid) -> MetadataResult<Option<Asset>>;

    async fn all_assets(&self) -> MetadataResult<Vec<Asset>>;

    /// Demote every update referencing these assets back to PENDING.
    async fn mark_missing_assets(&self, asset_ids: &[i64]) -> MetadataResult<u64>;

    /// Delete asset rows no remaining update references.
    ///
    /// Rows sharing a relative path with a referenced row are kept. Returns
    /// the deleted rows so callers can remove their files.
    async fn delete_unused_assets(&self) -> MetadataResult<Vec<Asset>>;
}
