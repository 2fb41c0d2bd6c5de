//! The update package shipped inside the application binary.

use crate::error::{LoaderError, LoaderResult};
use crate::launcher::Launch;
use crate::loading::{
    AssetBuckets, AssetOutcome, ExistingAsset, LoadOutcome, LoaderContext, persist_buckets,
    resolve_update_row, reusable_asset,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use updraft_core::{
    AssetSource, ManifestAsset, NewAsset, Update, UpdateManifest, UpdateStatus,
    asset_relative_path,
};
use updraft_storage::ObjectStore;

/// Manifest file name inside an embedded package.
pub const EMBEDDED_MANIFEST_FILE: &str = "app.manifest";

/// A directory holding `app.manifest` and the files it names.
///
/// The manifest is read and parsed at most once per handle.
#[derive(Debug)]
pub struct EmbeddedPackage {
    root: PathBuf,
    manifest: OnceCell<UpdateManifest>,
}

impl EmbeddedPackage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            manifest: OnceCell::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The parsed embedded manifest. A package whose manifest cannot be
    /// read or parsed is malformed and cannot be recovered from.
    pub async fn manifest(&self) -> LoaderResult<&UpdateManifest> {
        self.manifest
            .get_or_try_init(|| async {
                let path = self.root.join(EMBEDDED_MANIFEST_FILE);
                let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
                    LoaderError::EmbeddedManifest(format!("{}: {e}", path.display()))
                })?;
                let manifest = UpdateManifest::from_json(&text)
                    .map_err(|e| LoaderError::EmbeddedManifest(e.to_string()))?;
                tracing::debug!(update_id = %manifest.id, "Parsed embedded manifest");
                Ok::<_, LoaderError>(manifest)
            })
            .await
    }

    /// Location of an asset's file inside the package.
    ///
    /// Assets without an embedded locator are stored under their key.
    pub fn asset_path(&self, asset: &ManifestAsset) -> PathBuf {
        match &asset.source {
            AssetSource::Embedded(name) => self.root.join(name),
            AssetSource::Remote(_) => self.root.join(&asset.key),
        }
    }

    /// Copy one asset's file into the store while hashing it.
    pub(crate) async fn copy_into_store(
        &self,
        objects: &dyn ObjectStore,
        asset: &ManifestAsset,
    ) -> LoaderResult<NewAsset> {
        let relative_path = asset_relative_path(&asset.key);
        let stored = objects
            .import_file(&relative_path, &self.asset_path(asset))
            .await?;
        if let Err(e) = asset.verify_hash(&stored.hash) {
            objects.delete(&relative_path).await?;
            return Err(e.into());
        }
        tracing::debug!(key = %asset.key, size = stored.size, "Copied embedded asset");
        Ok(NewAsset::from_manifest(asset, stored.hash))
    }

    /// Launch straight from the package without touching the store.
    ///
    /// Used when the orchestrated launch failed and the host still needs
    /// something to run.
    pub async fn emergency_launch(&self, scope_key: &str) -> LoaderResult<Launch> {
        let manifest = self.manifest().await?;
        let mut update = Update::from_manifest(manifest, scope_key);
        update.status = UpdateStatus::Embedded;

        let asset_paths: BTreeMap<String, PathBuf> = manifest
            .unique_assets()
            .iter()
            .map(|asset| (asset.key.clone(), self.asset_path(asset)))
            .collect();
        let launch_asset_path = self.asset_path(manifest.launch_asset());
        if !tokio::fs::try_exists(&launch_asset_path).await? {
            return Err(LoaderError::EmbeddedManifest(format!(
                "launch asset missing: {}",
                launch_asset_path.display()
            )));
        }

        tracing::warn!(update_id = %update.id, "Emergency launch from embedded package");
        Ok(Launch {
            update,
            launch_asset_path,
            asset_paths,
        })
    }
}

/// Copies the embedded update into the store.
pub struct EmbeddedLoader {
    ctx: LoaderContext,
    package: Arc<EmbeddedPackage>,
}

impl EmbeddedLoader {
    pub fn new(ctx: LoaderContext, package: Arc<EmbeddedPackage>) -> Self {
        Self { ctx, package }
    }

    /// Load the embedded update, copying only assets the store lacks.
    ///
    /// Per-asset failures are collected; the update becomes ready only when
    /// every asset is in the store.
    pub async fn load(&self) -> LoaderResult<LoadOutcome> {
        let manifest = self.package.manifest().await?;
        let scope_key = self.ctx.scope_key()?;
        let update = resolve_update_row(self.ctx.metadata.as_ref(), manifest, &scope_key).await?;
        if update.status.is_launchable() {
            tracing::debug!(update_id = %update.id, "Embedded update already loaded");
            return Ok(LoadOutcome {
                update,
                failed_assets: Vec::new(),
            });
        }

        let assets = manifest.unique_assets();
        let mut buckets = AssetBuckets::new(assets.len());
        for asset in &assets {
            let outcome = match self.copy_asset(asset).await {
                Ok(outcome) => outcome,
                Err(error) => AssetOutcome::Errored {
                    key: asset.key.clone(),
                    error,
                },
            };
            buckets.record(outcome);
        }

        persist_buckets(self.ctx.metadata.as_ref(), update.id, buckets).await
    }

    async fn copy_asset(&self, asset: &ManifestAsset) -> LoaderResult<AssetOutcome> {
        if let Some(row) = reusable_asset(&self.ctx, asset).await? {
            return Ok(AssetOutcome::Existing(ExistingAsset::Row(row)));
        }

        let new_asset = self
            .package
            .copy_into_store(self.ctx.objects.as_ref(), asset)
            .await?;
        Ok(AssetOutcome::Finished(new_asset))
    }
}
