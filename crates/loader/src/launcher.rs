//! Picking the update to launch from the store.

use crate::error::{LoaderError, LoaderResult};
use crate::loading::LoaderContext;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use updraft_core::{Asset, SelectionContext, SelectionPolicy, Update};
use uuid::Uuid;

/// A resolved launch: the update plus where its files live.
#[derive(Clone, Debug)]
pub struct Launch {
    pub update: Update,
    /// Path of the entry-point file.
    pub launch_asset_path: PathBuf,
    /// Local path of every asset, by key.
    pub asset_paths: BTreeMap<String, PathBuf>,
}

/// Chooses and prepares launchable updates.
pub struct Launcher {
    ctx: LoaderContext,
    policy: Arc<dyn SelectionPolicy>,
}

impl Launcher {
    pub fn new(ctx: LoaderContext, policy: Arc<dyn SelectionPolicy>) -> Self {
        Self { ctx, policy }
    }

    /// Launch the best stored update.
    ///
    /// An update whose files went missing is demoted to pending and the
    /// next best candidate is tried.
    pub async fn launch_best(&self, selection: &SelectionContext) -> LoaderResult<Launch> {
        let scope_key = self.ctx.scope_key()?;
        let mut skipped: HashSet<Uuid> = HashSet::new();

        loop {
            let candidates: Vec<Update> = self
                .ctx
                .metadata
                .launchable_updates(&scope_key)
                .await?
                .into_iter()
                .filter(|u| !skipped.contains(&u.id))
                .collect();
            let Some(update) = self.policy.select_update_to_launch(&candidates, selection) else {
                return Err(LoaderError::NoLaunchableUpdate);
            };

            match self.launch_update(&update).await {
                Ok(launch) => return Ok(launch),
                Err(LoaderError::NoLaunchableUpdate) => {
                    skipped.insert(update.id);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Prepare a specific update for launch.
    ///
    /// Fails with `NoLaunchableUpdate` when the launch file is missing, after
    /// demoting every update that references a missing file.
    pub async fn launch_update(&self, update: &Update) -> LoaderResult<Launch> {
        let metadata = &self.ctx.metadata;
        let Some(launch_asset) = metadata.launch_asset_for_update(update.id).await? else {
            tracing::warn!(update_id = %update.id, "Update has no launch asset");
            return Err(LoaderError::NoLaunchableUpdate);
        };

        let assets = metadata.assets_for_update(update.id).await?;
        let mut asset_paths = BTreeMap::new();
        let mut missing = Vec::new();
        for asset in assets.iter().chain(std::iter::once(&launch_asset)) {
            match self.asset_path(asset).await? {
                Some(path) => {
                    asset_paths.insert(asset.key.clone(), path);
                }
                None => missing.push(asset.id),
            }
        }

        if !missing.is_empty() {
            missing.sort_unstable();
            missing.dedup();
            let demoted = metadata.mark_missing_assets(&missing).await?;
            tracing::warn!(
                update_id = %update.id,
                missing = missing.len(),
                demoted,
                "Asset files missing, demoted updates to pending"
            );
            return Err(LoaderError::NoLaunchableUpdate);
        }

        let launch_asset_path = asset_paths
            .get(&launch_asset.key)
            .cloned()
            .ok_or(LoaderError::NoLaunchableUpdate)?;
        metadata.mark_update_accessed(update.id).await?;
        tracing::info!(update_id = %update.id, "Launching update");

        Ok(Launch {
            update: update.clone(),
            launch_asset_path,
            asset_paths,
        })
    }

    async fn asset_path(&self, asset: &Asset) -> LoaderResult<Option<PathBuf>> {
        if !self.ctx.objects.exists(&asset.relative_path).await? {
            return Ok(None);
        }
        Ok(self.ctx.objects.local_path(&asset.relative_path).await?)
    }

    /// Record that the host ran `update_id` without crashing.
    pub async fn mark_successful_launch(&self, update_id: Uuid) -> LoaderResult<()> {
        self.ctx
            .metadata
            .increment_successful_launch_count(update_id)
            .await?;
        Ok(())
    }

    /// Record that `update_id` crashed on launch. An update that fails
    /// without ever succeeding stops being launchable.
    pub async fn mark_failed_launch(&self, update_id: Uuid) -> LoaderResult<()> {
        self.ctx
            .metadata
            .increment_failed_launch_count(update_id)
            .await?;
        tracing::warn!(update_id = %update_id, "Recorded failed launch");
        Ok(())
    }
}
