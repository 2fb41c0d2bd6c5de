//! Shared plumbing for the embedded and remote loaders.

use crate::error::{LoaderError, LoaderResult};
use serde_json::{Map, Value};
use std::sync::Arc;
use updraft_core::{
    Asset, ManifestAsset, ManifestFilters, NewAsset, SelectionContext, Update, UpdateManifest,
    UpdatesConfig,
};
use updraft_metadata::repos::{MANIFEST_FILTERS_KEY, SERVER_DEFINED_HEADERS_KEY};
use updraft_metadata::MetadataStore;
use updraft_storage::ObjectStore;
use uuid::Uuid;

/// Handles shared by every loader in one process.
#[derive(Clone)]
pub struct LoaderContext {
    pub config: Arc<UpdatesConfig>,
    pub metadata: Arc<dyn MetadataStore>,
    pub objects: Arc<dyn ObjectStore>,
}

impl LoaderContext {
    pub fn new(
        config: Arc<UpdatesConfig>,
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            metadata,
            objects,
        }
    }

    /// Open the default stores for a configuration.
    pub async fn from_config(config: UpdatesConfig) -> LoaderResult<Self> {
        let metadata = updraft_metadata::from_config(&config).await?;
        let objects = updraft_storage::from_config(&config).await?;
        Ok(Self::new(Arc::new(config), metadata, objects))
    }

    pub fn scope_key(&self) -> LoaderResult<String> {
        self.config.effective_scope_key().ok_or_else(|| {
            LoaderError::Config("scope_key must be set when update_url has no origin".to_string())
        })
    }

    pub fn runtime_version(&self) -> LoaderResult<&str> {
        self.config.effective_runtime_version().ok_or_else(|| {
            LoaderError::Config("one of runtime_version or sdk_version must be set".to_string())
        })
    }

    /// Manifest filters last persisted for this scope.
    pub async fn manifest_filters(&self) -> LoaderResult<Option<ManifestFilters>> {
        let scope_key = self.scope_key()?;
        let Some(value) = self
            .metadata
            .get_json_data(MANIFEST_FILTERS_KEY, &scope_key)
            .await?
        else {
            return Ok(None);
        };
        let filters = serde_json::from_value(value).map_err(updraft_core::Error::from)?;
        Ok(Some(filters))
    }

    pub async fn selection_context(&self) -> LoaderResult<SelectionContext> {
        Ok(SelectionContext::new(self.manifest_filters().await?))
    }

    /// Headers the server asked to receive, last persisted for this scope.
    pub async fn server_defined_headers(&self) -> LoaderResult<Option<Map<String, Value>>> {
        let scope_key = self.scope_key()?;
        let value = self
            .metadata
            .get_json_data(SERVER_DEFINED_HEADERS_KEY, &scope_key)
            .await?;
        Ok(value.and_then(|v| match v {
            Value::Object(map) => Some(map),
            _ => None,
        }))
    }
}

/// Find or create the row for a manifest.
///
/// An existing row with a different scope key keeps its identity and only
/// has the scope key overwritten.
pub(crate) async fn resolve_update_row(
    metadata: &dyn MetadataStore,
    manifest: &UpdateManifest,
    scope_key: &str,
) -> LoaderResult<Update> {
    if let Some(mut existing) = metadata.get_update(manifest.id).await? {
        if existing.scope_key != scope_key {
            tracing::warn!(
                update_id = %existing.id,
                stored_scope = %existing.scope_key,
                scope = %scope_key,
                "Update loaded with a different scope key, overwriting"
            );
            metadata.set_scope_key(existing.id, scope_key).await?;
            existing.scope_key = scope_key.to_string();
        }
        return Ok(existing);
    }

    let update = Update::from_manifest(manifest, scope_key);
    metadata.insert_update(&update).await?;
    tracing::debug!(update_id = %update.id, "Inserted pending update");
    Ok(update)
}

/// The stored row for `asset` when its file is still on disk, merged with
/// the manifest's view of it.
pub(crate) async fn reusable_asset(
    ctx: &LoaderContext,
    asset: &ManifestAsset,
) -> LoaderResult<Option<Asset>> {
    let Some(row) = ctx.metadata.get_asset_by_key(&asset.key).await? else {
        return Ok(None);
    };
    if !ctx.objects.exists(&row.relative_path).await? {
        return Ok(None);
    }
    Ok(Some(ctx.metadata.merge_asset(&row, asset).await?))
}

/// An asset that needed no transfer.
#[derive(Clone, Debug)]
pub(crate) enum ExistingAsset {
    /// Row and file both present.
    Row(Asset),
    /// File present without a row; the row is rebuilt from its hash.
    FileOnly(NewAsset),
}

/// Result of fetching a single asset.
#[derive(Debug)]
pub(crate) enum AssetOutcome {
    Existing(ExistingAsset),
    Finished(NewAsset),
    Errored { key: String, error: LoaderError },
}

/// Success, failure, and total counts while an update loads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadProgress {
    pub successful: usize,
    pub failed: usize,
    pub total: usize,
}

/// Asset outcomes accumulated for one update.
#[derive(Debug, Default)]
pub(crate) struct AssetBuckets {
    existing: Vec<ExistingAsset>,
    finished: Vec<NewAsset>,
    errored: Vec<String>,
    total: usize,
}

impl AssetBuckets {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub(crate) fn record(&mut self, outcome: AssetOutcome) {
        match outcome {
            AssetOutcome::Existing(existing) => self.existing.push(existing),
            AssetOutcome::Finished(asset) => self.finished.push(asset),
            AssetOutcome::Errored { key, error } => {
                tracing::warn!(key = %key, error = %error, "Asset failed to load");
                self.errored.push(key);
            }
        }
    }

    pub(crate) fn progress(&self) -> LoadProgress {
        LoadProgress {
            successful: self.existing.len() + self.finished.len(),
            failed: self.errored.len(),
            total: self.total,
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.existing.len() + self.finished.len() + self.errored.len() == self.total
    }
}

/// Outcome of loading one update into the store.
#[derive(Clone, Debug)]
pub struct LoadOutcome {
    /// The update row after loading.
    pub update: Update,
    /// Keys of assets that failed; the update stays pending if non-empty.
    pub failed_assets: Vec<String>,
}

impl LoadOutcome {
    pub fn is_ready(&self) -> bool {
        self.failed_assets.is_empty() && self.update.status.is_launchable()
    }
}

/// Link and insert everything the buckets hold, marking the update ready
/// only when nothing errored. Runs as one store transaction.
pub(crate) async fn persist_buckets(
    metadata: &dyn MetadataStore,
    update_id: Uuid,
    buckets: AssetBuckets,
) -> LoaderResult<LoadOutcome> {
    if !buckets.is_complete() {
        return Err(LoaderError::ContractViolation(format!(
            "persisting update {update_id} before every asset reported"
        )));
    }

    let AssetBuckets {
        existing,
        mut finished,
        mut errored,
        ..
    } = buckets;

    let mut linked = Vec::with_capacity(existing.len());
    for asset in existing {
        match asset {
            ExistingAsset::Row(row) => linked.push(row),
            ExistingAsset::FileOnly(new_asset) => {
                tracing::info!(key = %new_asset.key, "Rebuilding missing asset row from file");
                finished.push(new_asset);
            }
        }
    }

    let ready = errored.is_empty();
    let stale = metadata
        .commit_update_assets(update_id, &linked, &finished, ready)
        .await?;
    if !stale.is_empty() {
        tracing::warn!(
            update_id = %update_id,
            keys = ?stale,
            "Asset rows deleted while loading; update left pending"
        );
        errored.extend(stale);
    }
    let ready = errored.is_empty();

    let update = metadata
        .get_update(update_id)
        .await?
        .ok_or_else(|| updraft_metadata::MetadataError::NotFound(update_id.to_string()))?;
    if ready {
        tracing::info!(update_id = %update_id, "Update ready");
    }
    Ok(LoadOutcome {
        update,
        failed_assets: errored,
    })
}
