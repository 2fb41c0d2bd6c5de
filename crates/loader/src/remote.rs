//! Loading an update published by the update server.

use crate::downloader::{FileDownloader, ManifestRequestContext, ManifestResponse};
use crate::embedded::EmbeddedPackage;
use crate::error::{LoaderError, LoaderResult};
use crate::loading::{
    AssetBuckets, AssetOutcome, ExistingAsset, LoadOutcome, LoadProgress, LoaderContext,
    persist_buckets, resolve_update_row, reusable_asset,
};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use std::collections::BTreeMap;
use time::OffsetDateTime;
use updraft_core::{
    AssetSource, ManifestAsset, ManifestExtensions, NewAsset, UpdateDirective, UpdateManifest,
};
use updraft_metadata::repos::{MANIFEST_FILTERS_KEY, SERVER_DEFINED_HEADERS_KEY};

/// Receives asset progress while an update downloads.
pub type ProgressCallback = Arc<dyn Fn(LoadProgress) + Send + Sync>;

/// What a remote load produced.
#[derive(Clone, Debug)]
pub enum RemoteLoadOutcome {
    /// The server had nothing new, or the caller declined the manifest.
    NoUpdateAvailable,
    Loaded(LoadOutcome),
    /// The server asked for the embedded update to launch again, as if it
    /// had been committed at `commit_time`. Nothing was loaded.
    RollBackToEmbedded { commit_time: OffsetDateTime },
}

/// Downloads a manifest and every asset it names. Single use.
pub struct RemoteLoader {
    ctx: LoaderContext,
    downloader: FileDownloader,
    embedded: Option<Arc<EmbeddedPackage>>,
    request: ManifestRequestContext,
    started: AtomicBool,
}

impl RemoteLoader {
    pub fn new(ctx: LoaderContext, downloader: FileDownloader) -> Self {
        Self {
            ctx,
            downloader,
            embedded: None,
            request: ManifestRequestContext::default(),
            started: AtomicBool::new(false),
        }
    }

    /// Package to copy assets with an embedded locator from.
    pub fn with_embedded_package(mut self, package: Arc<EmbeddedPackage>) -> Self {
        self.embedded = Some(package);
        self
    }

    pub fn with_request_context(mut self, request: ManifestRequestContext) -> Self {
        self.request = request;
        self
    }

    /// Fetch the manifest, ask `should_load` whether to keep going, then
    /// fetch all assets concurrently and persist them.
    ///
    /// Calling this a second time on the same loader is an error.
    pub async fn start<F>(
        &self,
        should_load: F,
        progress: Option<ProgressCallback>,
    ) -> LoaderResult<RemoteLoadOutcome>
    where
        F: FnOnce(&UpdateManifest) -> bool + Send,
    {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(LoaderError::ContractViolation(
                "remote loader started more than once".to_string(),
            ));
        }

        let response = self.downloader.download_manifest(&self.request).await?;
        self.persist_response_headers(&response).await?;

        match response.directive {
            Some(UpdateDirective::NoUpdateAvailable) => {
                tracing::info!("Server directive: no update available");
                return Ok(RemoteLoadOutcome::NoUpdateAvailable);
            }
            Some(UpdateDirective::RollBackToEmbedded { commit_time }) => {
                tracing::info!(%commit_time, "Server directive: roll back to embedded update");
                return Ok(RemoteLoadOutcome::RollBackToEmbedded { commit_time });
            }
            None => {}
        }

        let Some(manifest) = response.manifest else {
            return Ok(RemoteLoadOutcome::NoUpdateAvailable);
        };
        if !should_load(&manifest) {
            tracing::info!(update_id = %manifest.id, "Remote update not selected for loading");
            return Ok(RemoteLoadOutcome::NoUpdateAvailable);
        }

        let scope_key = self.ctx.scope_key()?;
        let update =
            resolve_update_row(self.ctx.metadata.as_ref(), &manifest, &scope_key).await?;
        if update.status.is_launchable() {
            tracing::debug!(update_id = %update.id, "Remote update already loaded");
            return Ok(RemoteLoadOutcome::Loaded(LoadOutcome {
                update,
                failed_assets: Vec::new(),
            }));
        }

        let extensions = Arc::new(response.extensions);
        let outcome = self
            .load_assets(&manifest, update.id, extensions, progress)
            .await?;
        Ok(RemoteLoadOutcome::Loaded(outcome))
    }

    async fn persist_response_headers(&self, response: &ManifestResponse) -> LoaderResult<()> {
        let scope_key = self.ctx.scope_key()?;
        if let Some(headers) = &response.server_defined_headers {
            self.ctx
                .metadata
                .set_json_data(
                    SERVER_DEFINED_HEADERS_KEY,
                    &Value::Object(headers.clone()),
                    &scope_key,
                )
                .await?;
        }
        if let Some(filters) = &response.manifest_filters {
            let value = serde_json::to_value(filters).map_err(updraft_core::Error::from)?;
            self.ctx
                .metadata
                .set_json_data(MANIFEST_FILTERS_KEY, &value, &scope_key)
                .await?;
        }
        Ok(())
    }

    async fn load_assets(
        &self,
        manifest: &UpdateManifest,
        update_id: uuid::Uuid,
        extensions: Arc<ManifestExtensions>,
        progress: Option<ProgressCallback>,
    ) -> LoaderResult<LoadOutcome> {
        let assets = manifest.unique_assets();
        let buckets = Arc::new(Mutex::new(AssetBuckets::new(assets.len())));
        tracing::info!(update_id = %update_id, assets = assets.len(), "Loading remote update");

        let mut handles = Vec::with_capacity(assets.len());
        for asset in assets {
            let key = asset.key.clone();
            let ctx = self.ctx.clone();
            let downloader = self.downloader.clone();
            let embedded = self.embedded.clone();
            let buckets = buckets.clone();
            let progress = progress.clone();
            let extensions = extensions.clone();

            let handle = tokio::spawn(async move {
                let outcome =
                    match fetch_asset(
                        &ctx,
                        &downloader,
                        embedded.as_deref(),
                        &asset,
                        extensions.headers_for(&asset.key),
                    )
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(error) => AssetOutcome::Errored {
                            key: asset.key.clone(),
                            error,
                        },
                    };
                let mut buckets = buckets.lock().await;
                buckets.record(outcome);
                if let Some(progress) = &progress {
                    progress(buckets.progress());
                }
            });
            handles.push((key, handle));
        }

        for (key, handle) in handles {
            if let Err(e) = handle.await {
                tracing::error!(key = %key, error = %e, "Asset task did not complete");
                let mut buckets = buckets.lock().await;
                buckets.record(AssetOutcome::Errored {
                    key,
                    error: LoaderError::ContractViolation(format!("asset task failed: {e}")),
                });
                if let Some(progress) = &progress {
                    progress(buckets.progress());
                }
            }
        }

        let buckets = std::mem::take(&mut *buckets.lock().await);
        persist_buckets(self.ctx.metadata.as_ref(), update_id, buckets).await
    }
}

async fn fetch_asset(
    ctx: &LoaderContext,
    downloader: &FileDownloader,
    embedded: Option<&EmbeddedPackage>,
    asset: &ManifestAsset,
    extra_headers: Option<&BTreeMap<String, String>>,
) -> LoaderResult<AssetOutcome> {
    if let Some(row) = reusable_asset(ctx, asset).await? {
        return Ok(AssetOutcome::Existing(ExistingAsset::Row(row)));
    }

    match &asset.source {
        AssetSource::Remote(_) => {
            let fetched = downloader
                .download_asset(asset, ctx.objects.as_ref(), extra_headers)
                .await?;
            let new_asset = NewAsset::from_manifest(asset, fetched.hash);
            Ok(if fetched.downloaded {
                AssetOutcome::Finished(new_asset)
            } else {
                AssetOutcome::Existing(ExistingAsset::FileOnly(new_asset))
            })
        }
        AssetSource::Embedded(_) => {
            let package = embedded.ok_or_else(|| {
                LoaderError::EmbeddedManifest(format!(
                    "asset {} is embedded but no package is available",
                    asset.key
                ))
            })?;
            let new_asset = package
                .copy_into_store(ctx.objects.as_ref(), asset)
                .await?;
            Ok(AssetOutcome::Finished(new_asset))
        }
    }
}
