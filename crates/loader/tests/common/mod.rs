//! Shared helpers for loader integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use httpmock::MockServer;
use serde_json::{Value, json};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use updraft_core::{
    ContentHash, NewAsset, Update, UpdateManifest, UpdatesConfig, asset_relative_path,
};
use updraft_loader::{
    BackgroundUpdateEvent, EMBEDDED_MANIFEST_FILE, EmbeddedPackage, FileDownloader, LoadProgress,
    LoaderContext, LoaderTaskDelegate,
};
use updraft_metadata::{AssetRepo, SqliteStore, UpdateRepo};
use updraft_storage::{FilesystemBackend, ObjectStore};
use uuid::Uuid;

pub const SCOPE: &str = "test-scope";

pub const MULTIPART_BOUNDARY: &str = "updraft-test-boundary";

/// `content-type` of a multipart manifest response built by [`multipart_body`].
pub fn multipart_content_type() -> String {
    format!("multipart/mixed; boundary={MULTIPART_BOUNDARY}")
}

/// A multipart manifest response carrying each named JSON part.
pub fn multipart_body(parts: &[(&str, &Value)]) -> String {
    let mut body = String::new();
    for (name, value) in parts {
        body.push_str(&format!(
            "--{MULTIPART_BOUNDARY}\r\n\
             content-type: application/json\r\n\
             content-disposition: form-data; name=\"{name}\"\r\n\r\n\
             {value}\r\n"
        ));
    }
    body.push_str(&format!("--{MULTIPART_BOUNDARY}--\r\n"));
    body
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "updraft_loader=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

/// Base64url SHA-256, the form manifests carry in `hash`.
pub fn hash_of(body: &[u8]) -> String {
    ContentHash::compute(body).to_base64url()
}

/// A mock update server plus fresh stores in a temp directory.
pub struct TestEnv {
    pub temp: TempDir,
    pub server: MockServer,
    pub metadata: Arc<SqliteStore>,
    pub objects: Arc<FilesystemBackend>,
    pub ctx: LoaderContext,
}

impl TestEnv {
    pub async fn new() -> anyhow::Result<Self> {
        Self::with_config(|_| {}).await
    }

    /// Build an environment, letting the caller adjust the configuration
    /// after the update URL and directories are filled in.
    pub async fn with_config(configure: impl FnOnce(&mut UpdatesConfig)) -> anyhow::Result<Self> {
        init_tracing();
        let temp = tempfile::tempdir()?;
        let server = MockServer::start_async().await;

        let mut config = UpdatesConfig {
            update_url: Some(server.url("/manifest").parse::<url::Url>()?),
            scope_key: Some(SCOPE.to_string()),
            updates_directory: temp.path().join("updates"),
            ..UpdatesConfig::for_testing()
        };
        configure(&mut config);

        let metadata = Arc::new(SqliteStore::new(":memory:").await?);
        let objects = Arc::new(FilesystemBackend::new(&config.updates_directory).await?);
        let ctx = LoaderContext::new(Arc::new(config), metadata.clone(), objects.clone());

        Ok(Self {
            temp,
            server,
            metadata,
            objects,
            ctx,
        })
    }

    /// Rebuild the context with an adjusted configuration, keeping stores.
    pub fn reconfigure(&mut self, configure: impl FnOnce(&mut UpdatesConfig)) {
        let mut config = self.ctx.config.as_ref().clone();
        configure(&mut config);
        self.ctx = LoaderContext::new(
            Arc::new(config),
            self.metadata.clone(),
            self.objects.clone(),
        );
    }

    pub fn config(&self) -> &UpdatesConfig {
        &self.ctx.config
    }

    pub fn downloader(&self) -> FileDownloader {
        FileDownloader::new(self.ctx.config.clone()).expect("downloader")
    }

    pub fn asset_url(&self, path: &str) -> String {
        self.server.url(format!("/assets/{path}"))
    }

    pub fn embedded_dir(&self) -> PathBuf {
        self.temp.path().join("embedded")
    }

    /// Absolute path of a stored asset file.
    pub fn stored_path(&self, key: &str) -> PathBuf {
        self.config()
            .updates_directory
            .join(asset_relative_path(key))
    }

    /// Store a ready update directly, writing each asset's key as its body.
    pub async fn store_ready_update(&self, manifest: &ManifestBuilder) -> anyhow::Result<Update> {
        let parsed = UpdateManifest::from_value(manifest.build())?;
        let update = Update::from_manifest(&parsed, SCOPE);
        self.metadata.insert_update(&update).await?;

        let mut assets = Vec::new();
        for asset in parsed.unique_assets() {
            let stored = self
                .objects
                .put(
                    &asset_relative_path(&asset.key),
                    Bytes::from(asset.key.clone().into_bytes()),
                )
                .await?;
            assets.push(NewAsset::from_manifest(&asset, stored.hash));
        }
        let stale = self
            .metadata
            .commit_update_assets(update.id, &[], &assets, true)
            .await?;
        anyhow::ensure!(stale.is_empty(), "stale asset rows: {stale:?}");
        self.metadata
            .get_update(update.id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("update {} vanished", update.id))
    }
}

/// Builds manifest JSON the way an update server would send it.
pub struct ManifestBuilder {
    id: Uuid,
    commit_time: String,
    runtime_version: String,
    metadata: Value,
    assets: Vec<Value>,
}

impl ManifestBuilder {
    pub fn new(commit_time: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            commit_time: commit_time.to_string(),
            runtime_version: "1.0.0".to_string(),
            metadata: json!({}),
            assets: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn runtime_version(mut self, runtime_version: &str) -> Self {
        self.runtime_version = runtime_version.to_string();
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn remote_asset(mut self, key: &str, url: &str, body: &[u8], launch: bool) -> Self {
        self.assets.push(json!({
            "key": key,
            "url": url,
            "hash": hash_of(body),
            "contentType": "application/javascript",
            "isLaunchAsset": launch,
        }));
        self
    }

    pub fn embedded_asset(mut self, key: &str, locator: &str, body: &[u8], launch: bool) -> Self {
        self.assets.push(json!({
            "key": key,
            "embeddedLocator": locator,
            "hash": hash_of(body),
            "isLaunchAsset": launch,
        }));
        self
    }

    /// A remote asset on a CDN nobody serves, for updates stored directly.
    pub fn stored_asset(self, key: &str, launch: bool) -> Self {
        let url = format!("https://cdn.example.com/{key}");
        self.remote_asset(key, &url, key.as_bytes(), launch)
    }

    /// A remote asset whose declared hash does not match its body.
    pub fn remote_asset_with_hash(mut self, key: &str, url: &str, hash: &str) -> Self {
        self.assets.push(json!({
            "key": key,
            "url": url,
            "hash": hash,
            "isLaunchAsset": false,
        }));
        self
    }

    pub fn build(&self) -> Value {
        json!({
            "id": self.id,
            "commitTime": self.commit_time,
            "runtimeVersion": self.runtime_version,
            "metadata": self.metadata,
            "assets": self.assets,
        })
    }
}

/// Write an embedded package directory and open it.
pub fn write_embedded_package(
    root: &Path,
    manifest: &Value,
    files: &[(&str, &str)],
) -> anyhow::Result<Arc<EmbeddedPackage>> {
    std::fs::create_dir_all(root)?;
    std::fs::write(
        root.join(EMBEDDED_MANIFEST_FILE),
        serde_json::to_vec(manifest)?,
    )?;
    for (name, body) in files {
        std::fs::write(root.join(name), body)?;
    }
    Ok(Arc::new(EmbeddedPackage::new(root)))
}

/// Delegate that records what the task reports.
pub struct RecordingDelegate {
    accept_cached: bool,
    pub cached_seen: Mutex<Vec<Uuid>>,
    pub remote_started: AtomicBool,
    pub progress_calls: AtomicUsize,
    pub last_progress: Mutex<Option<LoadProgress>>,
    pub events: Mutex<Vec<BackgroundUpdateEvent>>,
}

impl RecordingDelegate {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self::new(true))
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self::new(false))
    }

    fn new(accept_cached: bool) -> Self {
        Self {
            accept_cached,
            cached_seen: Mutex::new(Vec::new()),
            remote_started: AtomicBool::new(false),
            progress_calls: AtomicUsize::new(0),
            last_progress: Mutex::new(None),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn take_events(&self) -> Vec<BackgroundUpdateEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl LoaderTaskDelegate for RecordingDelegate {
    fn on_cached_update_loaded(&self, update: &Update) -> bool {
        self.cached_seen.lock().unwrap().push(update.id);
        self.accept_cached
    }

    fn on_remote_update_started(&self) {
        self.remote_started.store(true, Ordering::SeqCst);
    }

    fn on_asset_progress(&self, progress: LoadProgress) {
        self.progress_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_progress.lock().unwrap() = Some(progress);
    }

    fn on_background_update_finished(&self, event: BackgroundUpdateEvent) {
        self.events.lock().unwrap().push(event);
    }
}
