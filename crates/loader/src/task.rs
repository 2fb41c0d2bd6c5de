//! Launch orchestration.
//!
//! A [`LoaderTask`] races the update already on disk against a fresh check
//! of the update server, bounded by the configured launch wait. Exactly one
//! outcome is handed to the host. Remote work that finishes afterwards is
//! reported as a background update and becomes a candidate for the next
//! launch.

use crate::downloader::{FileDownloader, ManifestRequestContext};
use crate::embedded::{EmbeddedLoader, EmbeddedPackage};
use crate::error::{LoaderError, LoaderResult};
use crate::error_recovery::FatalErrorLog;
use crate::launcher::{Launch, Launcher};
use crate::loading::{LoadProgress, LoaderContext};
use crate::reaper::{ReapStats, Reaper};
use crate::remote::{ProgressCallback, RemoteLoadOutcome, RemoteLoader};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use time::OffsetDateTime;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use updraft_core::{CheckOnLaunch, FilterAwarePolicy, SelectionContext, SelectionPolicy, Update};
use updraft_metadata::MetadataError;
use uuid::Uuid;

/// Result of a remote check that finished after the launch was decided.
#[derive(Debug)]
pub enum BackgroundUpdateEvent {
    Error(LoaderError),
    NoUpdateAvailable,
    /// Ready for the next launch.
    UpdateAvailable(Update),
    /// The server rolled back to the embedded update, which now carries the
    /// directive's commit time and launches next.
    RollBackToEmbedded(Update),
}

/// Host callbacks. Every method has a no-op default.
pub trait LoaderTaskDelegate: Send + Sync {
    /// Whether the update resolved from disk may launch. Returning false
    /// forces a remote check before the launch is decided.
    fn on_cached_update_loaded(&self, _update: &Update) -> bool {
        true
    }

    fn on_remote_update_started(&self) {}

    fn on_asset_progress(&self, _progress: LoadProgress) {}

    fn on_background_update_finished(&self, _event: BackgroundUpdateEvent) {}
}

/// Delegate that accepts every cached update and ignores notifications.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopDelegate;

impl LoaderTaskDelegate for NoopDelegate {}

type LaunchSender = oneshot::Sender<LoaderResult<Launch>>;

/// Single-assignment cell for the launch decision.
pub(crate) struct FinalizeGate {
    finalized: AtomicBool,
    sender: std::sync::Mutex<Option<LaunchSender>>,
    decided: watch::Sender<bool>,
}

impl FinalizeGate {
    pub(crate) fn new() -> (Self, oneshot::Receiver<LoaderResult<Launch>>) {
        let (sender, receiver) = oneshot::channel();
        let gate = Self {
            finalized: AtomicBool::new(false),
            sender: std::sync::Mutex::new(Some(sender)),
            decided: watch::Sender::new(false),
        };
        (gate, receiver)
    }

    /// Deliver the launch decision. Only the first call has an effect.
    pub(crate) fn finalize(&self, result: LoaderResult<Launch>) -> LoaderResult<()> {
        if self
            .finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(LoaderError::ContractViolation(
                "launch already finalized".to_string(),
            ));
        }
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender
            && sender.send(result).is_err()
        {
            tracing::debug!("Launch decided after the caller stopped waiting");
        }
        self.decided.send_replace(true);
        Ok(())
    }

    /// Changes once the launch is decided.
    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.decided.subscribe()
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct RaceState {
    timer_elapsed: bool,
    disk_done: bool,
    /// Disk result the delegate accepted.
    ready_launch: Option<Launch>,
    /// Disk result the delegate rejected, kept as a last resort.
    rejected_launch: Option<Launch>,
    disk_error: Option<LoaderError>,
    remote_started: bool,
    remote_done: bool,
}

/// What a finished remote check produced.
enum RemoteResult {
    NoUpdate,
    Update(Update),
    RolledBack(Update),
}

/// Decides which update launches. Single use.
pub struct LoaderTask {
    ctx: LoaderContext,
    downloader: FileDownloader,
    embedded: Option<Arc<EmbeddedPackage>>,
    policy: Arc<dyn SelectionPolicy>,
    delegate: Arc<dyn LoaderTaskDelegate>,
    fatal_errors: FatalErrorLog,
    gate: FinalizeGate,
    receiver: std::sync::Mutex<Option<oneshot::Receiver<LoaderResult<Launch>>>>,
    state: Mutex<RaceState>,
    /// Flips once the remote check has committed everything it will write.
    remote_finished: watch::Sender<bool>,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl LoaderTask {
    /// Validate configuration and build a task.
    ///
    /// Disabled updates and incomplete configuration fail here, before any
    /// asynchronous work starts.
    pub fn new(ctx: LoaderContext, delegate: Arc<dyn LoaderTaskDelegate>) -> LoaderResult<Self> {
        let config = ctx.config.clone();
        if !config.enabled {
            return Err(LoaderError::Config("updates are disabled".to_string()));
        }
        config.validate().map_err(LoaderError::Config)?;

        let runtime_version = ctx.runtime_version()?.to_string();
        let policy: Arc<dyn SelectionPolicy> = Arc::new(
            FilterAwarePolicy::new(runtime_version).with_retain_older(config.retain_older),
        );
        let downloader = FileDownloader::new(config.clone())?;
        let (gate, receiver) = FinalizeGate::new();

        Ok(Self {
            fatal_errors: FatalErrorLog::new(&config.updates_directory),
            ctx,
            downloader,
            embedded: None,
            policy,
            delegate,
            gate,
            receiver: std::sync::Mutex::new(Some(receiver)),
            state: Mutex::new(RaceState::default()),
            remote_finished: watch::Sender::new(false),
            background: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn with_embedded_package(mut self, package: Arc<EmbeddedPackage>) -> Self {
        self.embedded = Some(package);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn SelectionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_downloader(mut self, downloader: FileDownloader) -> Self {
        self.downloader = downloader;
        self
    }

    pub fn with_fatal_error_log(mut self, log: FatalErrorLog) -> Self {
        self.fatal_errors = log;
        self
    }

    /// Run the launch race and return the decided launch.
    ///
    /// Remote loading and the reaper may keep running afterwards; see
    /// [`LoaderTask::wait_for_background`].
    pub async fn run(self: &Arc<Self>) -> LoaderResult<Launch> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| {
                LoaderError::ContractViolation("loader task started more than once".to_string())
            })?;

        let check_remote = self.should_check_remote().await?;
        let wait = self.ctx.config.launch_wait();
        let timer_pending = check_remote && !wait.is_zero();
        self.state.lock().await.timer_elapsed = !timer_pending;

        if timer_pending {
            let task = self.clone();
            let mut decided = self.gate.subscribe();
            self.spawn_background(async move {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = decided.changed() => return,
                }
                let mut state = task.state.lock().await;
                state.timer_elapsed = true;
                tracing::debug!("Launch wait elapsed");
                task.maybe_finalize(&mut state);
            });
        }
        if check_remote {
            self.start_remote().await;
        }
        let task = self.clone();
        self.spawn_background(async move { task.resolve_disk().await });

        let result = receiver.await.map_err(|_| {
            LoaderError::ContractViolation("launch gate closed without a decision".to_string())
        })?;

        if let Ok(launch) = &result {
            let task = self.clone();
            let launched = launch.update.clone();
            self.spawn_background(async move {
                // The reaper must not delete rows a running remote load has
                // already resolved but not yet linked.
                let remote_started = task.state.lock().await.remote_started;
                if remote_started {
                    tracing::debug!("Reaper waiting for the remote check");
                    let mut finished = task.remote_finished.subscribe();
                    if finished.wait_for(|done| *done).await.is_err() {
                        return;
                    }
                }
                if let Err(e) = task.run_reaper(&launched).await {
                    tracing::warn!(error = %e, "Reaper failed");
                }
            });
        }
        result
    }

    /// Wait for timers, remote loads and the reaper started by [`run`].
    ///
    /// [`run`]: LoaderTask::run
    pub async fn wait_for_background(&self) {
        loop {
            let handles = std::mem::take(
                &mut *self
                    .background
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "Background task did not complete");
                }
            }
        }
    }

    /// Record that the launched update ran successfully.
    pub async fn mark_successful_launch(&self, update_id: Uuid) -> LoaderResult<()> {
        self.launcher().mark_successful_launch(update_id).await
    }

    /// Record that the launched update crashed before it could be marked
    /// successful.
    pub async fn mark_failed_launch(&self, update_id: Uuid) -> LoaderResult<()> {
        self.launcher().mark_failed_launch(update_id).await
    }

    /// Record a crash: the message is sent with the next manifest request
    /// and the update's failed launch count goes up.
    pub async fn record_fatal_error(
        &self,
        update_id: Option<Uuid>,
        message: &str,
    ) -> LoaderResult<()> {
        self.fatal_errors.record(message).await?;
        if let Some(update_id) = update_id {
            self.launcher().mark_failed_launch(update_id).await?;
        }
        Ok(())
    }

    /// Launch the embedded package directly, bypassing the store.
    pub async fn emergency_launch(&self) -> LoaderResult<Launch> {
        let package = self.embedded.as_ref().ok_or_else(|| {
            LoaderError::EmbeddedManifest("no embedded package configured".to_string())
        })?;
        package.emergency_launch(&self.ctx.scope_key()?).await
    }

    fn launcher(&self) -> Launcher {
        Launcher::new(self.ctx.clone(), self.policy.clone())
    }

    fn embedded_package(&self) -> Option<&Arc<EmbeddedPackage>> {
        self.embedded
            .as_ref()
            .filter(|_| self.ctx.config.has_embedded_update)
    }

    fn spawn_background<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    async fn should_check_remote(&self) -> LoaderResult<bool> {
        Ok(match self.ctx.config.check_on_launch {
            CheckOnLaunch::Always => true,
            CheckOnLaunch::Never => false,
            CheckOnLaunch::ErrorRecoveryOnly => self.fatal_errors.peek().await?.is_some(),
        })
    }

    // =========================================================================
    // Finalize
    // =========================================================================

    fn maybe_finalize(&self, state: &mut RaceState) {
        if self.gate.is_finalized() {
            return;
        }
        let remote_settled = !state.remote_started || state.remote_done;

        let result = if state.ready_launch.is_some() && (state.timer_elapsed || state.remote_done)
        {
            state.ready_launch.take().map(Ok)
        } else if state.disk_error.is_some() && (state.timer_elapsed || remote_settled) {
            state.disk_error.take().map(Err)
        } else if state.rejected_launch.is_some() && state.remote_done {
            state.rejected_launch.take().map(Ok)
        } else {
            None
        };

        if let Some(result) = result {
            self.finalize(result);
        }
    }

    fn finalize(&self, result: LoaderResult<Launch>) {
        match &result {
            Ok(launch) => tracing::info!(update_id = %launch.update.id, "Launch finalized"),
            Err(e) => tracing::warn!(error = %e, "Launch finalized with error"),
        }
        if let Err(e) = self.gate.finalize(result) {
            tracing::debug!(error = %e, "Ignoring late finalize");
        }
    }

    // =========================================================================
    // Disk
    // =========================================================================

    async fn resolve_disk(self: Arc<Self>) {
        let result = self.load_from_disk().await;

        let mut state = self.state.lock().await;
        state.disk_done = true;
        let mut needs_remote = false;
        match result {
            Ok(launch) => {
                if self.delegate.on_cached_update_loaded(&launch.update) {
                    state.ready_launch = Some(launch);
                } else {
                    tracing::info!(
                        update_id = %launch.update.id,
                        "Cached update rejected, checking for a remote update"
                    );
                    state.rejected_launch = Some(launch);
                    state.timer_elapsed = true;
                    needs_remote = !state.remote_started;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to resolve an update from disk");
                state.disk_error = Some(e);
            }
        }
        self.maybe_finalize(&mut state);
        drop(state);

        if needs_remote {
            self.start_remote().await;
        }
    }

    async fn load_from_disk(&self) -> LoaderResult<Launch> {
        let selection = self.ctx.selection_context().await?;
        if let Some(package) = self.embedded_package() {
            self.load_embedded_if_preferred(package, &selection).await?;
        }
        self.launcher().launch_best(&selection).await
    }

    async fn load_embedded_if_preferred(
        &self,
        package: &Arc<EmbeddedPackage>,
        selection: &SelectionContext,
    ) -> LoaderResult<()> {
        let scope_key = self.ctx.scope_key()?;
        let manifest = package.manifest().await?;
        let candidate = Update::from_manifest(manifest, &scope_key);
        let launchable = self.ctx.metadata.launchable_updates(&scope_key).await?;
        let current = self.policy.select_update_to_launch(&launchable, selection);
        if !self
            .policy
            .should_replace(&candidate, current.as_ref(), selection)
        {
            return Ok(());
        }

        let outcome = EmbeddedLoader::new(self.ctx.clone(), package.clone())
            .load()
            .await?;
        if !outcome.failed_assets.is_empty() {
            tracing::warn!(
                update_id = %outcome.update.id,
                failed = outcome.failed_assets.len(),
                "Embedded update incomplete"
            );
        }
        Ok(())
    }

    // =========================================================================
    // Remote
    // =========================================================================

    async fn start_remote(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if state.remote_started {
                return;
            }
            state.remote_started = true;
        }
        self.delegate.on_remote_update_started();

        let task = self.clone();
        self.spawn_background(async move {
            let result = task.load_remote().await;
            task.finish_remote(result).await;
        });
    }

    async fn load_remote(&self) -> LoaderResult<RemoteLoadOutcome> {
        let scope_key = self.ctx.scope_key()?;
        let selection = self.ctx.selection_context().await?;
        let launchable = self.ctx.metadata.launchable_updates(&scope_key).await?;
        let current = self.policy.select_update_to_launch(&launchable, &selection);

        let embedded_update_id = match self.embedded_package() {
            Some(package) => package.manifest().await.ok().map(|m| m.id),
            None => None,
        };
        let fatal_error = self.fatal_errors.peek().await?;
        let request = ManifestRequestContext {
            fatal_error: fatal_error.clone(),
            current_update_id: current.as_ref().map(|u| u.id),
            embedded_update_id,
            server_defined_headers: self.ctx.server_defined_headers().await?,
        };

        let mut loader = RemoteLoader::new(self.ctx.clone(), self.downloader.clone())
            .with_request_context(request);
        if let Some(package) = self.embedded_package() {
            loader = loader.with_embedded_package(package.clone());
        }

        let delegate = self.delegate.clone();
        let progress: ProgressCallback = Arc::new(move |p| delegate.on_asset_progress(p));
        let policy = self.policy.clone();
        let outcome = loader
            .start(
                move |manifest| {
                    let candidate = Update::from_manifest(manifest, &scope_key);
                    policy.should_replace(&candidate, current.as_ref(), &selection)
                },
                Some(progress),
            )
            .await?;

        if fatal_error.is_some() {
            self.fatal_errors.take().await?;
        }
        Ok(outcome)
    }

    async fn finish_remote(self: &Arc<Self>, result: LoaderResult<RemoteLoadOutcome>) {
        let result = match result {
            Ok(RemoteLoadOutcome::NoUpdateAvailable) => Ok(RemoteResult::NoUpdate),
            Ok(RemoteLoadOutcome::Loaded(outcome)) if outcome.is_ready() => {
                Ok(RemoteResult::Update(outcome.update))
            }
            Ok(RemoteLoadOutcome::Loaded(outcome)) => Err(LoaderError::IncompleteUpdate {
                update_id: outcome.update.id,
                failed_assets: outcome.failed_assets,
            }),
            Ok(RemoteLoadOutcome::RollBackToEmbedded { commit_time }) => self
                .apply_rollback(commit_time)
                .await
                .map(|update| update.map_or(RemoteResult::NoUpdate, RemoteResult::RolledBack)),
            Err(e) => Err(e),
        };

        let mut state = self.state.lock().await;
        state.remote_done = true;
        self.remote_finished.send_replace(true);

        if self.gate.is_finalized() {
            drop(state);
            let event = match result {
                Ok(RemoteResult::Update(update)) => BackgroundUpdateEvent::UpdateAvailable(update),
                Ok(RemoteResult::RolledBack(update)) => {
                    BackgroundUpdateEvent::RollBackToEmbedded(update)
                }
                Ok(RemoteResult::NoUpdate) => BackgroundUpdateEvent::NoUpdateAvailable,
                Err(e) => BackgroundUpdateEvent::Error(e),
            };
            tracing::info!(?event, "Remote check finished after launch");
            self.delegate.on_background_update_finished(event);
            return;
        }

        match result {
            Ok(RemoteResult::Update(update) | RemoteResult::RolledBack(update)) => {
                match self.launcher().launch_update(&update).await {
                    Ok(launch) => {
                        self.finalize(Ok(launch));
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(
                            update_id = %update.id,
                            error = %e,
                            "Remote update not launchable"
                        );
                    }
                }
            }
            Ok(RemoteResult::NoUpdate) => tracing::debug!("No remote update available"),
            Err(e) => tracing::warn!(error = %e, "Remote update failed"),
        }
        self.maybe_finalize(&mut state);
    }

    /// Act on a roll back directive: load the embedded update and restamp
    /// it with the directive's commit time so selection prefers it.
    ///
    /// Returns `None` when there is no embedded update or the policy keeps
    /// the current one.
    async fn apply_rollback(&self, commit_time: OffsetDateTime) -> LoaderResult<Option<Update>> {
        let Some(package) = self.embedded_package() else {
            tracing::info!("Ignoring roll back directive without an embedded update");
            return Ok(None);
        };
        let scope_key = self.ctx.scope_key()?;
        let selection = self.ctx.selection_context().await?;
        let embedded = Update::from_manifest(package.manifest().await?, &scope_key);
        let launchable = self.ctx.metadata.launchable_updates(&scope_key).await?;
        let current = self.policy.select_update_to_launch(&launchable, &selection);
        if !self
            .policy
            .should_apply_rollback(commit_time, &embedded, current.as_ref(), &selection)
        {
            tracing::info!(%commit_time, "Roll back directive does not apply");
            return Ok(None);
        }

        let outcome = EmbeddedLoader::new(self.ctx.clone(), package.clone())
            .load()
            .await?;
        if !outcome.is_ready() {
            return Err(LoaderError::IncompleteUpdate {
                update_id: outcome.update.id,
                failed_assets: outcome.failed_assets,
            });
        }
        let update_id = outcome.update.id;
        self.ctx
            .metadata
            .set_update_commit_time(update_id, commit_time)
            .await?;
        let update = self
            .ctx
            .metadata
            .get_update(update_id)
            .await?
            .ok_or_else(|| MetadataError::NotFound(update_id.to_string()))?;
        tracing::info!(update_id = %update_id, %commit_time, "Rolled back to embedded update");
        Ok(Some(update))
    }

    async fn run_reaper(&self, launched: &Update) -> LoaderResult<ReapStats> {
        let selection = self.ctx.selection_context().await?;
        Reaper::new(self.ctx.clone(), self.policy.clone())
            .reap(launched, &selection)
            .await
    }
}
