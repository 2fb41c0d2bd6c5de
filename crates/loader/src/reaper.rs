//! Removal of updates and asset files nothing retained still needs.

use crate::error::LoaderResult;
use crate::loading::LoaderContext;
use std::sync::Arc;
use updraft_core::{SelectionContext, SelectionPolicy, Update};
use updraft_storage::StorageError;
use uuid::Uuid;

/// What one reaper pass removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReapStats {
    pub updates_deleted: u64,
    pub asset_rows_deleted: u64,
    pub files_deleted: u64,
    /// Files that could not be removed. Their rows are already gone.
    pub file_errors: u64,
}

/// Deletes updates older than the launched one beyond the retention count,
/// then every asset no remaining update references.
pub struct Reaper {
    ctx: LoaderContext,
    policy: Arc<dyn SelectionPolicy>,
}

impl Reaper {
    pub fn new(ctx: LoaderContext, policy: Arc<dyn SelectionPolicy>) -> Self {
        Self { ctx, policy }
    }

    pub async fn reap(
        &self,
        launched: &Update,
        selection: &SelectionContext,
    ) -> LoaderResult<ReapStats> {
        let metadata = &self.ctx.metadata;
        let mut stats = ReapStats::default();

        let in_scope: Vec<Update> = metadata
            .all_updates()
            .await?
            .into_iter()
            .filter(|u| u.scope_key == launched.scope_key)
            .collect();
        let doomed: Vec<Uuid> = self
            .policy
            .select_updates_to_delete(&in_scope, launched, selection)
            .into_iter()
            .map(|u| u.id)
            .filter(|id| *id != launched.id)
            .collect();
        stats.updates_deleted = metadata.delete_updates(&doomed).await?;

        let unused = metadata.delete_unused_assets().await?;
        stats.asset_rows_deleted = unused.len() as u64;

        for asset in unused {
            match self.ctx.objects.delete(&asset.relative_path).await {
                Ok(()) => stats.files_deleted += 1,
                Err(StorageError::NotFound(_)) => {}
                Err(e) => {
                    stats.file_errors += 1;
                    tracing::warn!(
                        key = %asset.key,
                        path = %asset.relative_path,
                        error = %e,
                        "Failed to delete asset file"
                    );
                }
            }
        }

        tracing::info!(
            launched = %launched.id,
            updates_deleted = stats.updates_deleted,
            asset_rows_deleted = stats.asset_rows_deleted,
            files_deleted = stats.files_deleted,
            file_errors = stats.file_errors,
            "Reaper pass complete"
        );
        Ok(stats)
    }
}
