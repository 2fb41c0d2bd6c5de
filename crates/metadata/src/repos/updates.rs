//! Update repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use time::OffsetDateTime;
use updraft_core::Update;
use uuid::Uuid;

/// Repository for update rows.
#[async_trait]
pub trait UpdateRepo: Send + Sync {
    /// Get an update by ID.
    async fn get_update(&self, id: Uuid) -> MetadataResult<Option<Update>>;

    /// Insert a new update row.
    async fn insert_update(&self, update: &Update) -> MetadataResult<()>;

    /// Promote an update to READY and mark it as kept.
    async fn mark_update_ready(&self, id: Uuid) -> MetadataResult<()>;

    /// Overwrite the scope key of an existing update.
    async fn set_scope_key(&self, id: Uuid, scope_key: &str) -> MetadataResult<()>;

    /// Overwrite the commit time of an existing update.
    async fn set_update_commit_time(
        &self,
        id: Uuid,
        commit_time: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Every stored update, oldest first.
    async fn all_updates(&self) -> MetadataResult<Vec<Update>>;

    /// Updates in a scope whose status and launch history allow launching.
    ///
    /// Callers still need to confirm the launch asset file exists.
    async fn launchable_updates(&self, scope_key: &str) -> MetadataResult<Vec<Update>>;

    /// Record that an update was just launched.
    async fn mark_update_accessed(&self, id: Uuid) -> MetadataResult<()>;

    async fn increment_successful_launch_count(&self, id: Uuid) -> MetadataResult<()>;

    async fn increment_failed_launch_count(&self, id: Uuid) -> MetadataResult<()>;

    /// Delete update rows and their asset links. Asset rows are left alone.
    async fn delete_updates(&self, ids: &[Uuid]) -> MetadataResult<u64>;
}
