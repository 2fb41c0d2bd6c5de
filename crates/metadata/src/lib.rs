//! Persistence for downloaded updates.
//!
//! This crate provides the content store's data model:
//! - Update rows and their lifecycle status
//! - Asset rows shared between updates, keyed by asset key
//! - Links between updates and assets
//! - Scoped JSON side data (server-defined headers, manifest filters)

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use repos::{AssetRepo, JsonDataRepo, UpdateRepo};
pub use store::{MetadataStore, SqliteStore};

use std::sync::Arc;
use updraft_core::UpdatesConfig;

/// Open the metadata store described by configuration.
pub async fn from_config(config: &UpdatesConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    let store = SqliteStore::new(config.database_path()).await?;
    Ok(Arc::new(store) as Arc<dyn MetadataStore>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_from_config_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("updates.db");
        let config = UpdatesConfig {
            database_path: Some(db_path.clone()),
            ..UpdatesConfig::for_testing()
        };

        let store = from_config(&config).await.unwrap();
        assert!(store.all_updates().await.unwrap().is_empty());
        assert!(db_path.exists());
    }
}
