//! Asset file storage for updraft.
//!
//! This crate provides:
//! - An object store abstraction keyed by store-relative file names
//! - Atomic writes that hash bytes as they are written
//! - A local filesystem backend

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemBackend;
pub use error::{StorageError, StorageResult};
pub use traits::{ByteStream, ObjectStore, StoredObject, StreamingUpload};

use std::sync::Arc;
use updraft_core::UpdatesConfig;

/// Create the asset store described by configuration.
pub async fn from_config(config: &UpdatesConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    let backend = FilesystemBackend::new(&config.updates_directory).await?;
    Ok(Arc::new(backend))
}
