//! Loader error types.

use thiserror::Error;
use updraft_metadata::MetadataError;
use updraft_signer::SignerError;
use updraft_storage::StorageError;
use uuid::Uuid;

/// Errors raised while loading or launching updates.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] updraft_core::Error),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("signer error: {0}")]
    Signer(#[from] SignerError),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected HTTP status {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("multipart response error: {0}")]
    Multipart(String),

    #[error("manifest verification failed: {0}")]
    Verification(String),

    #[error("embedded manifest error: {0}")]
    EmbeddedManifest(String),

    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("update {update_id} incomplete: {} asset(s) failed", .failed_assets.len())]
    IncompleteUpdate {
        update_id: Uuid,
        failed_assets: Vec<String>,
    },

    #[error("no launchable update")]
    NoLaunchableUpdate,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoaderError {
    /// Whether the error came from a broken caller contract.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::ContractViolation(_))
    }
}

/// Result type for loader operations.
pub type LoaderResult<T> = std::result::Result<T, LoaderError>;
