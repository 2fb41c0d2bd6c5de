//! Update loading and launch orchestration for updraft.
//!
//! This crate provides:
//! - Manifest and asset downloads with signature and hash checks
//! - Loaders that bring the embedded or a remote update into the store
//! - The launch race between the stored update and a fresh remote check
//! - Removal of updates and assets that are no longer needed

pub mod downloader;
pub mod embedded;
pub mod error;
pub mod error_recovery;
pub mod key_source;
pub mod launcher;
pub mod loading;
pub mod reaper;
pub mod remote;
pub mod task;

pub use downloader::{FetchedAsset, FileDownloader, ManifestRequestContext, ManifestResponse};
pub use embedded::{EMBEDDED_MANIFEST_FILE, EmbeddedLoader, EmbeddedPackage};
pub use error::{LoaderError, LoaderResult};
pub use error_recovery::FatalErrorLog;
pub use key_source::HttpKeySource;
pub use launcher::{Launch, Launcher};
pub use loading::{LoadOutcome, LoadProgress, LoaderContext};
pub use reaper::{ReapStats, Reaper};
pub use remote::{ProgressCallback, RemoteLoadOutcome, RemoteLoader};
pub use task::{BackgroundUpdateEvent, LoaderTask, LoaderTaskDelegate, NoopDelegate};
