//! Core domain types for over-the-air update loading.
//!
//! This crate defines the data model shared by the other crates:
//! - Content hashes for stored assets
//! - Update manifests, signed envelopes, and manifest filters
//! - Stored updates and assets with their lifecycle status
//! - The selection policy deciding which update launches
//! - Subsystem configuration

pub mod config;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod selection;
pub mod update;

pub use config::{CheckOnLaunch, UpdatesConfig};
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher};
pub use manifest::{
    AssetSource, ManifestAsset, ManifestExtensions, ManifestFilters, SignedEnvelope,
    UpdateDirective, UpdateManifest,
};
pub use selection::{FilterAwarePolicy, SelectionContext, SelectionPolicy};
pub use update::{Asset, NewAsset, Update, UpdateStatus, asset_relative_path};

/// Protocol version sent with manifest requests.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum length of a recorded fatal error sent to the update server.
pub const MAX_FATAL_ERROR_LEN: usize = 1024;
