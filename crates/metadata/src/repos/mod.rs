//! Repository traits for metadata operations.

pub mod assets;
pub mod json_data;
pub mod updates;

pub use assets::AssetRepo;
pub use json_data::{JsonDataRepo, MANIFEST_FILTERS_KEY, SERVER_DEFINED_HEADERS_KEY};
pub use updates::UpdateRepo;
