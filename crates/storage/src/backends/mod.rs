//! Storage backend implementations.

pub mod filesystem;
