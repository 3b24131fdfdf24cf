//! Artifact storage management for the model lifecycle runtime
//!
//! This crate owns the on-disk layout (verified model directories and
//! per-model working directories), archive extraction and SHA-256 helpers.

pub mod extraction;
pub mod integrity;
pub mod layout;

// Re-export commonly used types
pub use extraction::{find_model_artifact, select_extractor, ExtractionError, Extractor};
pub use integrity::{checksums_match, sha256_file};
pub use layout::{StorageLayout, Workspace};
