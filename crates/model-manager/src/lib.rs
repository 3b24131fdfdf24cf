//! Model registry, downloads and validation for the model lifecycle runtime
//!
//! This crate provides the acquisition-side building blocks: where descriptors
//! live, how artifacts are fetched over unreliable networks and how they are
//! checked before anything is loaded.

pub mod downloader;
pub mod registry;
pub mod repository;
pub mod retry;
pub mod validation;

// Re-export commonly used types
pub use downloader::{
    BatchProgress, CompletedDownload, DownloadError, DownloadOrchestrator, DownloadProgress, DownloadStatus,
    DownloadTask,
};
pub use registry::ModelRegistry;
pub use repository::{FileRepository, InMemoryRepository, ModelRepository};
pub use retry::RetryPolicy;
pub use validation::{ValidationGate, ValidationResult};
