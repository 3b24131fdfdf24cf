//! Error types for the common crate
//!
//! This module defines the general infrastructure error used by configuration,
//! repositories and the CLI, and the lifecycle error taxonomy reported for
//! every failed model acquisition.

use thiserror::Error;

/// Result type for infrastructure operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for infrastructure operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Cause of a failed lifecycle stage.
///
/// Values are cheap to clone so that every observer of an acquisition
/// receives the same terminal cause.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// Transient network failure (connection lost, not connected, retryable status)
    #[error("network error: {0}")]
    Network(String),

    /// An operation exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// Artifact digest does not match the descriptor
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Artifact is not in the format the descriptor claims
    #[error("invalid model format: {0}")]
    FormatInvalid(String),

    /// Companion files required by the model are absent
    #[error("missing dependencies: {}", .0.join(", "))]
    MissingDependency(Vec<String>),

    /// Archive could not be unpacked or contained no model artifact
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    /// The memory budget cannot hold the model even after eviction
    #[error("insufficient memory: requested {requested} bytes, {available} bytes obtainable")]
    InsufficientMemory { requested: u64, available: u64 },

    /// The registry has no usable descriptor for the id
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// No inference adapter accepts the model
    #[error("no compatible inference adapter: {0}")]
    NoCompatibleAdapter(String),

    /// Model requirements cannot be met on this host
    #[error("requirements not met: {0}")]
    RequirementsNotMet(String),

    /// Local filesystem failure
    #[error("io error: {0}")]
    Io(String),

    /// Fatal download failure that is not a network condition (bad URL, bad status)
    #[error("download failed: {0}")]
    DownloadFailed(String),

    /// Broken internal invariant
    #[error("internal error: {0}")]
    Internal(String),

    /// The acquisition was cancelled by a caller
    #[error("cancelled")]
    Cancelled,
}

impl LifecycleError {
    /// Returns true for causes that a download attempt may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, LifecycleError::Network(_) | LifecycleError::Timeout(_))
    }

    /// Returns true if the acquisition was cancelled rather than failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LifecycleError::Cancelled)
    }
}

impl From<std::io::Error> for LifecycleError {
    fn from(err: std::io::Error) -> Self {
        LifecycleError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LifecycleError::Network("reset".into()).is_transient());
        assert!(LifecycleError::Timeout("attempt".into()).is_transient());
        assert!(!LifecycleError::FormatInvalid("bad magic".into()).is_transient());
        assert!(!LifecycleError::Cancelled.is_transient());
        assert!(LifecycleError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_missing_dependency_message_lists_items() {
        let err = LifecycleError::MissingDependency(vec!["tokens.txt".into(), "config.json".into()]);
        assert_eq!(err.to_string(), "missing dependencies: tokens.txt, config.json");
    }

    #[test]
    fn test_io_error_conversion() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(
            LifecycleError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk full")),
            LifecycleError::Io("disk full".into())
        );
    }
}
