//! Configuration management for the model lifecycle runtime
//!
//! This crate layers built-in defaults, an optional configuration file and
//! environment variables into typed settings for every component.

pub mod manager;
pub mod settings;

// Re-export commonly used types
pub use manager::ConfigManager;
pub use settings::{
    DownloadConfiguration, LifecycleConfiguration, LoggingConfiguration, MemoryConfiguration,
    Settings, StorageConfiguration,
};
