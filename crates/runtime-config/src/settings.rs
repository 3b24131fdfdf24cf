//! Typed settings for every component
//!
//! Durations are stored as milliseconds so that configuration files and
//! environment variables stay plain numbers; accessors convert them.

use std::path::PathBuf;
use std::time::Duration;
use serde::{Deserialize, Serialize};

use common::error::Error;
use common::types::LogLevel;

/// Root settings object
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Download orchestrator settings
    pub download: DownloadConfiguration,
    /// Memory manager settings
    pub memory: MemoryConfiguration,
    /// Artifact storage layout
    pub storage: StorageConfiguration,
    /// Acquisition deadlines
    pub lifecycle: LifecycleConfiguration,
    /// Logging output
    pub logging: LoggingConfiguration,
}

impl Settings {
    /// Rejects values that would make a component misbehave
    pub fn validate(&self) -> Result<(), Error> {
        let download = &self.download;
        if download.max_concurrent_downloads == 0 {
            return Err(Error::Config("download.max_concurrent_downloads must be at least 1".into()));
        }
        if download.backoff_multiplier < 1.0 {
            return Err(Error::Config(format!(
                "download.backoff_multiplier must be >= 1.0, got {}",
                download.backoff_multiplier
            )));
        }
        if download.base_delay_ms > download.max_delay_ms {
            return Err(Error::Config(format!(
                "download.base_delay_ms ({}) exceeds download.max_delay_ms ({})",
                download.base_delay_ms, download.max_delay_ms
            )));
        }
        if download.chunk_size == 0 {
            return Err(Error::Config("download.chunk_size must be positive".into()));
        }

        let memory = &self.memory;
        if memory.ceiling > 0 && memory.safety_margin >= memory.ceiling {
            return Err(Error::Config(format!(
                "memory.safety_margin ({}) must be below memory.ceiling ({})",
                memory.safety_margin, memory.ceiling
            )));
        }
        if !(memory.ceiling_percent > 0.0 && memory.ceiling_percent <= 100.0) {
            return Err(Error::Config(format!(
                "memory.ceiling_percent must be in (0, 100], got {}",
                memory.ceiling_percent
            )));
        }
        if memory.pressure_margin_multiplier < 1.0 {
            return Err(Error::Config("memory.pressure_margin_multiplier must be >= 1.0".into()));
        }

        Ok(())
    }
}

/// Download orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfiguration {
    /// Maximum number of simultaneous file transfers
    pub max_concurrent_downloads: usize,
    /// Retries after the first attempt of a file
    pub retry_count: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Upper bound for any retry delay
    pub max_delay_ms: u64,
    /// Growth factor between consecutive retry delays
    pub backoff_multiplier: f64,
    /// Per-attempt timeout
    pub timeout_ms: u64,
    /// Whether checksums are verified
    pub verify_checksum: bool,
    /// Minimum number of bytes between progress callbacks
    pub chunk_size: u64,
    /// Minimum time between progress callbacks
    pub progress_interval_ms: u64,
    /// User agent sent with every request
    pub user_agent: String,
}

impl DownloadConfiguration {
    /// Delay before the first retry
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Upper bound for any retry delay
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Per-attempt timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Minimum time between progress callbacks
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

impl Default for DownloadConfiguration {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            retry_count: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            timeout_ms: 300_000,
            verify_checksum: true,
            chunk_size: 1024 * 1024,
            progress_interval_ms: 100,
            user_agent: format!("model-lifecycle/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Memory manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfiguration {
    /// Hard ceiling in bytes (0 = derive from system memory)
    pub ceiling: u64,
    /// Share of total system memory used when `ceiling` is 0
    pub ceiling_percent: f64,
    /// Headroom below the ceiling that is never allocated
    pub safety_margin: u64,
    /// Factor applied to the safety margin during a pressure sweep
    pub pressure_margin_multiplier: f64,
}

impl Default for MemoryConfiguration {
    fn default() -> Self {
        Self {
            ceiling: 0,
            ceiling_percent: 80.0,
            safety_margin: 256 * 1024 * 1024,
            pressure_margin_multiplier: 2.0,
        }
    }
}

/// Artifact storage layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfiguration {
    /// Directory holding verified model artifacts, one sub-directory per model
    pub models_dir: PathBuf,
    /// Directory for transient download and extraction work
    pub work_dir: PathBuf,
    /// Directory holding descriptor metadata for the file repository
    pub registry_dir: PathBuf,
}

impl Default for StorageConfiguration {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("model-lifecycle");
        Self {
            models_dir: base.join("models"),
            work_dir: base.join("work"),
            registry_dir: base.join("registry"),
        }
    }
}

/// Acquisition deadlines
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfiguration {
    /// Deadline for a whole acquisition (0 = none)
    pub acquisition_timeout_ms: u64,
    /// Deadline for each non-download stage (0 = none)
    pub stage_timeout_ms: u64,
}

impl LifecycleConfiguration {
    /// Deadline for a whole acquisition
    pub fn acquisition_timeout(&self) -> Option<Duration> {
        common::utils::optional_millis(self.acquisition_timeout_ms)
    }

    /// Deadline for each non-download stage
    pub fn stage_timeout(&self) -> Option<Duration> {
        common::utils::optional_millis(self.stage_timeout_ms)
    }
}

/// Logging output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfiguration {
    /// Default level when `RUST_LOG` is unset
    pub level: LogLevel,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
    /// Optional directory for daily-rolling log files
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json: false,
            directory: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let mut settings = Settings::default();
        settings.download.max_concurrent_downloads = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_margin_above_ceiling() {
        let mut settings = Settings::default();
        settings.memory.ceiling = 1024;
        settings.memory.safety_margin = 2048;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_shrinking_backoff() {
        let mut settings = Settings::default();
        settings.download.backoff_multiplier = 0.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_duration_accessors() {
        let download = DownloadConfiguration::default();
        assert_eq!(download.base_delay(), Duration::from_secs(1));
        assert_eq!(download.max_delay(), Duration::from_secs(30));
        assert_eq!(LifecycleConfiguration::default().stage_timeout(), None);
    }
}
