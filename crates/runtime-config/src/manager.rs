//! Configuration manager
//!
//! Layers, from lowest to highest precedence: built-in defaults, an optional
//! configuration file (TOML, YAML or JSON, chosen by extension) and
//! `MODEL_LIFECYCLE__SECTION__KEY` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use common::error::Error;

use crate::settings::Settings;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "MODEL_LIFECYCLE";

/// Configuration manager shared by every component
#[derive(Debug, Clone)]
pub struct ConfigManager {
    /// Merged configuration tree
    config: Config,

    /// Typed view of the merged tree
    settings: Settings,

    /// File the configuration was read from, if any
    source_file: Option<PathBuf>,
}

impl ConfigManager {
    /// Creates a configuration manager from defaults and the environment
    pub fn new() -> Result<Self> {
        Self::build(None, true)
    }

    /// Creates a configuration manager that also reads `path`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(Some(path.as_ref()), true)
    }

    /// Creates a configuration manager from explicit settings, ignoring files and environment
    pub fn from_settings(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let config = Config::builder()
            .add_source(Config::try_from(&settings).context("serializing settings")?)
            .build()
            .context("building configuration")?;

        Ok(Self {
            config,
            settings,
            source_file: None,
        })
    }

    fn build(path: Option<&Path>, with_env: bool) -> Result<Self> {
        let defaults = Config::try_from(&Settings::default()).context("serializing default settings")?;
        let mut builder = Config::builder().add_source(defaults);

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::NotFound(format!("Configuration file not found: {}", path.display())).into());
            }
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(File::from(path).required(true));
        }

        if with_env {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config = builder.build().context("building configuration")?;
        let settings: Settings = config
            .clone()
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;

        debug!("Effective configuration: {:?}", settings);

        Ok(Self {
            config,
            settings,
            source_file: path.map(Path::to_path_buf),
        })
    }

    /// Typed settings
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// File the configuration was read from
    pub fn source_file(&self) -> Option<&Path> {
        self.source_file.as_deref()
    }

    /// Gets a value of any deserializable type by dotted key
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.config
            .get::<T>(key)
            .map_err(|e| Error::Config(format!("{}: {}", key, e)).into())
    }

    /// Gets a usize value
    pub fn get_usize(&self, key: &str) -> Result<usize> {
        self.get(key)
    }

    /// Gets a u64 value
    pub fn get_u64(&self, key: &str) -> Result<u64> {
        self.get(key)
    }

    /// Gets a f64 value
    pub fn get_f64(&self, key: &str) -> Result<f64> {
        self.get(key)
    }

    /// Gets a boolean value
    pub fn get_bool(&self, key: &str) -> Result<bool> {
        self.get(key)
    }

    /// Gets a path value
    pub fn get_path(&self, key: &str) -> Result<PathBuf> {
        self.get::<String>(key).map(PathBuf::from)
    }

    /// Gets a duration stored as milliseconds
    pub fn get_duration(&self, key: &str) -> Result<Duration> {
        self.get_u64(key).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let manager = ConfigManager::from_settings(Settings::default()).unwrap();
        assert_eq!(manager.get_usize("download.max_concurrent_downloads").unwrap(), 3);
        assert!(manager.get_bool("download.verify_checksum").unwrap());
        assert_eq!(manager.get_duration("download.base_delay_ms").unwrap(), Duration::from_secs(1));
        assert!(manager.source_file().is_none());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[download]\nmax_concurrent_downloads = 5\nretry_count = 7\n\n[memory]\nceiling = 1073741824\nsafety_margin = 0\n"
        )
        .unwrap();

        let manager = ConfigManager::from_file(file.path()).unwrap();
        let settings = manager.settings();
        assert_eq!(settings.download.max_concurrent_downloads, 5);
        assert_eq!(settings.download.retry_count, 7);
        assert_eq!(settings.memory.ceiling, 1_073_741_824);
        // untouched keys keep their defaults
        assert_eq!(settings.download.backoff_multiplier, 2.0);
        assert_eq!(manager.get_u64("memory.ceiling").unwrap(), 1_073_741_824);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(ConfigManager::from_file("/definitely/not/here.toml").is_err());
    }

    #[test]
    fn test_invalid_file_values_are_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[download]\nmax_concurrent_downloads = 0\n").unwrap();
        assert!(ConfigManager::from_file(file.path()).is_err());
    }
}
