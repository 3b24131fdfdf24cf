//! Common types for the model lifecycle runtime
//!
//! This module defines the lifecycle stages shared by the orchestrator and its
//! error reports, and the log level used by configuration.

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

/// One discrete phase in turning a model identifier into a ready service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LifecycleStage {
    /// Registry lookup
    Discovery,
    /// Artifact retrieval over the network
    Downloading,
    /// Archive unpacking
    Extracting,
    /// Checksum, format and dependency checks
    Validating,
    /// Adapter selection and requirement checks
    Initializing,
    /// Memory admission and adapter load
    Loading,
}

impl LifecycleStage {
    /// All stages in execution order
    pub const ALL: [LifecycleStage; 6] = [
        LifecycleStage::Discovery,
        LifecycleStage::Downloading,
        LifecycleStage::Extracting,
        LifecycleStage::Validating,
        LifecycleStage::Initializing,
        LifecycleStage::Loading,
    ];

    /// Position of the stage in execution order
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Returns true if the stage retries transient failures on its own
    pub fn retries_transient_errors(&self) -> bool {
        matches!(self, LifecycleStage::Downloading)
    }
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleStage::Discovery => write!(f, "Discovery"),
            LifecycleStage::Downloading => write!(f, "Downloading"),
            LifecycleStage::Extracting => write!(f, "Extracting"),
            LifecycleStage::Validating => write!(f, "Validating"),
            LifecycleStage::Initializing => write!(f, "Initializing"),
            LifecycleStage::Loading => write!(f, "Loading"),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}
