//! Common data models for the model lifecycle runtime
//!
//! This module defines the model descriptor catalogued by the registry and the
//! small enums that describe formats, frameworks and admission priorities.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use chrono::{DateTime, Utc};

/// Descriptor of a known model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDescriptor {
    /// Unique identifier for the model
    pub id: String,
    /// Display name
    pub name: String,
    /// On-disk format of the model artifact
    pub format: ModelFormat,
    /// Framework that should run the model when available
    #[serde(default)]
    pub preferred_framework: Option<InferenceFramework>,
    /// Other frameworks able to run the model
    #[serde(default)]
    pub compatible_frameworks: Vec<InferenceFramework>,
    /// Estimated resident memory in bytes (0 = let the adapter estimate)
    #[serde(default)]
    pub memory_required: u64,
    /// Total download size in bytes
    #[serde(default)]
    pub download_size: u64,
    /// Hex-encoded SHA-256 of the canonical model file
    #[serde(default)]
    pub checksum: Option<String>,
    /// Location of the verified artifact once it exists locally
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    /// One URL per required file
    #[serde(default)]
    pub download_urls: Vec<String>,
    /// Host requirements
    #[serde(default)]
    pub requirements: ModelRequirements,
    /// Default admission priority
    #[serde(default)]
    pub priority: ModelPriority,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Creation timestamp
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last updated timestamp
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ModelDescriptor {
    /// Creates a descriptor with defaults for everything but id, name and format
    pub fn new(id: impl Into<String>, name: impl Into<String>, format: ModelFormat) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            format,
            preferred_framework: None,
            compatible_frameworks: Vec::new(),
            memory_required: 0,
            download_size: 0,
            checksum: None,
            local_path: None,
            download_urls: Vec::new(),
            requirements: ModelRequirements::default(),
            priority: ModelPriority::Normal,
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the descriptor points at an artifact that exists on disk
    pub fn is_available_locally(&self) -> bool {
        self.local_path.as_deref().map(Path::exists).unwrap_or(false)
    }

    /// Returns true if the model is split across several files
    pub fn is_multi_file(&self) -> bool {
        self.download_urls.len() > 1
    }

    /// Frameworks in the order they should be tried
    pub fn framework_preference(&self) -> Vec<InferenceFramework> {
        let mut order = Vec::with_capacity(self.compatible_frameworks.len() + 1);
        if let Some(preferred) = self.preferred_framework {
            order.push(preferred);
        }
        for framework in &self.compatible_frameworks {
            if !order.contains(framework) {
                order.push(*framework);
            }
        }
        order
    }
}

/// Host requirements of a model
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelRequirements {
    /// Minimum memory budget in bytes
    #[serde(default)]
    pub min_memory: u64,
    /// Capabilities the inference adapter must offer (e.g. "text-generation")
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    /// Companion files that must sit next to the model file
    #[serde(default)]
    pub required_files: Vec<String>,
}

/// On-disk model format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    /// GGUF (llama.cpp)
    Gguf,
    /// ONNX
    Onnx,
    /// SafeTensors
    SafeTensors,
    /// TensorFlow Lite
    TfLite,
    /// Core ML
    CoreMl,
    /// Opaque binary weights
    Bin,
}

impl ModelFormat {
    /// File extensions that identify an artifact of this format
    pub fn artifact_extensions(&self) -> &'static [&'static str] {
        match self {
            ModelFormat::Gguf => &["gguf"],
            ModelFormat::Onnx => &["onnx", "ort"],
            ModelFormat::SafeTensors => &["safetensors"],
            ModelFormat::TfLite => &["tflite"],
            ModelFormat::CoreMl => &["mlmodel", "mlpackage", "mlmodelc"],
            ModelFormat::Bin => &["bin"],
        }
    }

    /// Guesses the format from a file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        [
            ModelFormat::Gguf,
            ModelFormat::Onnx,
            ModelFormat::SafeTensors,
            ModelFormat::TfLite,
            ModelFormat::CoreMl,
            ModelFormat::Bin,
        ]
        .into_iter()
        .find(|format| format.artifact_extensions().contains(&ext.as_str()))
    }
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelFormat::Gguf => write!(f, "gguf"),
            ModelFormat::Onnx => write!(f, "onnx"),
            ModelFormat::SafeTensors => write!(f, "safetensors"),
            ModelFormat::TfLite => write!(f, "tflite"),
            ModelFormat::CoreMl => write!(f, "coreml"),
            ModelFormat::Bin => write!(f, "bin"),
        }
    }
}

/// Inference framework able to run a model
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InferenceFramework {
    /// llama.cpp
    LlamaCpp,
    /// ONNX Runtime
    OnnxRuntime,
    /// TensorFlow Lite
    TensorFlowLite,
    /// Core ML
    CoreMl,
    /// Candle
    Candle,
}

impl fmt::Display for InferenceFramework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferenceFramework::LlamaCpp => write!(f, "llama.cpp"),
            InferenceFramework::OnnxRuntime => write!(f, "onnxruntime"),
            InferenceFramework::TensorFlowLite => write!(f, "tflite"),
            InferenceFramework::CoreMl => write!(f, "coreml"),
            InferenceFramework::Candle => write!(f, "candle"),
        }
    }
}

/// Admission priority of a resident model
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ModelPriority {
    /// Low priority, evicted first
    Low,
    /// Normal priority
    #[default]
    Normal,
    /// High priority
    High,
    /// Critical priority, evicted only as a last resort
    Critical,
}

impl fmt::Display for ModelPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelPriority::Low => write!(f, "low"),
            ModelPriority::Normal => write!(f, "normal"),
            ModelPriority::High => write!(f, "high"),
            ModelPriority::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for ModelPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(ModelPriority::Low),
            "normal" => Ok(ModelPriority::Normal),
            "high" => Ok(ModelPriority::High),
            "critical" => Ok(ModelPriority::Critical),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}
