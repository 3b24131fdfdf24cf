//! Inference framework adapters
//!
//! Adapters form a closed set. Loading memory-maps the artifact and checks its
//! header; actual inference is out of scope for the lifecycle runtime.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, info};

use common::error::LifecycleError;
use common::models::{InferenceFramework, ModelDescriptor, ModelFormat};

use crate::service::ModelService;

/// Adapter errors
#[derive(Error, Debug)]
pub enum AdapterError {
    /// No adapter accepts the model
    #[error("no adapter for {model_id} ({format})")]
    Unsupported { model_id: String, format: ModelFormat },

    /// The artifact could not be opened or mapped
    #[error("cannot map {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The artifact header does not match the framework
    #[error("{framework} rejected {path}: {reason}")]
    InvalidHeader {
        framework: InferenceFramework,
        path: PathBuf,
        reason: String,
    },
}

impl From<AdapterError> for LifecycleError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Unsupported { .. } => LifecycleError::NoCompatibleAdapter(err.to_string()),
            AdapterError::Io { .. } => LifecycleError::Io(err.to_string()),
            AdapterError::InvalidHeader { .. } => LifecycleError::FormatInvalid(err.to_string()),
        }
    }
}

/// Inference adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InferenceAdapter {
    /// llama.cpp for GGUF language models
    LlamaCpp,
    /// ONNX Runtime for speech and embedding models
    OnnxRuntime,
    /// TensorFlow Lite for small vision and audio models
    TensorFlowLite,
}

impl InferenceAdapter {
    /// Every adapter, in default selection order
    pub const ALL: [InferenceAdapter; 3] = [
        InferenceAdapter::LlamaCpp,
        InferenceAdapter::OnnxRuntime,
        InferenceAdapter::TensorFlowLite,
    ];

    /// Adapter implementing a framework, if any
    pub fn for_framework(framework: InferenceFramework) -> Option<Self> {
        Self::ALL.into_iter().find(|adapter| adapter.framework() == framework)
    }

    pub fn framework(&self) -> InferenceFramework {
        match self {
            InferenceAdapter::LlamaCpp => InferenceFramework::LlamaCpp,
            InferenceAdapter::OnnxRuntime => InferenceFramework::OnnxRuntime,
            InferenceAdapter::TensorFlowLite => InferenceFramework::TensorFlowLite,
        }
    }

    /// Formats the adapter can load
    pub fn supported_formats(&self) -> &'static [ModelFormat] {
        match self {
            InferenceAdapter::LlamaCpp => &[ModelFormat::Gguf],
            InferenceAdapter::OnnxRuntime => &[ModelFormat::Onnx],
            InferenceAdapter::TensorFlowLite => &[ModelFormat::TfLite],
        }
    }

    /// Capabilities the adapter offers
    pub fn capabilities(&self) -> &'static [&'static str] {
        match self {
            InferenceAdapter::LlamaCpp => &["text-generation", "chat", "embeddings"],
            InferenceAdapter::OnnxRuntime => &["speech-to-text", "text-to-speech", "embeddings", "classification"],
            InferenceAdapter::TensorFlowLite => &["classification", "vision", "audio"],
        }
    }

    /// Resident size relative to the artifact size
    fn overhead_factor(&self) -> f64 {
        match self {
            InferenceAdapter::LlamaCpp => 1.2,
            InferenceAdapter::OnnxRuntime => 1.5,
            InferenceAdapter::TensorFlowLite => 1.1,
        }
    }

    /// Returns true if the adapter can load the descriptor's format
    pub fn can_handle(&self, descriptor: &ModelDescriptor) -> bool {
        self.supported_formats().contains(&descriptor.format)
    }

    /// Estimated resident size in bytes
    ///
    /// The descriptor's figure wins when set; otherwise the artifact size is
    /// scaled by the framework's overhead factor.
    pub fn estimate_memory_usage(&self, descriptor: &ModelDescriptor, path: &Path) -> Result<u64, AdapterError> {
        if descriptor.memory_required > 0 {
            return Ok(descriptor.memory_required);
        }

        let size = std::fs::metadata(path)
            .map_err(|source| AdapterError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        let estimate = (size as f64 * self.overhead_factor()).ceil() as u64;
        debug!("{} estimates {} bytes for {}", self, estimate, descriptor.id);
        Ok(estimate)
    }

    /// Maps the artifact and checks its header
    ///
    /// Blocking; run it on the blocking pool.
    pub fn load_model(&self, descriptor: &ModelDescriptor, path: &Path) -> Result<ModelService, AdapterError> {
        if !self.can_handle(descriptor) {
            return Err(AdapterError::Unsupported {
                model_id: descriptor.id.clone(),
                format: descriptor.format,
            });
        }

        let file = File::open(path).map_err(|source| AdapterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let len = file
            .metadata()
            .map_err(|source| AdapterError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        if len == 0 {
            return Err(self.invalid_header(path, "empty file"));
        }

        // SAFETY: model files are installed once and never modified while mapped.
        let mapping = unsafe { Mmap::map(&file) }.map_err(|source| AdapterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.check_header(&mapping, path)?;

        info!("{} loaded {} ({} bytes mapped)", self, descriptor.id, mapping.len());

        Ok(ModelService::new(&descriptor.id, self.framework(), path, mapping))
    }

    /// Releases a loaded model
    pub fn release(&self, service: &ModelService) {
        if service.release() {
            info!("{} released {}", self, service.model_id());
        }
    }

    fn check_header(&self, bytes: &[u8], path: &Path) -> Result<(), AdapterError> {
        match self {
            InferenceAdapter::LlamaCpp if !bytes.starts_with(b"GGUF") => {
                Err(self.invalid_header(path, "missing GGUF magic"))
            }
            // a serialized ModelProto opens with the ir_version field
            InferenceAdapter::OnnxRuntime if bytes[0] != 0x08 => {
                Err(self.invalid_header(path, "not a serialized ONNX model"))
            }
            InferenceAdapter::TensorFlowLite if bytes.get(4..8) != Some(b"TFL3".as_slice()) => {
                Err(self.invalid_header(path, "missing TFL3 identifier"))
            }
            _ => Ok(()),
        }
    }

    fn invalid_header(&self, path: &Path, reason: &str) -> AdapterError {
        AdapterError::InvalidHeader {
            framework: self.framework(),
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for InferenceAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.framework())
    }
}

/// The adapters available to the runtime
#[derive(Debug, Clone)]
pub struct AdapterSet {
    adapters: Vec<InferenceAdapter>,
}

impl Default for AdapterSet {
    fn default() -> Self {
        Self::new(InferenceAdapter::ALL.to_vec())
    }
}

impl AdapterSet {
    pub fn new(adapters: Vec<InferenceAdapter>) -> Self {
        Self { adapters }
    }

    pub fn adapters(&self) -> &[InferenceAdapter] {
        &self.adapters
    }

    /// Picks the adapter for a model
    ///
    /// The preferred framework is tried first, then the compatible frameworks
    /// in order, then any adapter that can handle the format.
    pub fn select(&self, descriptor: &ModelDescriptor) -> Result<InferenceAdapter, AdapterError> {
        let preferred = descriptor
            .framework_preference()
            .into_iter()
            .filter_map(InferenceAdapter::for_framework)
            .filter(|adapter| self.adapters.contains(adapter));

        preferred
            .chain(self.adapters.iter().copied())
            .find(|adapter| adapter.can_handle(descriptor))
            .ok_or_else(|| AdapterError::Unsupported {
                model_id: descriptor.id.clone(),
                format: descriptor.format,
            })
    }

    /// Union of the capabilities of every adapter
    pub fn capabilities(&self) -> Vec<&'static str> {
        let mut capabilities: Vec<&'static str> = self
            .adapters
            .iter()
            .flat_map(|adapter| adapter.capabilities().iter().copied())
            .collect();
        capabilities.sort_unstable();
        capabilities.dedup();
        capabilities
    }

    /// Returns true if some adapter offers the capability
    pub fn supports_capability(&self, capability: &str) -> bool {
        self.adapters
            .iter()
            .any(|adapter| adapter.capabilities().contains(&capability))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(format: ModelFormat) -> ModelDescriptor {
        ModelDescriptor::new("m", "Model", format)
    }

    fn write_artifact(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_selection_prefers_declared_framework() {
        let set = AdapterSet::default();
        let mut model = descriptor(ModelFormat::Onnx);
        model.preferred_framework = Some(InferenceFramework::LlamaCpp);
        model.compatible_frameworks = vec![InferenceFramework::OnnxRuntime];

        // llama.cpp is preferred but cannot handle onnx
        assert_eq!(set.select(&model).unwrap(), InferenceAdapter::OnnxRuntime);
    }

    #[test]
    fn test_selection_falls_back_to_format() {
        let set = AdapterSet::default();
        assert_eq!(set.select(&descriptor(ModelFormat::TfLite)).unwrap(), InferenceAdapter::TensorFlowLite);

        let err = set.select(&descriptor(ModelFormat::SafeTensors)).unwrap_err();
        assert!(matches!(
            LifecycleError::from(err),
            LifecycleError::NoCompatibleAdapter(_)
        ));
    }

    #[test]
    fn test_selection_respects_available_adapters() {
        let set = AdapterSet::new(vec![InferenceAdapter::OnnxRuntime]);
        assert!(set.select(&descriptor(ModelFormat::Gguf)).is_err());
        assert!(set.supports_capability("speech-to-text"));
        assert!(!set.supports_capability("text-generation"));
    }

    #[test]
    fn test_estimate_uses_descriptor_or_overhead() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(&dir, "m.gguf", &[0u8; 1000]);

        let mut model = descriptor(ModelFormat::Gguf);
        assert_eq!(InferenceAdapter::LlamaCpp.estimate_memory_usage(&model, &path).unwrap(), 1200);
        assert_eq!(InferenceAdapter::OnnxRuntime.estimate_memory_usage(&model, &path).unwrap(), 1500);

        model.memory_required = 42;
        assert_eq!(InferenceAdapter::LlamaCpp.estimate_memory_usage(&model, &path).unwrap(), 42);
    }

    #[test]
    fn test_load_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(&dir, "m.gguf", b"GGUF\x03\x00\x00\x00weights");

        let adapter = InferenceAdapter::LlamaCpp;
        let service = adapter.load_model(&descriptor(ModelFormat::Gguf), &path).unwrap();
        assert_eq!(service.framework(), InferenceFramework::LlamaCpp);
        assert_eq!(service.header(4).unwrap(), b"GGUF");
        assert!(!service.is_released());

        adapter.release(&service);
        assert!(service.is_released());
        assert!(service.header(4).is_none());
        assert!(!service.release());
    }

    #[test]
    fn test_load_rejects_bad_header() {
        let dir = tempfile::tempdir().unwrap();
        let gguf = write_artifact(&dir, "bad.gguf", b"not a gguf file");
        let tflite = write_artifact(&dir, "m.tflite", b"\x1c\x00\x00\x00TFL3rest");

        let err = InferenceAdapter::LlamaCpp
            .load_model(&descriptor(ModelFormat::Gguf), &gguf)
            .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidHeader { .. }));

        assert!(InferenceAdapter::TensorFlowLite
            .load_model(&descriptor(ModelFormat::TfLite), &tflite)
            .is_ok());
    }

    #[test]
    fn test_load_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_artifact(&dir, "m.onnx", b"");
        let err = InferenceAdapter::OnnxRuntime
            .load_model(&descriptor(ModelFormat::Onnx), &path)
            .unwrap_err();
        assert!(matches!(LifecycleError::from(err), LifecycleError::FormatInvalid(_)));
    }
}
