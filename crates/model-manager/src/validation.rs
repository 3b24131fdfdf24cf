//! Validation gate
//!
//! Checks run in a fixed order: checksum, format, dependencies. The first
//! hard error stops the run; warnings gathered up to that point are kept.

use std::collections::HashMap;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use common::error::LifecycleError;
use common::models::{ModelDescriptor, ModelFormat};
use common::utils::format_bytes;
use runtime_config::DownloadConfiguration;
use storage_adapter::{checksums_match, sha256_file};

/// Bytes read for magic-number checks
const HEADER_LEN: u64 = 16;

/// Relative size difference to `download_size` that raises a warning
const SIZE_TOLERANCE: f64 = 0.10;

/// Outcome of a validation run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<LifecycleError>,
    /// `detected_format`, `file_size` and `sha256` when computed
    pub metadata: HashMap<String, String>,
}

impl ValidationResult {
    /// The error that stopped validation
    pub fn first_error(&self) -> Option<&LifecycleError> {
        self.errors.first()
    }

    fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        debug!("Validation warning: {}", warning);
        self.warnings.push(warning);
    }

    fn fail(mut self, error: LifecycleError) -> Self {
        self.is_valid = false;
        self.errors.push(error);
        self
    }
}

/// How the format claim was confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormatEvidence {
    MagicBytes,
    ExtensionOnly,
}

/// Validation gate
#[derive(Debug, Clone)]
pub struct ValidationGate {
    verify_checksum: bool,
}

impl ValidationGate {
    pub fn new(verify_checksum: bool) -> Self {
        Self { verify_checksum }
    }

    pub fn from_config(config: &DownloadConfiguration) -> Self {
        Self::new(config.verify_checksum)
    }

    /// Validates the artifact at `local_path` against its descriptor
    pub async fn validate(&self, local_path: &Path, descriptor: &ModelDescriptor) -> ValidationResult {
        let mut result = ValidationResult {
            is_valid: true,
            ..ValidationResult::default()
        };

        let metadata = match tokio::fs::metadata(local_path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                return result.fail(LifecycleError::Io(format!("{}: {}", local_path.display(), e)));
            }
        };
        let file_size = metadata.len();
        result.metadata.insert("file_size".into(), file_size.to_string());

        if descriptor.download_size > 0 && metadata.is_file() {
            let expected = descriptor.download_size as f64;
            if (file_size as f64 - expected).abs() / expected > SIZE_TOLERANCE {
                result.warn(format!(
                    "file size {} differs from declared download size {}",
                    format_bytes(file_size),
                    format_bytes(descriptor.download_size)
                ));
            }
        }

        // checksum
        match (&descriptor.checksum, self.verify_checksum) {
            (Some(expected), true) if metadata.is_file() => {
                let actual = match sha256_file(local_path).await {
                    Ok(actual) => actual,
                    Err(e) => return result.fail(LifecycleError::Io(format!("hashing {}: {}", local_path.display(), e))),
                };
                result.metadata.insert("sha256".into(), actual.clone());
                if !checksums_match(expected, &actual) {
                    warn!("Checksum mismatch for {}: expected {}, got {}", descriptor.id, expected, actual);
                    return result.fail(LifecycleError::ChecksumMismatch {
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
            (Some(_), true) => result.warn("checksum not verified for a directory artifact"),
            (Some(_), false) => result.warn("checksum verification disabled"),
            (None, _) => result.warn("no checksum configured"),
        }

        // format
        match check_format(local_path, &metadata, descriptor.format).await {
            Ok(FormatEvidence::MagicBytes) => {}
            Ok(FormatEvidence::ExtensionOnly) => {
                result.warn(format!("{} format detected from the file extension only", descriptor.format))
            }
            Err(error) => return result.fail(error),
        }
        result
            .metadata
            .insert("detected_format".into(), descriptor.format.to_string());

        // dependencies
        let directory = local_path.parent().unwrap_or_else(|| Path::new("."));
        let mut missing = Vec::new();
        for required in &descriptor.requirements.required_files {
            if tokio::fs::metadata(directory.join(required)).await.is_err() {
                missing.push(required.clone());
            }
        }
        if !missing.is_empty() {
            return result.fail(LifecycleError::MissingDependency(missing));
        }

        info!(
            "Validated {} ({}, {} warning(s))",
            descriptor.id,
            format_bytes(file_size),
            result.warnings.len()
        );
        result
    }
}

async fn check_format(
    path: &Path,
    metadata: &std::fs::Metadata,
    format: ModelFormat,
) -> Result<FormatEvidence, LifecycleError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !format.artifact_extensions().contains(&extension.as_str()) {
        let found = ModelFormat::from_extension(&extension)
            .map(|other| format!(", looks like {}", other))
            .unwrap_or_default();
        return Err(LifecycleError::FormatInvalid(format!(
            "{} does not carry a {} extension{}",
            path.display(),
            format,
            found
        )));
    }

    if metadata.is_dir() {
        // compiled Core ML models are directories
        return if format == ModelFormat::CoreMl {
            Ok(FormatEvidence::ExtensionOnly)
        } else {
            Err(LifecycleError::FormatInvalid(format!("{} is a directory", path.display())))
        };
    }
    if metadata.len() == 0 {
        return Err(LifecycleError::FormatInvalid(format!("{} is empty", path.display())));
    }

    let header = read_header(path)
        .await
        .map_err(|e| LifecycleError::Io(format!("reading {}: {}", path.display(), e)))?;
    let invalid = |reason: &str| LifecycleError::FormatInvalid(format!("{}: {}", path.display(), reason));

    match format {
        ModelFormat::Gguf if header.starts_with(b"GGUF") => Ok(FormatEvidence::MagicBytes),
        ModelFormat::Gguf => Err(invalid("missing GGUF magic")),
        ModelFormat::TfLite if header.get(4..8) == Some(b"TFL3".as_slice()) => Ok(FormatEvidence::MagicBytes),
        ModelFormat::TfLite => Err(invalid("missing TFL3 identifier")),
        ModelFormat::SafeTensors => {
            // u64 little-endian JSON header length, then the JSON object
            let declared = header
                .get(..8)
                .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
                .map(u64::from_le_bytes)
                .ok_or_else(|| invalid("truncated safetensors header"))?;
            if declared == 0 || declared > metadata.len() - 8 || header.get(8) != Some(&b'{') {
                return Err(invalid("malformed safetensors header"));
            }
            Ok(FormatEvidence::MagicBytes)
        }
        ModelFormat::Onnx | ModelFormat::CoreMl | ModelFormat::Bin => Ok(FormatEvidence::ExtensionOnly),
    }
}

async fn read_header(path: &Path) -> std::io::Result<Vec<u8>> {
    let file = tokio::fs::File::open(path).await?;
    let mut header = Vec::with_capacity(HEADER_LEN as usize);
    file.take(HEADER_LEN).read_to_end(&mut header).await?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn descriptor(format: ModelFormat) -> ModelDescriptor {
        ModelDescriptor::new("m", "Model", format)
    }

    fn write(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn test_valid_gguf_with_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = b"GGUF\x03\x00\x00\x00tensor data";
        let path = write(&dir, "model.gguf", bytes);
        let mut model = descriptor(ModelFormat::Gguf);
        model.checksum = Some(hex::encode(Sha256::digest(bytes)));

        let result = ValidationGate::new(true).validate(&path, &model).await;

        assert!(result.is_valid, "{:?}", result.errors);
        assert!(result.warnings.is_empty());
        assert_eq!(result.metadata["detected_format"], "gguf");
        assert_eq!(result.metadata["file_size"], bytes.len().to_string());
        assert!(result.metadata.contains_key("sha256"));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        // bad magic too, but the checksum runs first
        let path = write(&dir, "model.gguf", b"corrupted");
        let mut model = descriptor(ModelFormat::Gguf);
        model.checksum = Some("ab".repeat(32));

        let result = ValidationGate::new(true).validate(&path, &model).await;

        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 1);
        assert!(matches!(result.first_error(), Some(LifecycleError::ChecksumMismatch { .. })));
    }

    #[tokio::test]
    async fn test_missing_checksum_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "model.gguf", b"GGUF....");

        let result = ValidationGate::new(true).validate(&path, &descriptor(ModelFormat::Gguf)).await;
        assert!(result.is_valid);
        assert_eq!(result.warnings, vec!["no checksum configured".to_string()]);

        let mut model = descriptor(ModelFormat::Gguf);
        model.checksum = Some("ab".repeat(32));
        let result = ValidationGate::new(false).validate(&path, &model).await;
        assert!(result.is_valid);
        assert_eq!(result.warnings, vec!["checksum verification disabled".to_string()]);
    }

    #[tokio::test]
    async fn test_format_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let wrong_magic = write(&dir, "model.gguf", b"ONNX-ish bytes");
        let wrong_extension = write(&dir, "model.bin", b"GGUF....");

        let gate = ValidationGate::new(true);
        let result = gate.validate(&wrong_magic, &descriptor(ModelFormat::Gguf)).await;
        assert!(matches!(result.first_error(), Some(LifecycleError::FormatInvalid(_))));
        assert_eq!(result.warnings.len(), 1);

        let result = gate.validate(&wrong_extension, &descriptor(ModelFormat::Gguf)).await;
        assert!(matches!(result.first_error(), Some(LifecycleError::FormatInvalid(_))));
    }

    #[tokio::test]
    async fn test_safetensors_header() {
        let dir = tempfile::tempdir().unwrap();
        let json = br#"{"__metadata__":{}}"#;
        let mut bytes = (json.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(json);
        let good = write(&dir, "model.safetensors", &bytes);
        let bad = write(&dir, "broken.safetensors", &[0xff; 12]);

        let gate = ValidationGate::new(true);
        assert!(gate.validate(&good, &descriptor(ModelFormat::SafeTensors)).await.is_valid);
        assert!(!gate.validate(&bad, &descriptor(ModelFormat::SafeTensors)).await.is_valid);
    }

    #[tokio::test]
    async fn test_extension_only_formats_warn() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "encoder.onnx", b"\x08\x07onnx");

        let result = ValidationGate::new(true).validate(&path, &descriptor(ModelFormat::Onnx)).await;
        assert!(result.is_valid);
        assert!(result.warnings.iter().any(|w| w.contains("extension only")));
    }

    #[tokio::test]
    async fn test_missing_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "encoder.onnx", b"\x08onnx");
        write(&dir, "tokens.txt", b"a b c");

        let mut model = descriptor(ModelFormat::Onnx);
        model.requirements.required_files = vec!["tokens.txt".into(), "decoder.onnx".into(), "joiner.onnx".into()];

        let result = ValidationGate::new(true).validate(&path, &model).await;
        assert_eq!(
            result.first_error(),
            Some(&LifecycleError::MissingDependency(vec![
                "decoder.onnx".to_string(),
                "joiner.onnx".to_string()
            ]))
        );
    }

    #[tokio::test]
    async fn test_size_drift_warning_and_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "model.gguf", b"GGUF....");
        let mut model = descriptor(ModelFormat::Gguf);
        model.download_size = 1_000;

        let result = ValidationGate::new(true).validate(&path, &model).await;
        assert!(result.is_valid);
        assert!(result.warnings.iter().any(|w| w.contains("differs")));

        let empty = write(&dir, "empty.gguf", b"");
        let result = ValidationGate::new(true).validate(&empty, &descriptor(ModelFormat::Gguf)).await;
        assert!(matches!(result.first_error(), Some(LifecycleError::FormatInvalid(_))));
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let result = ValidationGate::new(true)
            .validate(&dir.path().join("absent.gguf"), &descriptor(ModelFormat::Gguf))
            .await;
        assert!(matches!(result.first_error(), Some(LifecycleError::Io(_))));
    }
}
