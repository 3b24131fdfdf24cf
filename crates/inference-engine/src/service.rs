//! Loaded model handle

use std::fmt;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use memmap2::Mmap;
use parking_lot::RwLock;
use tracing::debug;

use common::models::InferenceFramework;

/// A model mapped into memory by an inference adapter
///
/// The mapping is dropped by [`ModelService::release`]; the handle itself may
/// outlive it, in which case it reports itself as released.
pub struct ModelService {
    /// Model id
    model_id: String,

    /// Framework that loaded the model
    framework: InferenceFramework,

    /// Artifact the mapping was created from
    path: PathBuf,

    /// Mapped bytes
    mapped_len: u64,

    /// Load timestamp
    loaded_at: DateTime<Utc>,

    /// Memory mapping, `None` once released
    mapping: RwLock<Option<Mmap>>,
}

impl ModelService {
    pub(crate) fn new(model_id: &str, framework: InferenceFramework, path: &Path, mapping: Mmap) -> Self {
        Self {
            model_id: model_id.to_string(),
            framework,
            path: path.to_path_buf(),
            mapped_len: mapping.len() as u64,
            loaded_at: Utc::now(),
            mapping: RwLock::new(Some(mapping)),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn framework(&self) -> InferenceFramework {
        self.framework
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mapped_len(&self) -> u64 {
        self.mapped_len
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Returns true once the mapping has been dropped
    pub fn is_released(&self) -> bool {
        self.mapping.read().is_none()
    }

    /// Copies the first `len` bytes of the mapping, or `None` once released
    pub fn header(&self, len: usize) -> Option<Vec<u8>> {
        self.mapping
            .read()
            .as_ref()
            .map(|mapping| mapping[..len.min(mapping.len())].to_vec())
    }

    /// Drops the mapping; returns false if it was already released
    pub fn release(&self) -> bool {
        let released = self.mapping.write().take().is_some();
        if released {
            debug!("Unmapped {} ({})", self.model_id, self.path.display());
        }
        released
    }
}

impl fmt::Debug for ModelService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelService")
            .field("model_id", &self.model_id)
            .field("framework", &self.framework)
            .field("path", &self.path)
            .field("mapped_len", &self.mapped_len)
            .field("released", &self.is_released())
            .finish()
    }
}
