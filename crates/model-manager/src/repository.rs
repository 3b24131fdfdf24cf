//! Model descriptor repositories
//!
//! A repository is the durable home of model descriptors. The registry keeps a
//! cache in front of it; repositories themselves do no caching.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use common::models::ModelDescriptor;
use storage_adapter::StorageLayout;

/// File holding a descriptor inside its model directory
pub const METADATA_FILE: &str = "metadata.json";

/// Durable store of model descriptors
#[async_trait]
pub trait ModelRepository: Send + Sync {
    /// Fetches a descriptor; `Ok(None)` when the id is unknown
    async fn fetch(&self, model_id: &str) -> Result<Option<ModelDescriptor>>;

    /// Inserts or replaces a descriptor
    async fn save(&self, descriptor: &ModelDescriptor) -> Result<()>;

    /// Lists every stored descriptor
    async fn list(&self) -> Result<Vec<ModelDescriptor>>;
}

/// Repository kept in process memory
#[derive(Default)]
pub struct InMemoryRepository {
    models: RwLock<HashMap<String, ModelDescriptor>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a repository pre-populated with descriptors
    pub fn with_models(models: impl IntoIterator<Item = ModelDescriptor>) -> Self {
        let models = models.into_iter().map(|model| (model.id.clone(), model)).collect();
        Self {
            models: RwLock::new(models),
        }
    }
}

#[async_trait]
impl ModelRepository for InMemoryRepository {
    async fn fetch(&self, model_id: &str) -> Result<Option<ModelDescriptor>> {
        Ok(self.models.read().get(model_id).cloned())
    }

    async fn save(&self, descriptor: &ModelDescriptor) -> Result<()> {
        self.models.write().insert(descriptor.id.clone(), descriptor.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ModelDescriptor>> {
        let mut models: Vec<ModelDescriptor> = self.models.read().values().cloned().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }
}

/// Repository storing one `metadata.json` per model directory
pub struct FileRepository {
    root: PathBuf,
}

impl FileRepository {
    /// Creates a repository rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating repository directory {}", root.display()))?;
        info!("Model repository at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn metadata_path(&self, model_id: &str) -> PathBuf {
        self.root.join(StorageLayout::namespace(model_id)).join(METADATA_FILE)
    }

    async fn read_descriptor(path: &Path) -> Result<ModelDescriptor> {
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))
    }
}

#[async_trait]
impl ModelRepository for FileRepository {
    async fn fetch(&self, model_id: &str) -> Result<Option<ModelDescriptor>> {
        let path = self.metadata_path(model_id);
        if tokio::fs::metadata(&path).await.is_err() {
            return Ok(None);
        }

        let descriptor = Self::read_descriptor(&path).await?;
        if descriptor.id != model_id {
            warn!(
                "{} holds descriptor {} instead of {}",
                path.display(),
                descriptor.id,
                model_id
            );
            return Ok(None);
        }
        Ok(Some(descriptor))
    }

    async fn save(&self, descriptor: &ModelDescriptor) -> Result<()> {
        let path = self.metadata_path(&descriptor.id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(descriptor)?;
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, json).await?;
        tokio::fs::rename(&staging, &path).await?;

        debug!("Saved descriptor {} to {}", descriptor.id, path.display());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ModelDescriptor>> {
        let mut models = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join(METADATA_FILE);
            if tokio::fs::metadata(&path).await.is_err() {
                continue;
            }
            match Self::read_descriptor(&path).await {
                Ok(descriptor) => models.push(descriptor),
                Err(e) => warn!("Skipping unreadable descriptor: {:#}", e),
            }
        }

        models.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(models)
    }
}
