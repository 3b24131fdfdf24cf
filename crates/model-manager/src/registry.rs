//! Model registry
//!
//! Read-through cache of descriptors in front of a [`ModelRepository`].

use std::path::Path;
use std::sync::Arc;
use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info};

use common::error::Error;
use common::models::ModelDescriptor;

use crate::repository::ModelRepository;

/// Model registry
pub struct ModelRegistry {
    /// Descriptors seen so far
    cache: DashMap<String, ModelDescriptor>,

    /// Backing store
    repository: Arc<dyn ModelRepository>,
}

impl ModelRegistry {
    pub fn new(repository: Arc<dyn ModelRepository>) -> Self {
        Self {
            cache: DashMap::new(),
            repository,
        }
    }

    /// Looks a descriptor up, cache first
    pub async fn fetch(&self, model_id: &str) -> Result<Option<ModelDescriptor>> {
        if let Some(descriptor) = self.cache.get(model_id) {
            return Ok(Some(descriptor.clone()));
        }

        let descriptor = self.repository.fetch(model_id).await?;
        if let Some(descriptor) = &descriptor {
            debug!("Registry cache filled for {}", model_id);
            self.cache.insert(model_id.to_string(), descriptor.clone());
        }
        Ok(descriptor)
    }

    /// Adds or replaces a descriptor
    pub async fn register(&self, mut descriptor: ModelDescriptor) -> Result<()> {
        if descriptor.id.trim().is_empty() {
            return Err(Error::InvalidArgument("model id must not be empty".into()).into());
        }

        descriptor.updated_at = Utc::now();
        self.repository.save(&descriptor).await?;
        info!("Registered model {} ({})", descriptor.id, descriptor.format);
        self.cache.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    /// Records where the verified artifact of a model now lives
    pub async fn update_local_path(&self, model_id: &str, local_path: &Path) -> Result<ModelDescriptor> {
        let mut descriptor = self
            .fetch(model_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Model not found: {}", model_id)))?;

        descriptor.local_path = Some(local_path.to_path_buf());
        descriptor.updated_at = Utc::now();
        self.repository.save(&descriptor).await?;
        self.cache.insert(model_id.to_string(), descriptor.clone());

        debug!("Model {} available at {}", model_id, local_path.display());
        Ok(descriptor)
    }

    /// Lists every descriptor in the backing store
    pub async fn list(&self) -> Result<Vec<ModelDescriptor>> {
        let models = self.repository.list().await?;
        for model in &models {
            self.cache.insert(model.id.clone(), model.clone());
        }
        Ok(models)
    }

    /// Drops a cached descriptor so the next fetch reads the repository
    pub fn invalidate(&self, model_id: &str) -> bool {
        self.cache.remove(model_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use common::models::ModelFormat;
    use crate::repository::InMemoryRepository;

    #[tokio::test]
    async fn test_fetch_reads_through_to_repository() {
        let repository = Arc::new(InMemoryRepository::with_models([ModelDescriptor::new(
            "m",
            "Model",
            ModelFormat::Gguf,
        )]));
        let registry = ModelRegistry::new(repository.clone());

        assert!(registry.fetch("m").await.unwrap().is_some());
        assert!(registry.fetch("unknown").await.unwrap().is_none());

        // the cache answers even after the backing entry changes
        let mut changed = ModelDescriptor::new("m", "Changed", ModelFormat::Gguf);
        changed.download_size = 1;
        repository.save(&changed).await.unwrap();
        assert_eq!(registry.fetch("m").await.unwrap().unwrap().name, "Model");

        assert!(registry.invalidate("m"));
        assert_eq!(registry.fetch("m").await.unwrap().unwrap().name, "Changed");
    }

    #[tokio::test]
    async fn test_update_local_path_persists() {
        let repository = Arc::new(InMemoryRepository::new());
        let registry = ModelRegistry::new(repository.clone());
        registry
            .register(ModelDescriptor::new("m", "Model", ModelFormat::Onnx))
            .await
            .unwrap();

        let path = PathBuf::from("/models/m/model.onnx");
        registry.update_local_path("m", &path).await.unwrap();

        let stored = repository.fetch("m").await.unwrap().unwrap();
        assert_eq!(stored.local_path, Some(path));
        assert!(registry.update_local_path("missing", Path::new("/x")).await.is_err());
    }

    #[tokio::test]
    async fn test_register_rejects_empty_id() {
        let registry = ModelRegistry::new(Arc::new(InMemoryRepository::new()));
        assert!(registry
            .register(ModelDescriptor::new(" ", "Blank", ModelFormat::Gguf))
            .await
            .is_err());
    }
}
