//! Model lifecycle runtime
//!
//! Assembles the registry, download orchestrator, validation gate, memory
//! manager and inference adapters from configuration and exposes the
//! lifecycle operations of the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::BoxStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use common::models::{ModelDescriptor, ModelPriority};
use common::utils::format_bytes;
use inference_engine::AdapterSet;
use model_manager::{DownloadOrchestrator, FileRepository, ModelRegistry, ModelRepository, ValidationGate};
use resource_manager::{MemoryManager, PressureWatch, SystemMemoryProbe};
use runtime_config::{ConfigManager, Settings};
use storage_adapter::StorageLayout;

pub use orchestrator_core::{
    AcquireError, AcquisitionHandle, AcquisitionSnapshot, LifecycleOrchestrator, LifecycleState, LoadedModel,
    OverallProgress,
};

/// Model lifecycle runtime
pub struct ModelRuntime {
    /// Configuration manager
    config_manager: Arc<ConfigManager>,

    /// Lifecycle orchestrator
    orchestrator: LifecycleOrchestrator,

    /// Stops background tasks
    shutdown: CancellationToken,
}

impl ModelRuntime {
    /// Creates a runtime from defaults, the environment and an optional file
    pub fn new(config_manager: Arc<ConfigManager>) -> Result<Self> {
        let settings = config_manager.settings();
        let repository: Arc<dyn ModelRepository> = Arc::new(
            FileRepository::new(&settings.storage.registry_dir).context("opening the model registry")?,
        );
        Self::with_repository(config_manager, repository)
    }

    /// Creates a runtime over an explicit descriptor repository
    pub fn with_repository(config_manager: Arc<ConfigManager>, repository: Arc<dyn ModelRepository>) -> Result<Self> {
        let settings: &Settings = config_manager.settings();
        info!("Initializing model lifecycle runtime");

        let registry = Arc::new(ModelRegistry::new(repository));
        let downloader = Arc::new(DownloadOrchestrator::new(settings.download.clone())?);
        let memory = MemoryManager::from_config(&settings.memory);
        let layout = StorageLayout::new(&settings.storage.models_dir, &settings.storage.work_dir);

        info!(
            "Memory budget {}, models in {}",
            format_bytes(memory.budget().ceiling),
            layout.models_dir().display()
        );

        let orchestrator = LifecycleOrchestrator::new(
            registry,
            downloader,
            ValidationGate::from_config(&settings.download),
            memory,
            AdapterSet::default(),
            layout,
            settings.lifecycle.clone(),
        );

        Ok(Self {
            config_manager,
            orchestrator,
            shutdown: CancellationToken::new(),
        })
    }

    /// Registers or replaces a model descriptor
    pub async fn register(&self, descriptor: ModelDescriptor) -> Result<()> {
        self.orchestrator.registry().register(descriptor).await
    }

    /// Lists registered models
    pub async fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        self.orchestrator.registry().list().await
    }

    /// Loads a model, downloading it first if needed
    pub async fn load_model(&self, model_id: &str) -> Result<LoadedModel, AcquireError> {
        self.orchestrator.load_model(model_id).await
    }

    /// Starts or joins the acquisition of a model
    pub fn acquire(&self, model_id: &str, priority: Option<ModelPriority>) -> AcquisitionHandle {
        match priority {
            Some(priority) => self.orchestrator.acquire_with_priority(model_id, priority),
            None => self.orchestrator.acquire(model_id),
        }
    }

    /// Unloads a model; does nothing if it is not resident
    pub fn unload_model(&self, model_id: &str) {
        self.orchestrator.unload_model(model_id)
    }

    pub fn observe_progress(&self, model_id: &str) -> BoxStream<'static, OverallProgress> {
        self.orchestrator.observe_progress(model_id)
    }

    pub fn cancel(&self, model_id: &str) -> bool {
        self.orchestrator.cancel(model_id)
    }

    /// Starts polling host memory, sweeping resident models when availability
    /// drops below `threshold` bytes
    pub fn start_pressure_watch(&self, threshold: u64, interval: Duration) -> JoinHandle<()> {
        info!(
            "Watching host memory every {:?}, threshold {}",
            interval,
            format_bytes(threshold)
        );
        PressureWatch::new(
            Arc::new(SystemMemoryProbe::new()),
            self.orchestrator.memory().clone(),
            threshold,
            interval,
        )
        .spawn(self.shutdown.child_token())
    }

    /// Cancels in-flight acquisitions, stops background tasks and unloads every model
    pub fn shutdown(&self) {
        info!("Shutting down model lifecycle runtime");
        self.shutdown.cancel();
        for model_id in self.orchestrator.in_flight() {
            self.orchestrator.cancel(&model_id);
        }
        for model_id in self.orchestrator.resident_models() {
            self.orchestrator.unload_model(&model_id);
        }
    }

    pub fn orchestrator(&self) -> &LifecycleOrchestrator {
        &self.orchestrator
    }

    pub fn config_manager(&self) -> Arc<ConfigManager> {
        self.config_manager.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model_manager::InMemoryRepository;
    use tempfile::TempDir;

    fn settings(dir: &TempDir) -> Settings {
        let mut settings = Settings::default();
        settings.storage.models_dir = dir.path().join("models");
        settings.storage.work_dir = dir.path().join("work");
        settings.storage.registry_dir = dir.path().join("registry");
        settings.memory.ceiling = 1024 * 1024 * 1024;
        settings.memory.safety_margin = 0;
        settings
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let dir = TempDir::new().unwrap();
        let config = Arc::new(ConfigManager::from_settings(settings(&dir)).unwrap());
        let runtime = ModelRuntime::new(config).unwrap();

        let descriptor = ModelDescriptor::new("tiny", "Tiny", common::models::ModelFormat::Gguf);
        runtime.register(descriptor).await.unwrap();

        let models = runtime.list_models().await.unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "tiny");
        assert!(dir.path().join("registry").exists());
    }

    #[tokio::test]
    async fn test_shutdown_unloads_models() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tiny.gguf");
        let mut bytes = b"GGUF".to_vec();
        bytes.resize(32, 0);
        std::fs::write(&path, bytes).unwrap();

        let mut descriptor = ModelDescriptor::new("tiny", "Tiny", common::models::ModelFormat::Gguf);
        descriptor.local_path = Some(path);
        descriptor.memory_required = 1024;

        let config = Arc::new(ConfigManager::from_settings(settings(&dir)).unwrap());
        let repository = Arc::new(InMemoryRepository::with_models(vec![descriptor]));
        let runtime = ModelRuntime::with_repository(config, repository).unwrap();

        let model = runtime.load_model("tiny").await.unwrap();
        assert_eq!(runtime.orchestrator().memory().current_usage(), 1024);

        runtime.shutdown();
        assert_eq!(runtime.orchestrator().memory().current_usage(), 0);
        assert!(model.service.is_released());
    }
}
