//! Model lifecycle orchestration
//!
//! Drives a model id through discovery, download, extraction, validation,
//! initialization and loading. Every acquisition runs as its own task and
//! publishes its state on a watch channel; concurrent requests for the same
//! id join the acquisition already in flight.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use common::error::LifecycleError;
use common::models::{ModelDescriptor, ModelPriority};
use common::types::LifecycleStage;
use common::utils::{execute_with_timeout, format_bytes};
use inference_engine::{AdapterError, AdapterSet, InferenceAdapter, ModelService};
use model_manager::{BatchProgress, DownloadOrchestrator, DownloadTask, ModelRegistry, ValidationGate};
use resource_manager::MemoryManager;
use runtime_config::LifecycleConfiguration;
use storage_adapter::{find_model_artifact, select_extractor, StorageLayout, Workspace};

use crate::progress::{OverallProgress, ProgressTracker};
use crate::state::{AcquireError, AcquisitionSnapshot, LifecycleState};

type SharedOutcome = Shared<BoxFuture<'static, Result<LoadedModel, AcquireError>>>;

/// A resident, usable model
#[derive(Debug, Clone)]
pub struct LoadedModel {
    /// Descriptor the model was loaded from
    pub descriptor: ModelDescriptor,
    /// Running service
    pub service: Arc<ModelService>,
    /// Adapter that loaded the model
    pub adapter: InferenceAdapter,
    /// Bytes admitted by the memory manager
    pub memory_bytes: u64,
}

/// Caller's view of one acquisition
pub struct AcquisitionHandle {
    model_id: String,
    updates: watch::Receiver<AcquisitionSnapshot>,
    outcome: SharedOutcome,
}

impl AcquisitionHandle {
    /// Handle for a model that is already resident
    fn ready(model: LoadedModel) -> Self {
        let mut progress = ProgressTracker::new();
        progress.complete();
        let (_, updates) = watch::channel(AcquisitionSnapshot {
            state: LifecycleState::Ready,
            progress: progress.snapshot(),
        });

        Self {
            model_id: model.descriptor.id.clone(),
            updates,
            outcome: futures::future::ready(Ok(model)).boxed().shared(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Latest snapshot
    pub fn current(&self) -> AcquisitionSnapshot {
        self.updates.borrow().clone()
    }

    /// State changes, starting with the current one
    ///
    /// Intermediate values may be coalesced; the stream ends after a terminal
    /// state.
    pub fn updates(&self) -> impl Stream<Item = AcquisitionSnapshot> + Send + 'static {
        stream::unfold(Some((self.updates.clone(), true)), |cursor| async move {
            let (mut updates, first) = cursor?;
            if !first && updates.changed().await.is_err() {
                return None;
            }
            let snapshot = updates.borrow_and_update().clone();
            let next = (!snapshot.state.is_terminal()).then_some((updates, false));
            Some((snapshot, next))
        })
    }

    /// Waits for the acquisition to finish
    pub async fn wait(self) -> Result<LoadedModel, AcquireError> {
        self.outcome.await
    }
}

/// An acquisition in flight
struct Inflight {
    updates: watch::Receiver<AcquisitionSnapshot>,
    outcome: SharedOutcome,
    cancel: CancellationToken,
}

struct Inner {
    registry: Arc<ModelRegistry>,
    downloader: Arc<DownloadOrchestrator>,
    validator: ValidationGate,
    memory: MemoryManager,
    adapters: AdapterSet,
    layout: StorageLayout,
    config: LifecycleConfiguration,
    /// Resident models; an entry exists iff the memory manager holds one
    resident: Arc<DashMap<String, LoadedModel>>,
    inflight: Mutex<HashMap<String, Inflight>>,
}

/// Model lifecycle orchestrator
#[derive(Clone)]
pub struct LifecycleOrchestrator {
    inner: Arc<Inner>,
}

impl LifecycleOrchestrator {
    /// Creates an orchestrator from its collaborators
    pub fn new(
        registry: Arc<ModelRegistry>,
        downloader: Arc<DownloadOrchestrator>,
        validator: ValidationGate,
        memory: MemoryManager,
        adapters: AdapterSet,
        layout: StorageLayout,
        config: LifecycleConfiguration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                downloader,
                validator,
                memory,
                adapters,
                layout,
                config,
                resident: Arc::new(DashMap::new()),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.inner.registry
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.inner.memory
    }

    /// Starts or joins the acquisition of a model at its descriptor priority
    ///
    /// Must be called within a tokio runtime.
    pub fn acquire(&self, model_id: &str) -> AcquisitionHandle {
        self.start(model_id, None)
    }

    /// Starts or joins the acquisition of a model at an explicit priority
    ///
    /// A joined acquisition keeps the priority it was started with.
    pub fn acquire_with_priority(&self, model_id: &str, priority: ModelPriority) -> AcquisitionHandle {
        self.start(model_id, Some(priority))
    }

    /// Acquires a model and waits until it is ready
    pub async fn load_model(&self, model_id: &str) -> Result<LoadedModel, AcquireError> {
        self.acquire(model_id).wait().await
    }

    /// Unloads a resident model; does nothing for a model that is not resident
    pub fn unload_model(&self, model_id: &str) {
        if self.inner.memory.release(model_id) {
            info!("Unloaded model {}", model_id);
        } else {
            debug!("Unload of {} ignored, model is not resident", model_id);
        }
    }

    /// Overall progress of the acquisition in flight for a model
    ///
    /// Empty when nothing is in flight.
    pub fn observe_progress(&self, model_id: &str) -> BoxStream<'static, OverallProgress> {
        match self.inner.inflight.lock().get(model_id) {
            Some(inflight) => WatchStream::new(inflight.updates.clone())
                .map(|snapshot| snapshot.progress)
                .boxed(),
            None => stream::empty().boxed(),
        }
    }

    /// Signals cancellation to the acquisition in flight for a model
    pub fn cancel(&self, model_id: &str) -> bool {
        match self.inner.inflight.lock().get(model_id) {
            Some(inflight) => {
                info!("Cancelling acquisition of {}", model_id);
                inflight.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Evicts models until usage is back under the pressure limit
    pub fn on_memory_pressure(&self) -> Vec<String> {
        self.inner.memory.on_pressure_signal()
    }

    pub fn loaded_model(&self, model_id: &str) -> Option<LoadedModel> {
        self.inner.resident.get(model_id).map(|entry| entry.value().clone())
    }

    /// Ids of the resident models, sorted
    pub fn resident_models(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.resident.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Ids of the acquisitions in flight, sorted
    pub fn in_flight(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.inflight.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn start(&self, model_id: &str, priority: Option<ModelPriority>) -> AcquisitionHandle {
        let mut inflight = self.inner.inflight.lock();

        if let Some(existing) = inflight.get(model_id) {
            debug!("Joining acquisition of {} already in flight", model_id);
            return AcquisitionHandle {
                model_id: model_id.to_string(),
                updates: existing.updates.clone(),
                outcome: existing.outcome.clone(),
            };
        }

        // an entry the memory manager no longer holds is being evicted
        if let Some(model) = self.loaded_model(model_id) {
            if self.inner.memory.touch(model_id) {
                debug!("Model {} is already resident", model_id);
                return AcquisitionHandle::ready(model);
            }
            debug!("Model {} is being evicted, acquiring it again", model_id);
        }

        let (updates, receiver) = watch::channel(AcquisitionSnapshot {
            state: LifecycleState::Discovery,
            progress: OverallProgress::default(),
        });
        let cancel = CancellationToken::new();
        let acquisition = Acquisition {
            inner: self.inner.clone(),
            model_id: model_id.to_string(),
            priority,
            cancel: cancel.clone(),
            updates,
            tracker: Mutex::new(ProgressTracker::new()),
        };

        let span = info_span!("acquire", model_id = %model_id);
        let task = tokio::spawn(acquisition.drive().instrument(span));
        let id = model_id.to_string();
        let outcome = async move {
            task.await.unwrap_or_else(|join_error| {
                Err(AcquireError::Failed {
                    model_id: id,
                    stage: LifecycleStage::Discovery,
                    attempts: 1,
                    cause: LifecycleError::Internal(format!("acquisition task failed: {}", join_error)),
                })
            })
        }
        .boxed()
        .shared();

        inflight.insert(
            model_id.to_string(),
            Inflight {
                updates: receiver.clone(),
                outcome: outcome.clone(),
                cancel,
            },
        );

        AcquisitionHandle {
            model_id: model_id.to_string(),
            updates: receiver,
            outcome,
        }
    }
}

/// Why an acquisition stopped before Ready
#[derive(Debug)]
enum Halt {
    Failed {
        stage: LifecycleStage,
        attempts: u32,
        cause: LifecycleError,
    },
    Cancelled,
}

impl Halt {
    fn failed(stage: LifecycleStage, cause: LifecycleError) -> Halt {
        if cause.is_cancelled() {
            Halt::Cancelled
        } else {
            Halt::Failed {
                stage,
                attempts: 1,
                cause,
            }
        }
    }

    fn at(stage: LifecycleStage) -> impl FnOnce(LifecycleError) -> Halt {
        move |cause| Halt::failed(stage, cause)
    }
}

/// Artifact produced by the download and extraction stages
struct Fetched {
    workspace: Workspace,
    /// Directory that gets installed into the model store
    source_dir: PathBuf,
    artifact: PathBuf,
}

/// One running acquisition; the single producer of its state channel
struct Acquisition {
    inner: Arc<Inner>,
    model_id: String,
    priority: Option<ModelPriority>,
    cancel: CancellationToken,
    updates: watch::Sender<AcquisitionSnapshot>,
    tracker: Mutex<ProgressTracker>,
}

impl Acquisition {
    async fn drive(self) -> Result<LoadedModel, AcquireError> {
        info!("Acquiring model {}", self.model_id);
        let _registration = Registration {
            inner: self.inner.clone(),
            model_id: self.model_id.clone(),
        };

        let result = execute_with_timeout(
            async { Ok::<_, LifecycleError>(self.run().await) },
            self.inner.config.acquisition_timeout(),
            "acquisition",
        )
        .await
        .unwrap_or_else(|cause| {
            let stage = self.current_stage();
            Err(Halt::Failed {
                stage,
                attempts: 1,
                cause,
            })
        });

        let workspace = self.inner.layout.workspace(&self.model_id);
        if workspace.exists() {
            if let Err(e) = workspace.cleanup().await {
                warn!("Failed to remove working directory {}: {}", workspace.root.display(), e);
            }
        }

        match result {
            Ok(model) => {
                self.tracker.lock().complete();
                self.publish(LifecycleState::Ready);
                info!(
                    "Model {} is ready ({} via {})",
                    self.model_id,
                    format_bytes(model.memory_bytes),
                    model.adapter
                );
                Ok(model)
            }
            Err(Halt::Failed { stage, attempts, cause }) => {
                error!("Acquisition of {} failed at {}: {}", self.model_id, stage, cause);
                if cause.is_transient() && !stage.retries_transient_errors() {
                    debug!("{} does not retry, a new acquisition may succeed", stage);
                }
                self.publish(LifecycleState::Failed {
                    stage,
                    error: cause.clone(),
                });
                Err(AcquireError::Failed {
                    model_id: self.model_id.clone(),
                    stage,
                    attempts,
                    cause,
                })
            }
            Err(Halt::Cancelled) => {
                info!("Acquisition of {} cancelled", self.model_id);
                self.publish(LifecycleState::Cancelled);
                Err(AcquireError::Cancelled(self.model_id.clone()))
            }
        }
    }

    async fn run(&self) -> Result<LoadedModel, Halt> {
        let descriptor = self.discover().await?;

        let descriptor = if descriptor.is_available_locally() {
            self.skip(LifecycleStage::Downloading);
            self.skip(LifecycleStage::Extracting);
            let local_path = descriptor.local_path.clone().unwrap_or_default();
            self.validate(&descriptor, &local_path).await?;
            descriptor
        } else {
            let fetched = self.download(&descriptor).await?;
            let fetched = self.extract(&descriptor, fetched).await?;
            self.validate(&descriptor, &fetched.artifact).await?;
            self.install(fetched).await?
        };

        let adapter = self.initialize(&descriptor).await?;
        self.load(descriptor, adapter).await
    }

    async fn discover(&self) -> Result<ModelDescriptor, Halt> {
        self.enter(LifecycleStage::Discovery)?;
        let lookup = async {
            self.inner
                .registry
                .fetch(&self.model_id)
                .await
                .map_err(|e| LifecycleError::Internal(format!("registry lookup failed: {}", e)))?
                .ok_or_else(|| LifecycleError::ModelNotFound(self.model_id.clone()))
        };
        let descriptor = self.bounded(LifecycleStage::Discovery, lookup).await?;

        if !descriptor.is_available_locally() && descriptor.download_urls.is_empty() {
            return Err(Halt::failed(
                LifecycleStage::Discovery,
                LifecycleError::ModelNotFound(format!(
                    "{} has neither a local artifact nor a download url",
                    self.model_id
                )),
            ));
        }
        Ok(descriptor)
    }

    async fn download(&self, descriptor: &ModelDescriptor) -> Result<Fetched, Halt> {
        let stage = LifecycleStage::Downloading;
        self.enter(stage)?;

        let workspace = self
            .inner
            .layout
            .prepare_workspace(&self.model_id)
            .await
            .map_err(|e| Halt::failed(stage, e.into()))?;

        let tasks = download_tasks(descriptor, &workspace.download_dir);
        let primary = tasks
            .first()
            .map(|task| task.destination.clone())
            .ok_or_else(|| Halt::failed(stage, LifecycleError::ModelNotFound(self.model_id.clone())))?;
        if descriptor.is_multi_file() {
            info!("Downloading {} files for {}", tasks.len(), self.model_id);
        } else {
            info!("Downloading {}", descriptor.download_urls[0]);
        }

        let on_progress = |batch: &BatchProgress| {
            let progress = {
                let mut tracker = self.tracker.lock();
                tracker.record_download(batch);
                tracker.snapshot()
            };
            self.updates.send_replace(AcquisitionSnapshot {
                state: LifecycleState::Downloading,
                progress,
            });
        };

        let completed = self
            .inner
            .downloader
            .download_all(tasks, on_progress, &self.cancel)
            .await
            .map_err(|e| {
                let attempts = e.attempts();
                match Halt::failed(stage, e.into()) {
                    Halt::Failed { stage, cause, .. } => Halt::Failed {
                        stage,
                        attempts,
                        cause,
                    },
                    cancelled => cancelled,
                }
            })?;

        let bytes: u64 = completed.iter().map(|download| download.bytes).sum();
        info!("Downloaded {} for {}", format_bytes(bytes), self.model_id);

        Ok(Fetched {
            source_dir: workspace.download_dir.clone(),
            artifact: primary,
            workspace,
        })
    }

    async fn extract(&self, descriptor: &ModelDescriptor, fetched: Fetched) -> Result<Fetched, Halt> {
        let stage = LifecycleStage::Extracting;
        let extensions = descriptor.format.artifact_extensions();

        let Some(extractor) = select_extractor(&fetched.artifact) else {
            debug!("{} needs no extraction", fetched.artifact.display());
            self.skip(stage);
            let artifact = find_model_artifact(&fetched.source_dir, extensions).unwrap_or(fetched.artifact);
            return Ok(Fetched { artifact, ..fetched });
        };

        self.enter(stage)?;
        let extract_dir = fetched.workspace.extract_dir.clone();
        let archive = fetched.artifact.clone();
        let unpack = async {
            let root = extractor.extract(&archive, &extract_dir).await?;
            // companion files sit next to the extracted artifact
            move_companions(&fetched.source_dir, &archive, &root).await?;
            find_model_artifact(&root, extensions).ok_or_else(|| {
                LifecycleError::ExtractionFailed(format!(
                    "no {} artifact in {}",
                    descriptor.format,
                    archive.display()
                ))
            })
        };
        let artifact = self.bounded(stage, unpack).await?;
        info!("Extracted {}", artifact.display());

        Ok(Fetched {
            source_dir: extract_dir,
            artifact,
            workspace: fetched.workspace,
        })
    }

    async fn validate(&self, descriptor: &ModelDescriptor, artifact: &Path) -> Result<(), Halt> {
        let stage = LifecycleStage::Validating;
        self.enter(stage)?;

        let check = async {
            let result = self.inner.validator.validate(artifact, descriptor).await;
            for warning in &result.warnings {
                warn!("Validation of {}: {}", self.model_id, warning);
            }
            match result.first_error() {
                Some(error) => Err(error.clone()),
                None if result.is_valid => Ok(()),
                None => Err(LifecycleError::Internal("validation failed without an error".into())),
            }
        };
        self.bounded(stage, check).await
    }

    /// Moves the verified artifacts into the model store and records the location
    async fn install(&self, fetched: Fetched) -> Result<ModelDescriptor, Halt> {
        let stage = LifecycleStage::Validating;
        let store = async {
            let local_path = self
                .inner
                .layout
                .install(&self.model_id, &fetched.source_dir, &fetched.artifact)
                .await?;
            let descriptor = self
                .inner
                .registry
                .update_local_path(&self.model_id, &local_path)
                .await
                .map_err(|e| LifecycleError::Io(format!("failed to record local path: {}", e)))?;
            fetched.workspace.cleanup().await?;
            info!("Installed {} at {}", self.model_id, local_path.display());
            Ok::<_, LifecycleError>(descriptor)
        };
        self.bounded(stage, store).await
    }

    async fn initialize(&self, descriptor: &ModelDescriptor) -> Result<InferenceAdapter, Halt> {
        let stage = LifecycleStage::Initializing;
        self.enter(stage)?;

        let select = async {
            let adapter = self.inner.adapters.select(descriptor)?;

            let limit = self.inner.memory.budget().admission_limit();
            let min_memory = descriptor.requirements.min_memory;
            if min_memory > limit {
                return Err(LifecycleError::RequirementsNotMet(format!(
                    "{} requires {} but at most {} can be admitted",
                    descriptor.id,
                    format_bytes(min_memory),
                    format_bytes(limit)
                )));
            }

            let missing: Vec<&str> = descriptor
                .requirements
                .required_capabilities
                .iter()
                .map(String::as_str)
                .filter(|capability| !self.inner.adapters.supports_capability(capability))
                .collect();
            if !missing.is_empty() {
                return Err(LifecycleError::RequirementsNotMet(format!(
                    "missing capabilities: {}",
                    missing.join(", ")
                )));
            }

            Ok(adapter)
        };
        let adapter = self.bounded(stage, select).await?;
        debug!("Selected {} for {}", adapter, self.model_id);
        Ok(adapter)
    }

    async fn load(&self, descriptor: ModelDescriptor, adapter: InferenceAdapter) -> Result<LoadedModel, Halt> {
        let stage = LifecycleStage::Loading;
        self.enter(stage)?;

        let path = descriptor
            .local_path
            .clone()
            .ok_or_else(|| Halt::failed(stage, LifecycleError::Internal("descriptor lost its local path".into())))?;
        let priority = self.priority.unwrap_or(descriptor.priority);

        let admit = async {
            let estimate = adapter.estimate_memory_usage(&descriptor, &path)?;
            Ok::<_, LifecycleError>(self.inner.memory.admit(&self.model_id, estimate, priority)?)
        };
        let admission = self.bounded(stage, admit).await?;
        if !admission.evicted.is_empty() {
            info!("Evicted {:?} to admit {}", admission.evicted, self.model_id);
        }
        self.progress(stage, 0.5);

        // the reservation rolls back on every early return below
        let reservation = admission.reservation;
        let mut pending = PendingLoad::spawn(adapter, descriptor.clone(), path);
        let service = self.bounded(stage, pending.join()).await?;

        if self.cancel.is_cancelled() {
            adapter.release(&service);
            return Err(Halt::Cancelled);
        }

        let model = LoadedModel {
            descriptor,
            service: Arc::new(service),
            adapter,
            memory_bytes: reservation.size(),
        };

        // visible before commit, since the hook may run as soon as the entry exists
        self.inner.resident.insert(self.model_id.clone(), model.clone());
        let resident = self.inner.resident.clone();
        let (model_id, service) = (self.model_id.clone(), model.service.clone());
        reservation.commit(Box::new(move || {
            adapter.release(&service);
            resident.remove_if(&model_id, |_, loaded| Arc::ptr_eq(&loaded.service, &service));
        }));

        Ok(model)
    }

    /// Enters a stage after checking for cancellation
    fn enter(&self, stage: LifecycleStage) -> Result<(), Halt> {
        if self.cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        debug!("Entering {} for {}", stage, self.model_id);
        self.tracker.lock().enter(stage);
        self.publish(LifecycleState::for_stage(stage));
        Ok(())
    }

    fn skip(&self, stage: LifecycleStage) {
        debug!("Skipping {} for {}", stage, self.model_id);
        self.tracker.lock().skip(stage);
    }

    fn progress(&self, stage: LifecycleStage, fraction: f64) {
        self.tracker.lock().update(stage, fraction);
        self.publish(LifecycleState::for_stage(stage));
    }

    fn publish(&self, state: LifecycleState) {
        let progress = self.tracker.lock().snapshot();
        self.updates.send_replace(AcquisitionSnapshot { state, progress });
    }

    fn current_stage(&self) -> LifecycleStage {
        self.updates
            .borrow()
            .state
            .stage()
            .unwrap_or(LifecycleStage::Discovery)
    }

    /// Runs a non-download stage under the stage deadline and cancellation
    async fn bounded<T, F>(&self, stage: LifecycleStage, work: F) -> Result<T, Halt>
    where
        F: Future<Output = Result<T, LifecycleError>>,
    {
        let operation = format!("{} stage", stage);
        let limited = execute_with_timeout(work, self.inner.config.stage_timeout(), &operation);
        tokio::select! {
            result = limited => result.map_err(Halt::at(stage)),
            _ = self.cancel.cancelled() => Err(Halt::Cancelled),
        }
    }
}

/// Drops the in-flight entry of an acquisition however its task ends
struct Registration {
    inner: Arc<Inner>,
    model_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.inner.inflight.lock().remove(&self.model_id);

        if std::thread::panicking() {
            let workspace = self.inner.layout.workspace(&self.model_id);
            match std::fs::remove_dir_all(&workspace.root) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove working directory {}: {}", workspace.root.display(), e),
            }
        }
    }
}

/// A blocking adapter load
///
/// The load cannot be interrupted; when the acquisition stops waiting for
/// it, the service it eventually produces is released.
struct PendingLoad {
    adapter: InferenceAdapter,
    task: Option<JoinHandle<Result<ModelService, AdapterError>>>,
}

impl PendingLoad {
    fn spawn(adapter: InferenceAdapter, descriptor: ModelDescriptor, path: PathBuf) -> Self {
        let task = tokio::task::spawn_blocking(move || adapter.load_model(&descriptor, &path));
        Self {
            adapter,
            task: Some(task),
        }
    }

    async fn join(&mut self) -> Result<ModelService, LifecycleError> {
        let task = self
            .task
            .as_mut()
            .ok_or_else(|| LifecycleError::Internal("load already joined".into()))?;
        let joined = task.await;
        self.task = None;
        Ok(joined.map_err(|e| LifecycleError::Internal(format!("load task failed: {}", e)))??)
    }

    /// Stops waiting for the load; its service is released once it arrives
    fn abandon(&mut self) -> Option<JoinHandle<Option<ModelService>>> {
        let task = self.task.take()?;
        let runtime = tokio::runtime::Handle::try_current().ok()?;

        let adapter = self.adapter;
        Some(runtime.spawn(async move {
            let service = task.await.ok()?.ok()?;
            debug!("Releasing {}, its acquisition stopped during loading", service.model_id());
            adapter.release(&service);
            Some(service)
        }))
    }
}

impl Drop for PendingLoad {
    fn drop(&mut self) {
        self.abandon();
    }
}

/// One task per download url, named after the url's last path segment
///
/// The model checksum is left to the validation stage.
fn download_tasks(descriptor: &ModelDescriptor, download_dir: &Path) -> Vec<DownloadTask> {
    let mut used = HashSet::new();

    descriptor
        .download_urls
        .iter()
        .enumerate()
        .map(|(index, url)| {
            let name = file_name_from_url(url)
                .filter(|name| used.insert(name.clone()))
                .unwrap_or_else(|| format!("file-{}", index));
            DownloadTask::new(url.clone(), download_dir.join(name))
        })
        .collect()
}

fn file_name_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    (!name.is_empty() && name != "." && name != "..").then(|| name.to_string())
}

/// Moves every downloaded file except the archive into the extraction root
async fn move_companions(download_dir: &Path, archive: &Path, root: &Path) -> Result<(), LifecycleError> {
    let mut entries = tokio::fs::read_dir(download_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path == archive || !entry.file_type().await?.is_file() {
            continue;
        }
        if let Some(name) = path.file_name() {
            tokio::fs::rename(&path, root.join(name)).await?;
        }
    }
    Ok(())
}
