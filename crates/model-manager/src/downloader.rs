//! Download orchestrator
//!
//! Streams model files over HTTP with bounded concurrency, retries transient
//! failures with backoff and reports throttled progress. Data lands in
//! `<destination>.part` and is renamed into place only once complete.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::error::LifecycleError;
use common::utils::format_bytes;
use runtime_config::DownloadConfiguration;

use crate::retry::{is_retryable_status, RetryPolicy};

/// HEAD answers that make a full attempt pointless
const PROBE_FATAL_STATUSES: [u16; 5] = [400, 401, 403, 404, 410];

/// Download errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DownloadError {
    /// The attempt exceeded its deadline
    #[error("request to {url} timed out")]
    Timeout { url: String },

    /// The connection dropped mid-transfer
    #[error("connection to {url} lost: {reason}")]
    ConnectionLost { url: String, reason: String },

    /// No connection could be established
    #[error("cannot connect to {url}: {reason}")]
    NotConnected { url: String, reason: String },

    /// The URL cannot be requested at all
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The server answered with an unsuccessful status
    #[error("{url} answered HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    /// The downloaded bytes do not hash to the expected digest
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Local file system failure
    #[error("io error on {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    /// Every allowed attempt failed with a retryable error
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<DownloadError> },

    /// The download was cancelled
    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Returns true if another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Timeout { .. }
            | DownloadError::ConnectionLost { .. }
            | DownloadError::NotConnected { .. } => true,
            DownloadError::HttpStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    /// Attempts made before the error became final
    pub fn attempts(&self) -> u32 {
        match self {
            DownloadError::RetriesExhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    fn from_request(err: reqwest::Error, url: &str) -> Self {
        let url = url.to_string();
        if err.is_timeout() {
            DownloadError::Timeout { url }
        } else if err.is_builder() {
            DownloadError::InvalidUrl {
                url,
                reason: err.to_string(),
            }
        } else if err.is_connect() {
            DownloadError::NotConnected {
                url,
                reason: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            DownloadError::HttpStatus {
                url,
                status: status.as_u16(),
            }
        } else {
            DownloadError::ConnectionLost {
                url,
                reason: err.to_string(),
            }
        }
    }

    fn io(path: &Path, err: std::io::Error) -> Self {
        DownloadError::Io {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }
}

impl From<DownloadError> for LifecycleError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::Timeout { .. } => LifecycleError::Timeout(err.to_string()),
            DownloadError::ConnectionLost { .. } | DownloadError::NotConnected { .. } => {
                LifecycleError::Network(err.to_string())
            }
            DownloadError::HttpStatus { status, .. } if is_retryable_status(status) => {
                LifecycleError::Network(err.to_string())
            }
            DownloadError::HttpStatus { .. } | DownloadError::InvalidUrl { .. } => {
                LifecycleError::DownloadFailed(err.to_string())
            }
            DownloadError::ChecksumMismatch { expected, actual, .. } => {
                LifecycleError::ChecksumMismatch { expected, actual }
            }
            DownloadError::Io { .. } => LifecycleError::Io(err.to_string()),
            DownloadError::RetriesExhausted { last, .. } => LifecycleError::from(*last),
            DownloadError::Cancelled => LifecycleError::Cancelled,
        }
    }
}

/// Lifecycle of a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Pending,
    InFlight,
    Retrying { attempt: u32, delay: Duration },
    Succeeded,
    Failed,
}

/// One file to download
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// Task id
    pub id: Uuid,
    /// Mirrors of the same file, tried round-robin across attempts
    pub sources: Vec<String>,
    /// Final location of the file
    pub destination: PathBuf,
    /// Size announced by the server, if any
    pub expected_bytes: Option<u64>,
    /// Bytes received by the current attempt
    pub received_bytes: u64,
    /// Attempts started so far
    pub attempts: u32,
    /// Optional hex SHA-256 of the file
    pub checksum: Option<String>,
    /// Current status
    pub status: DownloadStatus,
}

impl DownloadTask {
    /// Creates a task for a single URL
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self::with_mirrors(vec![url.into()], destination)
    }

    /// Creates a task for a file available from several mirrors
    pub fn with_mirrors(sources: Vec<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sources,
            destination: destination.into(),
            expected_bytes: None,
            received_bytes: 0,
            attempts: 0,
            checksum: None,
            status: DownloadStatus::Pending,
        }
    }

    /// Sets the expected SHA-256
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// Source used by attempt number `attempt` (1-based)
    pub fn source_for_attempt(&self, attempt: u32) -> Option<&str> {
        if self.sources.is_empty() {
            return None;
        }
        let index = (attempt.saturating_sub(1) as usize) % self.sources.len();
        Some(self.sources[index].as_str())
    }

    fn progress(&self, bytes_per_second: f64, complete: bool) -> DownloadProgress {
        DownloadProgress {
            task_id: self.id,
            received_bytes: self.received_bytes,
            expected_bytes: self.expected_bytes,
            bytes_per_second,
            complete,
        }
    }
}

/// Progress of one file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    pub task_id: Uuid,
    pub received_bytes: u64,
    pub expected_bytes: Option<u64>,
    pub bytes_per_second: f64,
    pub complete: bool,
}

impl DownloadProgress {
    /// Fraction in `[0, 1]`; 0 while the size is unknown
    pub fn fraction(&self) -> f64 {
        if self.complete {
            return 1.0;
        }
        match self.expected_bytes {
            Some(expected) if expected > 0 => (self.received_bytes as f64 / expected as f64).min(1.0),
            _ => 0.0,
        }
    }
}

/// Progress of a multi-file download
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchProgress {
    /// Arithmetic mean of the per-file fractions
    pub fraction: f64,
    /// Bytes received across files
    pub received_bytes: u64,
    /// Sum of the known file sizes
    pub expected_bytes: u64,
    /// Combined transfer rate
    pub bytes_per_second: f64,
    pub completed_files: usize,
    pub total_files: usize,
}

/// A finished file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedDownload {
    pub task_id: Uuid,
    pub path: PathBuf,
    pub bytes: u64,
    pub attempts: u32,
}

/// Download orchestrator
pub struct DownloadOrchestrator {
    /// HTTP client
    client: Client,

    /// Download settings
    config: DownloadConfiguration,

    /// Backoff schedule
    retry: RetryPolicy,

    /// Transfer slots, granted in FIFO order
    permits: Arc<Semaphore>,
}

impl DownloadOrchestrator {
    /// Creates a download orchestrator
    pub fn new(config: DownloadConfiguration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.timeout().min(Duration::from_secs(30)))
            .pool_max_idle_per_host(10)
            .build()?;

        info!(
            "Download orchestrator: {} concurrent, {} retries, {:?} timeout",
            config.max_concurrent_downloads,
            config.retry_count,
            config.timeout()
        );

        Ok(Self {
            client,
            retry: RetryPolicy::from_config(&config),
            permits: Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1))),
            config,
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Downloads one file, retrying transient failures
    pub async fn download<F>(
        &self,
        mut task: DownloadTask,
        on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<CompletedDownload, DownloadError>
    where
        F: Fn(&DownloadProgress) + Send + Sync,
    {
        let _permit = tokio::select! {
            permit = self.permits.acquire() => permit.map_err(|_| DownloadError::Cancelled)?,
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        };

        loop {
            task.attempts += 1;
            task.status = DownloadStatus::InFlight;
            let url = match task.source_for_attempt(task.attempts) {
                Some(url) => url.to_string(),
                None => {
                    task.status = DownloadStatus::Failed;
                    return Err(DownloadError::InvalidUrl {
                        url: String::new(),
                        reason: "task has no source".into(),
                    });
                }
            };

            debug!("Attempt {} for {} from {}", task.attempts, task.destination.display(), url);

            let error = match self.attempt(&mut task, &url, &on_progress, cancel).await {
                Ok(bytes) => {
                    task.status = DownloadStatus::Succeeded;
                    info!(
                        "Downloaded {} ({}) in {} attempt(s)",
                        task.destination.display(),
                        format_bytes(bytes),
                        task.attempts
                    );
                    return Ok(CompletedDownload {
                        task_id: task.id,
                        path: task.destination.clone(),
                        bytes,
                        attempts: task.attempts,
                    });
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                task.status = DownloadStatus::Failed;
                if error != DownloadError::Cancelled {
                    warn!("Download of {} failed: {}", url, error);
                }
                return Err(error);
            }

            if !self.retry.allows_retry_after(task.attempts) {
                task.status = DownloadStatus::Failed;
                warn!("Download of {} failed after {} attempts: {}", url, task.attempts, error);
                return Err(DownloadError::RetriesExhausted {
                    attempts: task.attempts,
                    last: Box::new(error),
                });
            }

            let delay = self.retry.delay_for(task.attempts);
            task.status = DownloadStatus::Retrying {
                attempt: task.attempts,
                delay,
            };
            warn!("Attempt {} for {} failed ({}), retrying in {:?}", task.attempts, url, error, delay);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    task.status = DownloadStatus::Failed;
                    return Err(DownloadError::Cancelled);
                }
            }
        }
    }

    /// Downloads every task, reporting the mean progress
    ///
    /// Completes only when every file completes. The first fatal error
    /// cancels the remaining transfers and is returned.
    pub async fn download_all<F>(
        &self,
        tasks: Vec<DownloadTask>,
        on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<Vec<CompletedDownload>, DownloadError>
    where
        F: Fn(&BatchProgress) + Send + Sync,
    {
        let total_files = tasks.len();
        if total_files == 0 {
            return Ok(Vec::new());
        }

        let batch_cancel = cancel.child_token();
        let slots: Mutex<Vec<Option<DownloadProgress>>> = Mutex::new(vec![None; total_files]);
        let report = |index: usize, progress: &DownloadProgress| {
            let batch = {
                let mut slots = slots.lock();
                slots[index] = Some(*progress);
                summarize(&slots)
            };
            on_progress(&batch);
        };

        let mut transfers: FuturesUnordered<_> = tasks
            .into_iter()
            .enumerate()
            .map(|(index, task)| {
                let report = &report;
                let batch_cancel = &batch_cancel;
                async move {
                    let result = self
                        .download(task, move |progress| report(index, progress), batch_cancel)
                        .await;
                    (index, result)
                }
            })
            .collect();

        let mut completed: Vec<Option<CompletedDownload>> = vec![None; total_files];
        let mut first_error: Option<DownloadError> = None;

        while let Some((index, result)) = transfers.next().await {
            match result {
                Ok(download) => completed[index] = Some(download),
                Err(error) => {
                    if first_error.is_none() {
                        debug!("Cancelling sibling downloads after: {}", error);
                        batch_cancel.cancel();
                        first_error = Some(error);
                    }
                }
            }
        }

        if let Some(error) = first_error {
            // a sibling's Cancelled must not mask the caller's cancellation
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            return Err(error);
        }

        Ok(completed.into_iter().flatten().collect())
    }

    /// One attempt; removes the partial file on any failure
    async fn attempt<F>(
        &self,
        task: &mut DownloadTask,
        url: &str,
        on_progress: &F,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError>
    where
        F: Fn(&DownloadProgress) + Send + Sync,
    {
        let part = part_path(&task.destination);
        let deadline = self.config.timeout();

        let result = tokio::select! {
            outcome = tokio::time::timeout(deadline, self.transfer(task, url, &part, on_progress)) => {
                outcome.unwrap_or_else(|_| Err(DownloadError::Timeout { url: url.to_string() }))
            }
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
        };

        if result.is_err() {
            match tokio::fs::remove_file(&part).await {
                Ok(()) => debug!("Removed partial file {}", part.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove partial file {}: {}", part.display(), e),
            }
        }

        result
    }

    /// Checks that the URL is worth a full attempt and learns the file size
    async fn probe(&self, task: &mut DownloadTask, url: &str) -> Result<(), DownloadError> {
        match self.client.head(url).send().await {
            Ok(response) => {
                let status = response.status();
                if PROBE_FATAL_STATUSES.contains(&status.as_u16()) {
                    return Err(DownloadError::HttpStatus {
                        url: url.to_string(),
                        status: status.as_u16(),
                    });
                }
                if status.is_success() {
                    if let Some(length) = content_length(&response).filter(|length| *length > 0) {
                        task.expected_bytes = Some(length);
                    }
                } else if status != StatusCode::METHOD_NOT_ALLOWED && status != StatusCode::NOT_IMPLEMENTED {
                    debug!("Probe of {} answered {}, trying anyway", url, status);
                }
                Ok(())
            }
            Err(e) if e.is_builder() => Err(DownloadError::from_request(e, url)),
            Err(e) => {
                debug!("Probe of {} failed ({}), trying anyway", url, e);
                Ok(())
            }
        }
    }

    async fn transfer<F>(
        &self,
        task: &mut DownloadTask,
        url: &str,
        part: &Path,
        on_progress: &F,
    ) -> Result<u64, DownloadError>
    where
        F: Fn(&DownloadProgress) + Send + Sync,
    {
        task.received_bytes = 0;
        self.probe(task, url).await?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::from_request(e, url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        if let Some(length) = content_length(&response).filter(|length| *length > 0) {
            task.expected_bytes = Some(length);
        }

        if let Some(parent) = part.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }
        let mut file = File::create(part).await.map_err(|e| DownloadError::io(part, e))?;

        let mut hasher = match (&task.checksum, self.config.verify_checksum) {
            (Some(_), true) => Some(Sha256::new()),
            _ => None,
        };

        let started = Instant::now();
        let mut last_report = Instant::now();
        let mut last_reported_bytes = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DownloadError::from_request(e, url))?;
            file.write_all(&chunk).await.map_err(|e| DownloadError::io(part, e))?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }
            task.received_bytes += chunk.len() as u64;

            let now = Instant::now();
            if task.received_bytes - last_reported_bytes >= self.config.chunk_size
                || now.duration_since(last_report) >= self.config.progress_interval()
            {
                on_progress(&task.progress(rate(task.received_bytes, started), false));
                last_report = now;
                last_reported_bytes = task.received_bytes;
            }
        }

        file.flush().await.map_err(|e| DownloadError::io(part, e))?;
        drop(file);

        if let Some(expected) = task.expected_bytes {
            if task.received_bytes < expected {
                return Err(DownloadError::ConnectionLost {
                    url: url.to_string(),
                    reason: format!("body ended after {} of {} bytes", task.received_bytes, expected),
                });
            }
        }

        if let (Some(hasher), Some(expected)) = (hasher, task.checksum.as_ref()) {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(DownloadError::ChecksumMismatch {
                    path: task.destination.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
            debug!("Checksum verified for {}", task.destination.display());
        }

        tokio::fs::rename(part, &task.destination)
            .await
            .map_err(|e| DownloadError::io(&task.destination, e))?;

        task.expected_bytes = Some(task.received_bytes);
        on_progress(&task.progress(rate(task.received_bytes, started), true));

        Ok(task.received_bytes)
    }
}

fn content_length(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
}

fn rate(bytes: u64, started: Instant) -> f64 {
    let elapsed = started.elapsed().as_secs_f64();
    if elapsed > 0.0 {
        bytes as f64 / elapsed
    } else {
        0.0
    }
}

/// `model.gguf` -> `model.gguf.part`
pub fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn summarize(slots: &[Option<DownloadProgress>]) -> BatchProgress {
    let total_files = slots.len();
    let mut batch = BatchProgress {
        fraction: 0.0,
        received_bytes: 0,
        expected_bytes: 0,
        bytes_per_second: 0.0,
        completed_files: 0,
        total_files,
    };

    let mut fraction_sum = 0.0;
    for progress in slots.iter().flatten() {
        fraction_sum += progress.fraction();
        batch.received_bytes += progress.received_bytes;
        batch.expected_bytes += progress.expected_bytes.unwrap_or(0);
        if progress.complete {
            batch.completed_files += 1;
        } else {
            batch.bytes_per_second += progress.bytes_per_second;
        }
    }

    // 100% is reserved for the moment every file has been renamed into place
    batch.fraction = if batch.completed_files == total_files {
        1.0
    } else {
        (fraction_sum / total_files as f64).min(0.999)
    };
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use axum::body::{Bytes, StreamBody};
    use axum::extract::{Path as UrlPath, State};
    use axum::http::{header, HeaderMap, Method, StatusCode as HttpStatus};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;

    /// How the test server answers the next GET for a file
    #[derive(Clone, Copy)]
    enum Fault {
        /// Send half the body, then drop the connection
        Truncate,
        /// Answer with a status
        Status(u16),
    }

    #[derive(Clone, Default)]
    struct Server {
        files: Arc<HashMap<String, Vec<u8>>>,
        faults: Arc<Mutex<HashMap<String, Vec<Fault>>>>,
        hits: Arc<Mutex<HashMap<String, usize>>>,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        delay: Duration,
    }

    async fn serve_file(State(server): State<Server>, method: Method, UrlPath(name): UrlPath<String>) -> Response {
        let Some(body) = server.files.get(&name).cloned() else {
            return HttpStatus::NOT_FOUND.into_response();
        };
        if method == Method::HEAD {
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_LENGTH, body.len().into());
            return (headers, Vec::<u8>::new()).into_response();
        }

        *server.hits.lock().entry(name.clone()).or_default() += 1;
        let fault = {
            let mut faults = server.faults.lock();
            faults.get_mut(&name).and_then(|queue| (!queue.is_empty()).then(|| queue.remove(0)))
        };

        if let Some(Fault::Status(status)) = fault {
            return HttpStatus::from_u16(status).unwrap().into_response();
        }

        let current = server.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        server.peak.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(server.delay).await;
        server.in_flight.fetch_sub(1, Ordering::SeqCst);

        match fault {
            Some(Fault::Truncate) => {
                let half = Bytes::from(body[..body.len() / 2].to_vec());
                let chunks: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
                    Ok(half),
                    Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "dropped")),
                ];
                let mut headers = HeaderMap::new();
                headers.insert(header::CONTENT_LENGTH, body.len().into());
                (headers, StreamBody::new(futures::stream::iter(chunks))).into_response()
            }
            _ => body.into_response(),
        }
    }

    impl Server {
        fn new(files: &[(&str, &[u8])]) -> Self {
            Self {
                files: Arc::new(files.iter().map(|(name, data)| (name.to_string(), data.to_vec())).collect()),
                ..Self::default()
            }
        }

        fn fail(&self, name: &str, faults: Vec<Fault>) {
            self.faults.lock().insert(name.to_string(), faults);
        }

        fn hits(&self, name: &str) -> usize {
            self.hits.lock().get(name).copied().unwrap_or(0)
        }

        async fn start(self) -> String {
            let app = Router::new().route("/:name", get(serve_file)).with_state(self);
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let addr: SocketAddr = listener.local_addr().unwrap();
            tokio::spawn(axum::Server::from_tcp(listener).unwrap().serve(app.into_make_service()));
            format!("http://{}", addr)
        }
    }

    fn config() -> DownloadConfiguration {
        DownloadConfiguration {
            max_concurrent_downloads: 2,
            retry_count: 2,
            base_delay_ms: 10,
            max_delay_ms: 50,
            timeout_ms: 5_000,
            chunk_size: 4,
            progress_interval_ms: 1,
            ..DownloadConfiguration::default()
        }
    }

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    #[tokio::test]
    async fn test_download_single_file() {
        let payload = b"GGUF model weights".to_vec();
        let server = Server::new(&[("model.gguf", &payload)]);
        let base = server.clone().start().await;
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("model.gguf");

        let downloader = DownloadOrchestrator::new(config()).unwrap();
        let updates = Mutex::new(Vec::new());
        let task = DownloadTask::new(format!("{}/model.gguf", base), &destination).with_checksum(sha256_hex(&payload));

        let completed = downloader
            .download(task, |progress| updates.lock().push(*progress), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(completed.bytes, payload.len() as u64);
        assert_eq!(completed.attempts, 1);
        assert_eq!(std::fs::read(&destination).unwrap(), payload);
        assert!(!part_path(&destination).exists());

        let updates = updates.into_inner();
        assert_eq!(updates.iter().filter(|progress| progress.complete).count(), 1);
        assert!(updates.last().unwrap().complete);
    }

    #[tokio::test]
    async fn test_connection_loss_is_retried() {
        let payload = vec![7u8; 64];
        let server = Server::new(&[("part.bin", &payload)]);
        server.fail("part.bin", vec![Fault::Truncate]);
        let base = server.clone().start().await;
        let dir = tempfile::tempdir().unwrap();

        let downloader = DownloadOrchestrator::new(config()).unwrap();
        let completed = downloader
            .download(
                DownloadTask::new(format!("{}/part.bin", base), dir.path().join("part.bin")),
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(completed.attempts, 2);
        assert_eq!(server.hits("part.bin"), 2);
        assert_eq!(std::fs::read(dir.path().join("part.bin")).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_retries_exhausted_on_persistent_5xx() {
        let server = Server::new(&[("flaky.bin", b"data")]);
        server.fail("flaky.bin", vec![Fault::Status(503); 5]);
        let base = server.clone().start().await;
        let dir = tempfile::tempdir().unwrap();

        let downloader = DownloadOrchestrator::new(config()).unwrap();
        let err = downloader
            .download(
                DownloadTask::new(format!("{}/flaky.bin", base), dir.path().join("flaky.bin")),
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(server.hits("flaky.bin"), 3);
        assert!(matches!(LifecycleError::from(err), LifecycleError::Network(_)));
    }

    #[tokio::test]
    async fn test_fatal_status_is_not_retried() {
        let server = Server::new(&[("gone.bin", b"data")]);
        server.fail("gone.bin", vec![Fault::Status(403)]);
        let base = server.clone().start().await;
        let dir = tempfile::tempdir().unwrap();

        let downloader = DownloadOrchestrator::new(config()).unwrap();
        let err = downloader
            .download(
                DownloadTask::new(format!("{}/gone.bin", base), dir.path().join("gone.bin")),
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.attempts(), 1);
        assert!(matches!(err, DownloadError::HttpStatus { status: 403, .. }));
        assert_eq!(server.hits("gone.bin"), 1);
    }

    #[tokio::test]
    async fn test_missing_file_short_circuits_on_probe() {
        let server = Server::new(&[]);
        let base = server.clone().start().await;
        let dir = tempfile::tempdir().unwrap();

        let downloader = DownloadOrchestrator::new(config()).unwrap();
        let err = downloader
            .download(
                DownloadTask::new(format!("{}/missing.bin", base), dir.path().join("missing.bin")),
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::HttpStatus { status: 404, .. }));
        assert_eq!(server.hits("missing.bin"), 0);
    }

    #[tokio::test]
    async fn test_invalid_url_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = DownloadOrchestrator::new(config()).unwrap();
        let err = downloader
            .download(
                DownloadTask::new("not a url", dir.path().join("x")),
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_removes_partial_file() {
        let server = Server::new(&[("model.onnx", b"\x08onnx")]);
        let base = server.clone().start().await;
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("model.onnx");

        let downloader = DownloadOrchestrator::new(config()).unwrap();
        let err = downloader
            .download(
                DownloadTask::new(format!("{}/model.onnx", base), &destination).with_checksum("00".repeat(32)),
                |_| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::ChecksumMismatch { .. }));
        assert_eq!(server.hits("model.onnx"), 1);
        assert!(!destination.exists());
        assert!(!part_path(&destination).exists());
    }

    #[tokio::test]
    async fn test_download_all_reports_mean_progress() {
        let files: Vec<(String, Vec<u8>)> = (1..=3).map(|i| (format!("shard-{}.bin", i), vec![i as u8; 32])).collect();
        let refs: Vec<(&str, &[u8])> = files.iter().map(|(name, data)| (name.as_str(), data.as_slice())).collect();
        let server = Server::new(&refs);
        server.fail("shard-2.bin", vec![Fault::Truncate]);
        let base = server.clone().start().await;
        let dir = tempfile::tempdir().unwrap();

        let tasks = files
            .iter()
            .map(|(name, _)| DownloadTask::new(format!("{}/{}", base, name), dir.path().join(name)))
            .collect();
        let updates = Mutex::new(Vec::<BatchProgress>::new());

        let downloader = DownloadOrchestrator::new(config()).unwrap();
        let completed = downloader
            .download_all(tasks, |progress| updates.lock().push(*progress), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(completed.len(), 3);
        assert_eq!(completed[1].attempts, 2);
        assert_eq!(server.hits("shard-2.bin"), 2);

        let updates = updates.into_inner();
        for progress in &updates {
            if progress.fraction >= 1.0 {
                assert_eq!(progress.completed_files, 3);
            }
        }
        assert_eq!(updates.last().unwrap().fraction, 1.0);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let files: Vec<(String, Vec<u8>)> = (0..6).map(|i| (format!("f{}.bin", i), vec![0u8; 8])).collect();
        let refs: Vec<(&str, &[u8])> = files.iter().map(|(name, data)| (name.as_str(), data.as_slice())).collect();
        let mut server = Server::new(&refs);
        server.delay = Duration::from_millis(50);
        let base = server.clone().start().await;
        let dir = tempfile::tempdir().unwrap();

        let tasks = files
            .iter()
            .map(|(name, _)| DownloadTask::new(format!("{}/{}", base, name), dir.path().join(name)))
            .collect();
        let downloader = DownloadOrchestrator::new(config()).unwrap();
        downloader
            .download_all(tasks, |_| {}, &CancellationToken::new())
            .await
            .unwrap();

        assert!(server.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_first_fatal_error_cancels_siblings() {
        let mut server = Server::new(&[("ok.bin", b"payload"), ("bad.bin", b"payload")]);
        server.delay = Duration::from_millis(200);
        server.fail("bad.bin", vec![Fault::Status(400)]);
        let base = server.clone().start().await;
        let dir = tempfile::tempdir().unwrap();

        let tasks = vec![
            DownloadTask::new(format!("{}/ok.bin", base), dir.path().join("ok.bin")),
            DownloadTask::new(format!("{}/bad.bin", base), dir.path().join("bad.bin")),
        ];
        let downloader = DownloadOrchestrator::new(config()).unwrap();
        let err = downloader
            .download_all(tasks, |_| {}, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::HttpStatus { status: 400, .. }));
        assert!(!dir.path().join("ok.bin").exists());
        assert!(!part_path(&dir.path().join("ok.bin")).exists());
    }

    #[tokio::test]
    async fn test_cancellation_stops_transfer() {
        let mut server = Server::new(&[("slow.bin", b"payload")]);
        server.delay = Duration::from_secs(5);
        let base = server.clone().start().await;
        let dir = tempfile::tempdir().unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let downloader = DownloadOrchestrator::new(config()).unwrap();
        let started = Instant::now();
        let err = downloader
            .download(
                DownloadTask::new(format!("{}/slow.bin", base), dir.path().join("slow.bin")),
                |_| {},
                &cancel,
            )
            .await
            .unwrap_err();

        assert_eq!(err, DownloadError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_mirrors_rotate_per_attempt() {
        let task = DownloadTask::with_mirrors(vec!["a".into(), "b".into()], "/tmp/x");
        assert_eq!(task.source_for_attempt(1), Some("a"));
        assert_eq!(task.source_for_attempt(2), Some("b"));
        assert_eq!(task.source_for_attempt(3), Some("a"));
    }

    #[test]
    fn test_error_classification() {
        let url = "http://host/file".to_string();
        assert!(DownloadError::Timeout { url: url.clone() }.is_retryable());
        assert!(DownloadError::HttpStatus { url: url.clone(), status: 429 }.is_retryable());
        assert!(!DownloadError::HttpStatus { url: url.clone(), status: 404 }.is_retryable());
        assert!(!DownloadError::Io {
            path: PathBuf::from("/x"),
            reason: "denied".into()
        }
        .is_retryable());
        assert!(matches!(
            LifecycleError::from(DownloadError::HttpStatus { url, status: 404 }),
            LifecycleError::DownloadFailed(_)
        ));
    }
}
