//! On-disk layout
//!
//! ```text
//! <models_dir>/<model-id>/...            verified artifacts
//! <work_dir>/<model-id>/download/...     transient downloads
//! <work_dir>/<model-id>/extracted/...    transient extraction output
//! ```

use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Sub-directory for downloaded files
const DOWNLOAD_DIR: &str = "download";

/// Sub-directory for extraction output
const EXTRACT_DIR: &str = "extracted";

/// Digest bytes appended to a namespace
const NAMESPACE_DIGEST_BYTES: usize = 8;

/// Artifact storage layout
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Verified model directories
    models_dir: PathBuf,

    /// Transient working directories
    work_dir: PathBuf,
}

/// Transient working directories of one acquisition
#[derive(Debug, Clone)]
pub struct Workspace {
    /// `<work_dir>/<model-id>`
    pub root: PathBuf,
    /// Destination of downloaded files
    pub download_dir: PathBuf,
    /// Destination of extraction output
    pub extract_dir: PathBuf,
}

impl Workspace {
    /// Removes the whole working directory; a missing directory is not an error
    pub async fn cleanup(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                debug!("Removed working directory {}", self.root.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Returns true while the working directory exists
    pub fn exists(&self) -> bool {
        self.root.exists()
    }
}

impl StorageLayout {
    /// Creates a layout rooted at the given directories
    pub fn new(models_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            work_dir: work_dir.into(),
        }
    }

    /// Verified model root
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Transient work root
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Maps a model id onto a single safe path component
    ///
    /// A digest of the raw id follows the readable prefix.
    pub fn namespace(model_id: &str) -> String {
        let cleaned: String = model_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        let digest = Sha256::digest(model_id.as_bytes());
        format!("{}-{}", cleaned, hex::encode(&digest[..NAMESPACE_DIGEST_BYTES]))
    }

    /// Directory holding the verified artifacts of a model
    pub fn model_dir(&self, model_id: &str) -> PathBuf {
        self.models_dir.join(Self::namespace(model_id))
    }

    /// Working directory paths of a model, without touching the disk
    pub fn workspace(&self, model_id: &str) -> Workspace {
        let root = self.work_dir.join(Self::namespace(model_id));
        Workspace {
            download_dir: root.join(DOWNLOAD_DIR),
            extract_dir: root.join(EXTRACT_DIR),
            root,
        }
    }

    /// Creates a fresh working directory, discarding leftovers of an earlier run
    pub async fn prepare_workspace(&self, model_id: &str) -> io::Result<Workspace> {
        let workspace = self.workspace(model_id);
        if workspace.exists() {
            warn!("Discarding stale working directory {}", workspace.root.display());
            workspace.cleanup().await?;
        }
        tokio::fs::create_dir_all(&workspace.download_dir).await?;
        Ok(workspace)
    }

    /// Moves a verified artifact directory into the model store
    ///
    /// `artifact` must lie inside `source_dir`; its new location is returned.
    pub async fn install(&self, model_id: &str, source_dir: &Path, artifact: &Path) -> io::Result<PathBuf> {
        let relative = artifact
            .strip_prefix(source_dir)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "artifact outside of source directory"))?
            .to_path_buf();
        let target = self.model_dir(model_id);

        tokio::fs::create_dir_all(&self.models_dir).await?;
        match tokio::fs::remove_dir_all(&target).await {
            Ok(()) => debug!("Replacing previous artifacts at {}", target.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        if let Err(e) = tokio::fs::rename(source_dir, &target).await {
            // rename fails across filesystems
            debug!("Rename into model store failed ({}), copying instead", e);
            let (from, to) = (source_dir.to_path_buf(), target.clone());
            tokio::task::spawn_blocking(move || copy_dir(&from, &to))
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))??;
        }

        Ok(target.join(relative))
    }
}

fn copy_dir(from: &Path, to: &Path) -> io::Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let destination = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination)?;
        } else {
            std::fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}
