//! Archive extraction
//!
//! The extractor is chosen purely from the artifact's file name. Compressed
//! layers are streamed through `async-compression`; tar unpacking is blocking
//! work and runs on the blocking pool.

use std::path::{Path, PathBuf};
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use common::error::LifecycleError;

/// Intermediate tar produced when unpacking a compressed tarball
const INTERMEDIATE_TAR: &str = ".intermediate.tar";

/// Extraction errors
#[derive(Error, Debug)]
pub enum ExtractionError {
    /// Reading or writing failed
    #[error("io error during extraction of {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The archive file name carries no usable stem
    #[error("cannot derive output name from {0}")]
    InvalidName(PathBuf),

    /// Blocking unpack task was lost
    #[error("unpack task failed: {0}")]
    Join(String),
}

impl From<ExtractionError> for LifecycleError {
    fn from(err: ExtractionError) -> Self {
        LifecycleError::ExtractionFailed(err.to_string())
    }
}

/// Strategy for unpacking one artifact type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extractor {
    /// Plain tarball
    Tar,
    /// Gzip-compressed tarball (`.tar.gz`, `.tgz`)
    TarGz,
    /// Zstandard-compressed tarball (`.tar.zst`, `.tzst`)
    TarZst,
    /// Single gzip-compressed file
    Gzip,
    /// Single zstandard-compressed file
    Zstd,
}

/// Picks the extractor for an artifact, or `None` when it needs no unpacking
pub fn select_extractor(artifact: &Path) -> Option<Extractor> {
    let name = artifact.file_name()?.to_str()?.to_ascii_lowercase();

    // compound extensions first
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Some(Extractor::TarGz)
    } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
        Some(Extractor::TarZst)
    } else if name.ends_with(".tar") {
        Some(Extractor::Tar)
    } else if name.ends_with(".gz") {
        Some(Extractor::Gzip)
    } else if name.ends_with(".zst") {
        Some(Extractor::Zstd)
    } else {
        None
    }
}

impl Extractor {
    /// Unpacks `archive` into `destination` and returns the directory holding the output
    pub async fn extract(&self, archive: &Path, destination: &Path) -> Result<PathBuf, ExtractionError> {
        info!("Extracting {} with {:?}", archive.display(), self);

        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|source| io_error(destination, source))?;

        match self {
            Extractor::Tar => unpack_tar(archive.to_path_buf(), destination.to_path_buf()).await?,
            Extractor::TarGz | Extractor::TarZst => {
                let intermediate = destination.join(INTERMEDIATE_TAR);
                self.decompress_to(archive, &intermediate).await?;
                let unpacked = unpack_tar(intermediate.clone(), destination.to_path_buf()).await;
                remove_intermediate(&intermediate).await;
                unpacked?;
            }
            Extractor::Gzip | Extractor::Zstd => {
                let output = destination.join(single_file_name(archive)?);
                self.decompress_to(archive, &output).await?;
            }
        }

        debug!("Extracted {} into {}", archive.display(), destination.display());

        Ok(destination.to_path_buf())
    }

    async fn decompress_to(&self, archive: &Path, output: &Path) -> Result<u64, ExtractionError> {
        let input = File::open(archive).await.map_err(|source| io_error(archive, source))?;
        let reader = BufReader::new(input);

        match self {
            Extractor::TarGz | Extractor::Gzip => copy_to_file(GzipDecoder::new(reader), archive, output).await,
            Extractor::TarZst | Extractor::Zstd => copy_to_file(ZstdDecoder::new(reader), archive, output).await,
            Extractor::Tar => copy_to_file(reader, archive, output).await,
        }
    }
}

async fn copy_to_file<R>(reader: R, archive: &Path, output: &Path) -> Result<u64, ExtractionError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = reader;
    let mut file = File::create(output).await.map_err(|source| io_error(output, source))?;
    let written = tokio::io::copy(&mut reader, &mut file)
        .await
        .map_err(|source| io_error(archive, source))?;
    file.flush().await.map_err(|source| io_error(output, source))?;
    Ok(written)
}

async fn unpack_tar(archive: PathBuf, destination: PathBuf) -> Result<(), ExtractionError> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&archive).map_err(|source| io_error(&archive, source))?;
        let mut tarball = tar::Archive::new(file);
        tarball
            .unpack(&destination)
            .map_err(|source| io_error(&archive, source))
    })
    .await
    .map_err(|e| ExtractionError::Join(e.to_string()))?
}

/// `model.gguf.gz` -> `model.gguf`
fn single_file_name(archive: &Path) -> Result<String, ExtractionError> {
    archive
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ExtractionError::InvalidName(archive.to_path_buf()))
}

fn io_error(path: &Path, source: std::io::Error) -> ExtractionError {
    ExtractionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Finds the canonical model file below `directory`
///
/// Among regular files whose extension is one of `extensions`, the largest
/// wins; equal sizes are broken by path so the choice is deterministic.
pub fn find_model_artifact(directory: &Path, extensions: &[&str]) -> Option<PathBuf> {
    WalkDir::new(directory)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| extensions.iter().any(|wanted| wanted.eq_ignore_ascii_case(ext)))
                .unwrap_or(false)
        })
        .filter_map(|entry| {
            let size = entry.metadata().ok()?.len();
            Some((size, entry.into_path()))
        })
        .max_by(|(size_a, path_a), (size_b, path_b)| size_a.cmp(size_b).then_with(|| path_b.cmp(path_a)))
        .map(|(_, path)| path)
}

/// Removes a decompressed intermediate file; returns true if it was removed
async fn remove_intermediate(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("Removed intermediate file {}", path.display());
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Failed to remove intermediate file {}: {}", path.display(), e);
            false
        }
    }
}
