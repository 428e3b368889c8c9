use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::http::{FetchError, HttpSource};

#[derive(Debug, Error)]
pub enum ImageAcquisitionError {
    #[error("image download failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("image filename {0:?} is not a plain file name")]
    InvalidFilename(String),
}

impl ImageAcquisitionError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Result of one acquisition attempt. `DownloadFailed` is not fatal to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImageOutcome {
    Stored {
        filename: String,
        byte_size: usize,
        sha256: String,
    },
    AlreadyPresent {
        filename: String,
    },
    DownloadFailed {
        filename: String,
        reason: String,
    },
}

impl ImageOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ImageOutcome::DownloadFailed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct StoredImage {
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub sha256: String,
}

/// Flat directory of camera snapshots, one file per observation.
#[derive(Debug, Clone)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn path_for(&self, filename: &str) -> Result<PathBuf, ImageAcquisitionError> {
        let plain = !filename.is_empty()
            && !filename.starts_with('.')
            && !filename.contains(['/', '\\'])
            && Path::new(filename).file_name() == Some(OsStr::new(filename));
        if !plain {
            return Err(ImageAcquisitionError::InvalidFilename(filename.to_string()));
        }
        Ok(self.root.join(filename))
    }

    pub async fn contains(&self, filename: &str) -> Result<bool, ImageAcquisitionError> {
        let path = self.path_for(filename)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| ImageAcquisitionError::io(format!("checking image path {}", path.display()), e))
    }

    /// Presence check, then download, then atomic publish. Never retries.
    pub async fn acquire(&self, source: &dyn HttpSource, url: &str, filename: &str) -> ImageOutcome {
        let span = tracing::info_span!("image_acquire", filename, url);
        async {
            match self.try_acquire(source, url, filename).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(error = %err, "image acquisition failed; row is kept for backfill");
                    ImageOutcome::DownloadFailed {
                        filename: filename.to_string(),
                        reason: err.to_string(),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn try_acquire(
        &self,
        source: &dyn HttpSource,
        url: &str,
        filename: &str,
    ) -> Result<ImageOutcome, ImageAcquisitionError> {
        if self.contains(filename).await? {
            info!("image already present; skipping download");
            return Ok(ImageOutcome::AlreadyPresent {
                filename: filename.to_string(),
            });
        }

        let bytes = source.fetch_bytes(url).await?;
        let stored = self.store_bytes(filename, &bytes).await?;
        info!(byte_size = stored.byte_size, sha256 = %stored.sha256, "image stored");
        Ok(ImageOutcome::Stored {
            filename: filename.to_string(),
            byte_size: stored.byte_size,
            sha256: stored.sha256,
        })
    }

    /// Write to a hidden temp file in the target directory, then rename into place.
    ///
    /// Readers never observe a partially written file under `filename`. Two
    /// writers racing on one name both succeed; the name is derived from the
    /// observation, so either file is the same snapshot.
    pub async fn store_bytes(
        &self,
        filename: &str,
        bytes: &[u8],
    ) -> Result<StoredImage, ImageAcquisitionError> {
        let absolute_path = self.path_for(filename)?;
        let sha256 = Self::sha256_hex(bytes);

        fs::create_dir_all(&self.root).await.map_err(|e| {
            ImageAcquisitionError::io(format!("creating image directory {}", self.root.display()), e)
        })?;

        let temp_path = self.root.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(ImageAcquisitionError::io(
                format!("writing temp image file {}", temp_path.display()),
                err,
            ));
        }

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(ImageAcquisitionError::io(
                format!(
                    "renaming temp image {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                ),
                err,
            ));
        }
        Ok(StoredImage {
            absolute_path,
            byte_size: bytes.len(),
            sha256,
        })
    }
}
