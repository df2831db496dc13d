//! Preloading prefetched images into the nested daemon.
//!
//! Waits for the daemon to answer, then imports every tarball in the
//! artifact directory. One bad tarball is reported and skipped; the rest
//! still load.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dindbox_artifacts::TARBALL_EXTENSION;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::docker::DaemonApi;

/// Loader errors. Individual tarball failures are not errors; they end up
/// in the [`LoadReport`].
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("daemon_not_ready: no answer after {attempts} attempts: {last_error}")]
    DaemonNotReady { attempts: u32, last_error: String },

    #[error("reading artifact directory {dir}: {source}")]
    ArtifactDir {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Loader settings.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub artifact_dir: PathBuf,
    pub ready_attempts: u32,
    pub ready_interval: Duration,
}

/// A tarball the daemon imported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedTarball {
    pub path: PathBuf,
    /// Names reported by the daemon.
    pub images: Vec<String>,
}

/// A tarball the daemon rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTarball {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of loading the artifact directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<LoadedTarball>,
    pub failed: Vec<FailedTarball>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Image tarballs in `dir`, sorted by name. A missing directory is empty.
pub fn list_tarballs(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut tarballs = Vec::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file()
            && path.extension().and_then(|e| e.to_str()) == Some(TARBALL_EXTENSION)
        {
            tarballs.push(path);
        }
    }
    tarballs.sort();
    Ok(tarballs)
}

/// Loads tarballs through a [`DaemonApi`].
pub struct ImageLoader {
    api: Arc<dyn DaemonApi>,
    config: LoaderConfig,
}

impl ImageLoader {
    pub fn new(api: Arc<dyn DaemonApi>, config: LoaderConfig) -> Self {
        Self { api, config }
    }

    /// Poll the daemon until it answers, at most `ready_attempts` times.
    /// Returns the attempt that succeeded.
    pub async fn wait_ready(&self) -> Result<u32, LoadError> {
        let attempts = self.config.ready_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.api.ping().await {
                Ok(()) => {
                    debug!(attempt, "daemon answered ping");
                    return Ok(attempt);
                }
                Err(e) => {
                    debug!(attempt, error = %e, "daemon not ready yet");
                    last_error = e.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.ready_interval).await;
            }
        }

        Err(LoadError::DaemonNotReady {
            attempts,
            last_error,
        })
    }

    /// Wait for the daemon, then load every tarball.
    pub async fn load_all(&self) -> Result<LoadReport, LoadError> {
        let dir = &self.config.artifact_dir;
        let tarballs = list_tarballs(dir).map_err(|source| LoadError::ArtifactDir {
            dir: dir.clone(),
            source,
        })?;

        if tarballs.is_empty() {
            info!(dir = %dir.display(), "no image tarballs to load");
            return Ok(LoadReport::default());
        }

        self.wait_ready().await?;

        let start = Instant::now();
        let mut report = LoadReport::default();

        for path in tarballs {
            match self.api.load_image(&path).await {
                Ok(images) => {
                    info!(path = %path.display(), images = ?images, "image loaded");
                    report.loaded.push(LoadedTarball { path, images });
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "image load failed");
                    report.failed.push(FailedTarball {
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "image preload finished"
        );

        Ok(report)
    }
}
