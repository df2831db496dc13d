//! Daemon-less prefetch of the artifact table into image tarballs.
//!
//! Every image in the table is resolved against its registry for the target
//! platform, its blobs are downloaded and verified into a staging directory,
//! and a `docker load` compatible tarball is written next to the others.
//! Tarballs appear under their final name only once complete, so a reader of
//! the artifact directory never sees a partial file.
//!
//! A run succeeds only if every image succeeds. Images already present with
//! the expected repo tag are left untouched, so re-running over a populated
//! directory is a no-op.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use dindbox_artifacts::archive::{
    archive_holds, read_archive_manifest, write_archive, ArchiveBlob, ArchiveContents,
};
use dindbox_artifacts::{ArtifactError, ArtifactRegistry, Platform, RegistryEntry, TarballArtifact};
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::oci::{ImageManifest, OciClient, OciConfig, OciError};

/// Directory (inside the target dir) holding in-flight downloads.
pub const STAGING_DIR: &str = ".staging";

/// Errors for a single image.
#[derive(Debug, Error)]
pub enum ImageFetchError {
    #[error("OCI error: {0}")]
    Oci(#[from] OciError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image too large: compressed size {size} bytes exceeds limit {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    #[error("Image has no pinned reference: {0}")]
    Unpinned(String),

    #[error("Prefetch task failed: {0}")]
    Task(String),
}

/// One image that could not be prefetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFailure {
    pub service: String,
    pub image: String,
    pub reason: String,
}

impl std::fmt::Display for ImageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.service, self.image, self.reason)
    }
}

/// Errors from a prefetch run.
#[derive(Debug, Error)]
pub enum PrefetchError {
    #[error("Invalid artifact registry: {0}")]
    InvalidRegistry(#[from] ArtifactError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OCI client error: {0}")]
    Client(#[from] OciError),

    #[error("{} of {total} images failed to prefetch: {}", .failures.len(), summarize(.failures))]
    Incomplete {
        total: usize,
        failures: Vec<ImageFailure>,
    },
}

fn summarize(failures: &[ImageFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Configuration for a prefetch run.
#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    /// Directory the tarballs are written to.
    pub target_dir: PathBuf,

    /// Platform every image is resolved for.
    pub platform: Platform,

    /// Maximum images fetched at the same time.
    pub concurrency: usize,

    /// Base URL overrides keyed by registry API host
    /// (e.g. `registry-1.docker.io` -> `https://mirror.internal`).
    pub mirrors: HashMap<String, String>,

    /// Maximum total compressed layer size of one image.
    pub max_image_size: u64,

    /// OCI client settings; `registry_url` is filled in per registry.
    pub oci: OciConfig,
}

impl PrefetchConfig {
    pub fn new(target_dir: impl Into<PathBuf>) -> Self {
        Self {
            target_dir: target_dir.into(),
            platform: Platform::default(),
            concurrency: 4,
            mirrors: HashMap::new(),
            max_image_size: 10 * 1024 * 1024 * 1024, // 10 GiB
            oci: OciConfig::default(),
        }
    }
}

/// Result for one image.
#[derive(Debug, Clone)]
pub struct PrefetchedImage {
    pub service: String,
    pub artifact: TarballArtifact,
    /// Digest of the platform manifest. `None` when the tarball was already present.
    pub manifest_digest: Option<String>,
    /// Size of the tarball in bytes.
    pub size_bytes: u64,
    pub layer_count: usize,
    /// Whether an existing tarball was kept instead of fetching.
    pub skipped: bool,
}

/// Result of a successful prefetch run, in table order.
#[derive(Debug, Clone, Default)]
pub struct PrefetchReport {
    pub images: Vec<PrefetchedImage>,
}

impl PrefetchReport {
    pub fn fetched(&self) -> usize {
        self.images.iter().filter(|i| !i.skipped).count()
    }

    pub fn skipped(&self) -> usize {
        self.images.iter().filter(|i| i.skipped).count()
    }

    pub fn total_bytes(&self) -> u64 {
        self.images.iter().map(|i| i.size_bytes).sum()
    }
}

struct Inner {
    config: PrefetchConfig,
    /// One client per registry, shared so bearer tokens are reused.
    clients: Mutex<HashMap<String, Arc<OciClient>>>,
}

/// Fetches the artifact table into tarballs.
#[derive(Clone)]
pub struct Prefetcher {
    inner: Arc<Inner>,
}

impl Prefetcher {
    pub fn new(config: PrefetchConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                clients: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &PrefetchConfig {
        &self.inner.config
    }

    /// Fetch every image in `registry`. Fails if any image fails.
    pub async fn run(&self, registry: &ArtifactRegistry) -> Result<PrefetchReport, PrefetchError> {
        registry.validate()?;

        let config = &self.inner.config;
        tokio::fs::create_dir_all(&config.target_dir).await?;

        let start = Instant::now();
        info!(
            dir = %config.target_dir.display(),
            platform = %config.platform,
            images = registry.len(),
            concurrency = config.concurrency,
            "Prefetching images"
        );

        let artifacts = registry.artifacts(&config.target_dir, &config.platform);
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));

        let tasks = registry
            .entries()
            .iter()
            .cloned()
            .zip(artifacts)
            .map(|(entry, artifact)| {
                let prefetcher = self.clone();
                let semaphore = semaphore.clone();
                tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| ImageFetchError::Task(e.to_string()))?;
                    prefetcher.fetch_one(&entry, artifact).await
                })
            })
            .collect::<Vec<_>>();

        let results = join_all(tasks).await;

        let mut report = PrefetchReport::default();
        let mut failures = Vec::new();

        for (entry, result) in registry.entries().iter().zip(results) {
            let result = result.unwrap_or_else(|e| Err(ImageFetchError::Task(e.to_string())));
            match result {
                Ok(image) => report.images.push(image),
                Err(e) => {
                    error!(
                        service = %entry.service,
                        image = %entry.image,
                        error = %e,
                        "Image prefetch failed"
                    );
                    failures.push(ImageFailure {
                        service: entry.service.clone(),
                        image: entry.image.canonical(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        // Blobs of failed images are already removed; drop the empty parent.
        tokio::fs::remove_dir(config.target_dir.join(STAGING_DIR)).await.ok();

        if !failures.is_empty() {
            return Err(PrefetchError::Incomplete {
                total: registry.len(),
                failures,
            });
        }

        info!(
            fetched = report.fetched(),
            skipped = report.skipped(),
            total_bytes = report.total_bytes(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Prefetch completed"
        );

        Ok(report)
    }

    async fn fetch_one(
        &self,
        entry: &RegistryEntry,
        artifact: TarballArtifact,
    ) -> Result<PrefetchedImage, ImageFetchError> {
        let repo_tag = entry.image.repo_tag();

        if archive_holds(&artifact.path, &repo_tag, &artifact.platform) {
            let size_bytes = tokio::fs::metadata(&artifact.path).await?.len();
            let layer_count = read_archive_manifest(&artifact.path)?
                .iter()
                .map(|m| m.layers.len())
                .sum();

            debug!(
                service = %entry.service,
                path = %artifact.path.display(),
                "Tarball already present"
            );

            return Ok(PrefetchedImage {
                service: entry.service.clone(),
                artifact,
                manifest_digest: None,
                size_bytes,
                layer_count,
                skipped: true,
            });
        }

        if artifact.path.exists() {
            warn!(
                path = %artifact.path.display(),
                expected = %repo_tag,
                platform = %artifact.platform,
                "Replacing tarball that does not hold the expected image"
            );
        }

        let start = Instant::now();
        let staging = self.staging_dir(&artifact.path);
        let result = self.fetch_into(entry, &artifact, &staging).await;
        tokio::fs::remove_dir_all(&staging).await.ok();

        let (manifest, size_bytes) = result?;

        info!(
            service = %entry.service,
            image = %entry.image,
            digest = %manifest.digest,
            layers = manifest.layers.len(),
            size_bytes,
            duration_ms = start.elapsed().as_millis() as u64,
            "Image tarball written"
        );

        Ok(PrefetchedImage {
            service: entry.service.clone(),
            artifact,
            manifest_digest: Some(manifest.digest),
            size_bytes,
            layer_count: manifest.layers.len(),
            skipped: false,
        })
    }

    /// Download blobs into `staging` and write the tarball.
    async fn fetch_into(
        &self,
        entry: &RegistryEntry,
        artifact: &TarballArtifact,
        staging: &Path,
    ) -> Result<(ImageManifest, u64), ImageFetchError> {
        let reference = entry
            .image
            .reference()
            .ok_or_else(|| ImageFetchError::Unpinned(entry.image.canonical()))?;
        let repo = entry.image.repository();
        let client = self.client_for(entry.image.api_host()).await?;

        let manifest = client
            .resolve_manifest(repo, reference.as_str(), &artifact.platform)
            .await?;

        let total = manifest.total_layer_size();
        if total > self.inner.config.max_image_size {
            return Err(ImageFetchError::ImageTooLarge {
                size: total,
                limit: self.inner.config.max_image_size,
            });
        }

        debug!(
            service = %entry.service,
            digest = %manifest.digest,
            layer_count = manifest.layers.len(),
            total_compressed_bytes = total,
            "Manifest resolved, pulling blobs"
        );

        tokio::fs::create_dir_all(staging).await?;

        let config_path = staging.join(blob_file_name(&manifest.config.digest));
        client
            .pull_blob(repo, &manifest.config.digest, &config_path)
            .await?;

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for (i, layer) in manifest.layers.iter().enumerate() {
            let path = staging.join(blob_file_name(&layer.digest));
            if !path.exists() {
                debug!(layer = i, digest = %layer.digest, size = layer.size, "Pulling layer");
                client.pull_blob(repo, &layer.digest, &path).await?;
            }
            layers.push(ArchiveBlob {
                digest: layer.digest.clone(),
                media_type: layer.media_type.clone(),
                path,
            });
        }

        let contents = ArchiveContents {
            repo_tag: entry.image.repo_tag(),
            config: ArchiveBlob {
                digest: manifest.config.digest.clone(),
                media_type: manifest.config.media_type.clone(),
                path: config_path,
            },
            layers,
        };

        let size = write_tarball(artifact.path.clone(), contents).await?;
        Ok((manifest, size))
    }

    fn staging_dir(&self, tarball: &Path) -> PathBuf {
        let stem = tarball
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.inner.config.target_dir.join(STAGING_DIR).join(stem)
    }

    async fn client_for(&self, api_host: &str) -> Result<Arc<OciClient>, OciError> {
        let mut clients = self.inner.clients.lock().await;
        if let Some(client) = clients.get(api_host) {
            return Ok(client.clone());
        }

        let mut oci = self.inner.config.oci.clone();
        oci.registry_url = registry_url(api_host, &self.inner.config.mirrors);
        debug!(host = %api_host, url = %oci.registry_url, "Creating registry client");

        let client = Arc::new(OciClient::new(oci)?);
        clients.insert(api_host.to_string(), client.clone());
        Ok(client)
    }
}

/// Base URL for a registry API host, honouring mirrors.
pub fn registry_url(api_host: &str, mirrors: &HashMap<String, String>) -> String {
    if let Some(mirror) = mirrors.get(api_host) {
        return mirror.trim_end_matches('/').to_string();
    }
    if api_host.starts_with("http://") || api_host.starts_with("https://") {
        api_host.trim_end_matches('/').to_string()
    } else {
        format!("https://{api_host}")
    }
}

fn blob_file_name(digest: &str) -> String {
    digest.replace(':', "-")
}

/// Write the archive to `{dest}.tmp` and rename it into place.
async fn write_tarball(dest: PathBuf, contents: ArchiveContents) -> Result<u64, ImageFetchError> {
    tokio::task::spawn_blocking(move || {
        let temp = dest.with_extension("tar.tmp");
        let written = write_archive(&temp, &contents).and_then(|size| {
            std::fs::rename(&temp, &dest)?;
            Ok(size)
        });
        if written.is_err() {
            std::fs::remove_file(&temp).ok();
        }
        written
    })
    .await
    .map_err(|e| ImageFetchError::Task(e.to_string()))?
    .map_err(ImageFetchError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("registry-1.docker.io", "https://registry-1.docker.io")]
    #[case("ghcr.io", "https://ghcr.io")]
    #[case("http://127.0.0.1:5000/", "http://127.0.0.1:5000")]
    fn test_registry_url(#[case] host: &str, #[case] expected: &str) {
        assert_eq!(registry_url(host, &HashMap::new()), expected);
    }

    #[test]
    fn test_registry_url_prefers_mirror() {
        let mirrors = HashMap::from([(
            "registry-1.docker.io".to_string(),
            "http://mirror.local:5000/".to_string(),
        )]);
        assert_eq!(
            registry_url("registry-1.docker.io", &mirrors),
            "http://mirror.local:5000"
        );
        assert_eq!(registry_url("ghcr.io", &mirrors), "https://ghcr.io");
    }

    #[test]
    fn test_blob_file_name() {
        assert_eq!(blob_file_name("sha256:abc"), "sha256-abc");
    }

    #[test]
    fn test_staging_dir_is_per_image() {
        let prefetcher = Prefetcher::new(PrefetchConfig::new("/var/lib/supabase-images"));
        assert_eq!(
            prefetcher.staging_dir(Path::new("/var/lib/supabase-images/postgres.tar")),
            PathBuf::from("/var/lib/supabase-images/.staging/postgres")
        );
    }

    #[test]
    fn test_incomplete_error_lists_failures() {
        let err = PrefetchError::Incomplete {
            total: 3,
            failures: vec![ImageFailure {
                service: "kong".to_string(),
                image: "docker.io/library/kong:9.9.9".to_string(),
                reason: "Not found: library/kong@9.9.9".to_string(),
            }],
        };
        let message = err.to_string();
        assert!(message.starts_with("1 of 3 images failed to prefetch"));
        assert!(message.contains("kong (docker.io/library/kong:9.9.9)"));
    }
}
