//! OCI registry client for pulling images without a container daemon.
//!
//! Implements the parts of the OCI Distribution Specification the
//! prefetcher needs: manifest fetch by tag or digest (with multi-platform
//! index resolution), blob download with SHA-256 verification, and the
//! anonymous bearer token flow.
//!
//! Reference: https://github.com/opencontainers/distribution-spec

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use dindbox_artifacts::Platform;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, WWW_AUTHENTICATE};
use reqwest::{Client, Response, StatusCode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::auth::{BearerChallenge, TokenResponse};

/// Media types accepted for manifest requests, index types first.
pub const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json";

/// Header carrying the registry-computed manifest digest.
const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Errors from OCI operations.
#[derive(Debug, Error)]
pub enum OciError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication required for {0}")]
    AuthRequired(String),

    #[error("Registry returned {status} for {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("No manifest for platform {platform} (available: {available})")]
    NoMatchingPlatform { platform: String, available: String },

    #[error("Unsupported manifest: {0}")]
    UnsupportedManifest(String),

    #[error("Blob too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("Pull timeout after {0:?}")]
    Timeout(Duration),
}

/// Configuration for the OCI client.
#[derive(Debug, Clone)]
pub struct OciConfig {
    /// Registry base URL (e.g., "https://registry-1.docker.io").
    pub registry_url: String,
    /// Timeout for one manifest or blob transfer.
    pub transfer_timeout: Duration,
    /// Client-wide request timeout.
    pub total_timeout: Duration,
    /// Max size of a single blob.
    pub max_blob_size: u64,
}

impl Default for OciConfig {
    fn default() -> Self {
        Self {
            registry_url: "https://registry-1.docker.io".to_string(),
            transfer_timeout: Duration::from_secs(300), // 5 minutes
            total_timeout: Duration::from_secs(1800),   // 30 minutes
            max_blob_size: 10 * 1024 * 1024 * 1024,     // 10 GiB
        }
    }
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    #[serde(default)]
    pub media_type: String,
    /// Digest of the content.
    pub digest: String,
    /// Size in bytes.
    pub size: u64,
}

/// Platform of an index entry.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct IndexPlatform {
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub variant: Option<String>,
}

/// Entry of an image index / manifest list.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub platform: Option<IndexPlatform>,
}

/// Either an image manifest or an index, as returned by the registry.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDocument {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Vec<IndexEntry>,
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
}

/// Single-platform image manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageManifest {
    /// Digest of the manifest itself.
    pub digest: String,
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors, base layer first.
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Get total compressed size of all layers.
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// OCI Distribution client bound to one registry.
pub struct OciClient {
    config: OciConfig,
    client: Client,
    /// Bearer tokens keyed by repository (tokens are scoped per repository).
    tokens: Mutex<HashMap<String, String>>,
}

impl OciClient {
    /// Create a new OCI client.
    pub fn new(config: OciConfig) -> Result<Self, OciError> {
        let client = Client::builder().timeout(config.total_timeout).build()?;

        Ok(Self {
            config,
            client,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry_url(&self) -> &str {
        &self.config.registry_url
    }

    /// Resolve `reference` (tag or digest) to the manifest for `platform`.
    ///
    /// If the registry returns an index, the entry matching `platform` is
    /// fetched by digest.
    pub async fn resolve_manifest(
        &self,
        repo: &str,
        reference: &str,
        platform: &Platform,
    ) -> Result<ImageManifest, OciError> {
        let (body, advertised) = self.fetch_manifest(repo, reference).await?;
        let digest = verify_manifest_digest(&body, reference, advertised.as_deref())?;
        let document: ManifestDocument = serde_json::from_slice(&body)?;

        if !document.manifests.is_empty() {
            let entry = select_platform(&document.manifests, platform)?;
            debug!(
                repo = %repo,
                reference = %reference,
                platform = %platform,
                digest = %entry.digest,
                "Index resolved to platform manifest"
            );

            let (body, advertised) = self.fetch_manifest(repo, &entry.digest).await?;
            let digest = verify_manifest_digest(&body, &entry.digest, advertised.as_deref())?;
            let document: ManifestDocument = serde_json::from_slice(&body)?;
            return into_image_manifest(document, digest);
        }

        into_image_manifest(document, digest)
    }

    async fn fetch_manifest(
        &self,
        repo: &str,
        reference: &str,
    ) -> Result<(Vec<u8>, Option<String>), OciError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.config.registry_url, repo, reference
        );

        debug!(url = %url, "Pulling manifest");

        let response = tokio::time::timeout(
            self.config.transfer_timeout,
            self.get(repo, &url, Some(MANIFEST_ACCEPT)),
        )
        .await
        .map_err(|_| OciError::Timeout(self.config.transfer_timeout))??;

        match response.status() {
            StatusCode::OK => {
                let advertised = response
                    .headers()
                    .get(DOCKER_CONTENT_DIGEST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = response.bytes().await?;
                Ok((body.to_vec(), advertised))
            }
            status => Err(status_error(status, repo, reference, &url)),
        }
    }

    /// Pull a blob by digest to a file. Returns the number of bytes written.
    ///
    /// The blob is streamed to `{dest}.part`, verified, then renamed.
    pub async fn pull_blob(&self, repo: &str, digest: &str, dest: &Path) -> Result<u64, OciError> {
        tokio::time::timeout(
            self.config.transfer_timeout,
            self.pull_blob_inner(repo, digest, dest),
        )
        .await
        .map_err(|_| OciError::Timeout(self.config.transfer_timeout))?
    }

    async fn pull_blob_inner(&self, repo: &str, digest: &str, dest: &Path) -> Result<u64, OciError> {
        let url = format!("{}/v2/{}/blobs/{}", self.config.registry_url, repo, digest);

        debug!(url = %url, dest = %dest.display(), "Pulling blob");

        let mut response = self.get(repo, &url, None).await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(status_error(status, repo, digest, &url));
        }

        let advertised_size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if let Some(size) = advertised_size {
            if size > self.config.max_blob_size {
                return Err(OciError::TooLarge {
                    size,
                    limit: self.config.max_blob_size,
                });
            }
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_path = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&temp_path).await?;
        let mut hasher = Sha256::new();
        let mut total_bytes = 0u64;

        let written: Result<(), OciError> = async {
            while let Some(chunk) = response.chunk().await? {
                total_bytes += chunk.len() as u64;
                if total_bytes > self.config.max_blob_size {
                    return Err(OciError::TooLarge {
                        size: total_bytes,
                        limit: self.config.max_blob_size,
                    });
                }
                hasher.update(&chunk);
                file.write_all(&chunk).await?;
            }
            file.sync_all().await?;
            Ok(())
        }
        .await;
        drop(file);

        if let Err(e) = written {
            tokio::fs::remove_file(&temp_path).await.ok();
            return Err(e);
        }

        let computed = format!("sha256:{}", hex::encode(hasher.finalize()));
        if computed != digest {
            tokio::fs::remove_file(&temp_path).await.ok();
            return Err(OciError::DigestMismatch {
                expected: digest.to_string(),
                actual: computed,
            });
        }

        tokio::fs::rename(&temp_path, dest).await?;

        info!(
            digest = %digest,
            size = total_bytes,
            "Blob downloaded"
        );

        Ok(total_bytes)
    }

    /// GET with bearer token handling. A `401` carrying a bearer challenge
    /// triggers one anonymous token fetch and a retry.
    async fn get(&self, repo: &str, url: &str, accept: Option<&str>) -> Result<Response, OciError> {
        let mut authenticated = false;

        loop {
            let mut request = self.client.get(url);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            if let Some(token) = self.tokens.lock().await.get(repo) {
                request = request.bearer_auth(token);
            }

            let response = request.send().await?;
            if response.status() != StatusCode::UNAUTHORIZED || authenticated {
                return Ok(response);
            }

            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .and_then(BearerChallenge::parse)
                .ok_or_else(|| OciError::AuthRequired(repo.to_string()))?;

            let token = self.fetch_token(repo, &challenge).await?;
            self.tokens.lock().await.insert(repo.to_string(), token);
            authenticated = true;
        }
    }

    async fn fetch_token(&self, repo: &str, challenge: &BearerChallenge) -> Result<String, OciError> {
        debug!(realm = %challenge.realm, scope = ?challenge.scope, "Requesting anonymous token");

        let response = self
            .client
            .get(&challenge.realm)
            .query(&challenge.query())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(OciError::AuthRequired(repo.to_string()));
        }

        let token: TokenResponse = response.json().await?;
        token
            .into_token()
            .ok_or_else(|| OciError::AuthRequired(repo.to_string()))
    }
}

fn status_error(status: StatusCode, repo: &str, reference: &str, url: &str) -> OciError {
    match status {
        StatusCode::NOT_FOUND => OciError::NotFound(format!("{repo}@{reference}")),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => OciError::AuthRequired(repo.to_string()),
        other => OciError::UnexpectedStatus {
            status: other.as_u16(),
            url: url.to_string(),
        },
    }
}

/// Compute the manifest digest and check it against what was requested
/// (when requesting by digest) and what the registry advertised.
fn verify_manifest_digest(
    body: &[u8],
    reference: &str,
    advertised: Option<&str>,
) -> Result<String, OciError> {
    let computed = sha256_digest(body);

    let expected = if reference.starts_with("sha256:") {
        Some(reference)
    } else {
        advertised.filter(|d| d.starts_with("sha256:"))
    };

    if let Some(expected) = expected {
        if expected != computed {
            return Err(OciError::DigestMismatch {
                expected: expected.to_string(),
                actual: computed,
            });
        }
    }

    Ok(computed)
}

/// Pick the index entry for `platform`.
pub fn select_platform<'a>(
    entries: &'a [IndexEntry],
    platform: &Platform,
) -> Result<&'a IndexEntry, OciError> {
    entries
        .iter()
        .find(|entry| {
            entry.platform.as_ref().is_some_and(|p| {
                platform.matches(&p.os, &p.architecture, p.variant.as_deref())
            })
        })
        .ok_or_else(|| OciError::NoMatchingPlatform {
            platform: platform.to_string(),
            available: entries
                .iter()
                .filter_map(|e| e.platform.as_ref())
                .map(|p| format!("{}/{}", p.os, p.architecture))
                .collect::<Vec<_>>()
                .join(", "),
        })
}

fn into_image_manifest(document: ManifestDocument, digest: String) -> Result<ImageManifest, OciError> {
    match document.config {
        Some(config) => Ok(ImageManifest {
            digest,
            config,
            layers: document.layers,
        }),
        None => Err(OciError::UnsupportedManifest(
            document
                .media_type
                .unwrap_or_else(|| "manifest without config".to_string()),
        )),
    }
}
