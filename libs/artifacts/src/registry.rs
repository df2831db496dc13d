//! The artifact table: which images a sandbox starts with.
//!
//! The table is ordered and fixed at build time. Every entry must be pinned
//! and map to its own tarball name, so the prefetcher and the runtime
//! loader agree on the artifact set without any shared state beyond the
//! artifact directory.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ArtifactError;
use crate::naming::tarball_name;
use crate::reference::{ImageReference, Platform};

/// Directory the prefetched tarballs are baked into.
pub const DEFAULT_ARTIFACT_DIR: &str = "/var/lib/supabase-images";

/// Supabase local stack images, pinned to the versions the installed
/// Supabase CLI expects.
pub const SUPABASE_IMAGES: &[(&str, &str)] = &[
    ("db", "supabase/postgres:15.8.1.085"),
    ("auth", "supabase/gotrue:v2.186.0"),
    ("rest", "postgrest/postgrest:v14.3"),
    ("realtime", "supabase/realtime:v2.73.2"),
    ("storage", "supabase/storage-api:v1.35.3"),
    ("pg-meta", "supabase/postgres-meta:v0.95.2"),
    ("studio", "supabase/studio:2026.01.27-sha-2a37755"),
    ("edge-runtime", "supabase/edge-runtime:v1.70.0"),
    ("analytics", "supabase/logflare:1.30.5"),
    ("pooler", "supabase/supavisor:2.7.4"),
    ("kong", "library/kong:2.8.1"),
    ("imgproxy", "darthsim/imgproxy:v3.8.0"),
    ("vector", "timberio/vector:0.28.1-alpine"),
    ("inbucket", "axllent/mailpit:v1.22.3"),
];

/// One row of the artifact table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    /// Logical service name (`db`, `auth`, ...).
    pub service: String,
    /// Pinned image reference.
    pub image: ImageReference,
}

/// A tarball produced by the prefetcher and consumed by the image loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarballArtifact {
    /// Image the tarball was pulled from.
    pub source: ImageReference,
    /// Absolute path of the tarball.
    pub path: PathBuf,
    /// Platform the image was resolved for.
    pub platform: Platform,
}

/// Ordered set of images to prefetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRegistry {
    entries: Vec<RegistryEntry>,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default, rename = "image")]
    images: Vec<RegistryFileEntry>,
}

#[derive(Debug, Deserialize)]
struct RegistryFileEntry {
    service: String,
    reference: String,
}

impl ArtifactRegistry {
    /// The built-in Supabase table.
    pub fn supabase() -> Self {
        let entries = SUPABASE_IMAGES
            .iter()
            .map(|(service, image)| RegistryEntry {
                service: service.to_string(),
                // Static table; covered by test_supabase_table_is_valid
                image: ImageReference::parse(image)
                    .unwrap_or_else(|e| panic!("built-in image table is invalid: {e}")),
            })
            .collect();
        Self { entries }
    }

    /// Build a table from `(service, reference)` pairs and validate it.
    pub fn from_entries<S, R>(entries: impl IntoIterator<Item = (S, R)>) -> Result<Self, ArtifactError>
    where
        S: Into<String>,
        R: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .map(|(service, reference)| {
                Ok(RegistryEntry {
                    service: service.into(),
                    image: ImageReference::parse(reference.as_ref())?,
                })
            })
            .collect::<Result<Vec<_>, ArtifactError>>()?;

        let registry = Self { entries };
        registry.validate()?;
        Ok(registry)
    }

    /// Parse a TOML table of `[[image]]` rows with `service` and `reference`.
    pub fn from_toml_str(input: &str) -> Result<Self, ArtifactError> {
        let file: RegistryFile =
            toml::from_str(input).map_err(|e| ArtifactError::InvalidRegistryFile(e.to_string()))?;
        if file.images.is_empty() {
            return Err(ArtifactError::InvalidRegistryFile(
                "no [[image]] entries".to_string(),
            ));
        }
        Self::from_entries(file.images.into_iter().map(|e| (e.service, e.reference)))
    }

    /// Check the table invariants: pinned tags, unique services, unique tarball names.
    /// Digest-only references are rejected since they load without a tag.
    pub fn validate(&self) -> Result<(), ArtifactError> {
        let mut services = HashSet::new();
        let mut names: HashMap<String, &ImageReference> = HashMap::new();

        for entry in &self.entries {
            entry.image.ensure_pinned()?;

            if !services.insert(entry.service.as_str()) {
                return Err(ArtifactError::DuplicateService(entry.service.clone()));
            }

            let file_name = tarball_name(&entry.image);
            if let Some(previous) = names.get(&file_name) {
                return Err(ArtifactError::TarballCollision {
                    file_name,
                    first: previous.canonical(),
                    second: entry.image.canonical(),
                });
            }
            names.insert(file_name, &entry.image);
        }

        Ok(())
    }

    /// Entries in table order.
    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    /// Look up an entry by service name.
    pub fn get(&self, service: &str) -> Option<&RegistryEntry> {
        self.entries.iter().find(|e| e.service == service)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The tarballs a prefetch into `dir` produces, in table order.
    pub fn artifacts(&self, dir: &Path, platform: &Platform) -> Vec<TarballArtifact> {
        self.entries
            .iter()
            .map(|entry| TarballArtifact {
                source: entry.image.clone(),
                path: dir.join(tarball_name(&entry.image)),
                platform: platform.clone(),
            })
            .collect()
    }

    /// Stable text describing the whole table, one `service=image` per line.
    ///
    /// Used as a build cache input: any change to the table changes it.
    pub fn fingerprint(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}={}", e.service, e.image.canonical()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for ArtifactRegistry {
    fn default() -> Self {
        Self::supabase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supabase_table_is_valid() {
        let registry = ArtifactRegistry::supabase();
        assert_eq!(registry.len(), SUPABASE_IMAGES.len());
        registry.validate().unwrap();
    }

    #[test]
    fn test_get_by_service() {
        let registry = ArtifactRegistry::supabase();
        let db = registry.get("db").unwrap();
        assert_eq!(db.image.repository(), "supabase/postgres");
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn test_rejects_latest() {
        let err = ArtifactRegistry::from_entries([("db", "supabase/postgres:latest")]).unwrap_err();
        assert!(matches!(err, ArtifactError::UnpinnedTag { .. }));
    }

    #[test]
    fn test_rejects_digest_only_override() {
        let err = ArtifactRegistry::from_toml_str(
            r#"
            [[image]]
            service = "kong"
            reference = "kong@sha256:0123abcd"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ArtifactError::DigestWithoutTag { .. }));
    }

    #[test]
    fn test_rejects_basename_collision() {
        let err = ArtifactRegistry::from_entries([
            ("db", "supabase/postgres:15.8.1.085"),
            ("other-db", "library/postgres:16.1"),
        ])
        .unwrap_err();

        match err {
            ArtifactError::TarballCollision { file_name, .. } => assert_eq!(file_name, "postgres.tar"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_duplicate_service() {
        let err = ArtifactRegistry::from_entries([
            ("db", "supabase/postgres:15.8.1.085"),
            ("db", "supabase/gotrue:v2.186.0"),
        ])
        .unwrap_err();
        assert_eq!(err, ArtifactError::DuplicateService("db".to_string()));
    }

    #[test]
    fn test_artifacts_paths() {
        let registry = ArtifactRegistry::supabase();
        let artifacts = registry.artifacts(Path::new(DEFAULT_ARTIFACT_DIR), &Platform::default());

        assert_eq!(artifacts.len(), registry.len());
        assert_eq!(
            artifacts[0].path,
            PathBuf::from("/var/lib/supabase-images/postgres.tar")
        );
        assert_eq!(artifacts[0].platform.to_string(), "linux/amd64");
    }

    #[test]
    fn test_fingerprint_tracks_tags() {
        let a = ArtifactRegistry::from_entries([("kong", "kong:2.8.1")]).unwrap();
        let b = ArtifactRegistry::from_entries([("kong", "kong:2.8.2")]).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), "kong=docker.io/library/kong:2.8.1");
    }

    #[test]
    fn test_from_toml() {
        let registry = ArtifactRegistry::from_toml_str(
            r#"
            [[image]]
            service = "db"
            reference = "supabase/postgres:15.8.1.085"

            [[image]]
            service = "kong"
            reference = "library/kong:2.8.1"
            "#,
        )
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.entries()[1].service, "kong");
    }

    #[test]
    fn test_from_toml_rejects_empty() {
        let err = ArtifactRegistry::from_toml_str("").unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidRegistryFile(_)));
    }
}
