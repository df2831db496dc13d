//! Image references and target platforms.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ArtifactError;

/// Registry name used when a reference has no registry component.
pub const DOCKER_HUB: &str = "docker.io";

/// API host backing [`DOCKER_HUB`].
pub const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

/// Tag that is never accepted for a prefetched image.
const FLOATING_TAG: &str = "latest";

/// Tag or digest part of an image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    /// A tag such as `15.8.1.085` or `2026.01.27-sha-2a37755`.
    Tag(String),
    /// A content digest such as `sha256:abc...`.
    Digest(String),
}

impl Reference {
    /// The string sent to the registry in `/v2/<repo>/manifests/<reference>`.
    pub fn as_str(&self) -> &str {
        match self {
            Reference::Tag(tag) => tag,
            Reference::Digest(digest) => digest,
        }
    }
}

/// A container image reference: `{registry}/{repository}:{tag}`.
///
/// Identity is the canonical string (see [`ImageReference::canonical`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    reference: Option<Reference>,
}

impl ImageReference {
    /// Parse a reference as written in the artifact table.
    ///
    /// Examples:
    /// - `kong:2.8.1` -> (docker.io, library/kong, 2.8.1)
    /// - `supabase/postgres:15.8.1.085` -> (docker.io, supabase/postgres, 15.8.1.085)
    /// - `ghcr.io/org/app:v1` -> (ghcr.io, org/app, v1)
    /// - `localhost:5000/app@sha256:abc` -> (localhost:5000, app, sha256:abc)
    pub fn parse(input: &str) -> Result<Self, ArtifactError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ArtifactError::InvalidReference {
                input: input.to_string(),
                reason: "empty reference".to_string(),
            });
        }

        let (name, reference) = if let Some((name, digest)) = input.split_once('@') {
            (name, Some(Reference::Digest(digest.to_string())))
        } else {
            match input.rsplit_once(':') {
                // A colon inside the registry host is a port, not a tag
                Some((name, tag)) if !tag.contains('/') => {
                    (name, Some(Reference::Tag(tag.to_string())))
                }
                _ => (input, None),
            }
        };

        if let Some(Reference::Tag(tag)) | Some(Reference::Digest(tag)) = &reference {
            if tag.is_empty() {
                return Err(ArtifactError::InvalidReference {
                    input: input.to_string(),
                    reason: "empty tag".to_string(),
                });
            }
        }

        let (registry, repository) = match name.split_once('/') {
            None => (DOCKER_HUB.to_string(), format!("library/{name}")),
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (DOCKER_HUB.to_string(), name.to_string()),
        };

        if repository.is_empty()
            || repository.ends_with('/')
            || repository.split('/').any(str::is_empty)
        {
            return Err(ArtifactError::InvalidReference {
                input: input.to_string(),
                reason: "empty repository path segment".to_string(),
            });
        }

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// Registry name (`docker.io`, `ghcr.io`, `localhost:5000`).
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Host serving the distribution API for this registry.
    pub fn api_host(&self) -> &str {
        if self.registry == DOCKER_HUB {
            DOCKER_HUB_API_HOST
        } else {
            &self.registry
        }
    }

    /// Repository path (`library/kong`, `supabase/postgres`).
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Tag or digest, if one was written.
    pub fn reference(&self) -> Option<&Reference> {
        self.reference.as_ref()
    }

    /// Last segment of the repository path (`postgres` for `supabase/postgres`).
    pub fn repository_basename(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(self.repository.as_str())
    }

    /// Reject references whose content can move between builds, and bare
    /// digests: `docker load` only accepts `name:tag` in `RepoTags`.
    pub fn ensure_pinned(&self) -> Result<(), ArtifactError> {
        match &self.reference {
            None => Err(ArtifactError::UnpinnedTag {
                image: self.canonical(),
                tag: None,
            }),
            Some(Reference::Tag(tag)) if tag.eq_ignore_ascii_case(FLOATING_TAG) => {
                Err(ArtifactError::UnpinnedTag {
                    image: self.canonical(),
                    tag: Some(tag.clone()),
                })
            }
            Some(Reference::Digest(_)) => Err(ArtifactError::DigestWithoutTag {
                image: self.canonical(),
            }),
            Some(Reference::Tag(_)) => Ok(()),
        }
    }

    /// Fully qualified identity string, e.g. `docker.io/supabase/postgres:15.8.1.085`.
    pub fn canonical(&self) -> String {
        let mut out = format!("{}/{}", self.registry, self.repository);
        push_reference(&mut out, self.reference.as_ref());
        out
    }

    /// Name the nested daemon lists the image under after `docker load`.
    ///
    /// Docker Hub images lose the registry, and official images lose the
    /// `library/` prefix, matching the daemon's familiar naming.
    pub fn repo_tag(&self) -> String {
        let mut out = if self.registry == DOCKER_HUB {
            self.repository
                .strip_prefix("library/")
                .unwrap_or(&self.repository)
                .to_string()
        } else {
            format!("{}/{}", self.registry, self.repository)
        };
        push_reference(&mut out, self.reference.as_ref());
        out
    }
}

fn push_reference(out: &mut String, reference: Option<&Reference>) {
    match reference {
        Some(Reference::Tag(tag)) => {
            out.push(':');
            out.push_str(tag);
        }
        Some(Reference::Digest(digest)) => {
            out.push('@');
            out.push_str(digest);
        }
        None => {}
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl FromStr for ImageReference {
    type Err = ArtifactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ImageReference {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical())
    }
}

impl<'de> Deserialize<'de> for ImageReference {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Target platform of a pulled image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Platform {
    /// `linux/amd64`, the architecture sandboxes run on.
    pub fn linux_amd64() -> Self {
        Self {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            variant: None,
        }
    }

    /// Whether an index entry's platform fields select this platform.
    ///
    /// A missing variant on either side matches any variant.
    pub fn matches(&self, os: &str, architecture: &str, variant: Option<&str>) -> bool {
        if self.os != os || self.architecture != architecture {
            return false;
        }
        match (self.variant.as_deref(), variant) {
            (Some(want), Some(have)) => want == have,
            _ => true,
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::linux_amd64()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = ArtifactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let invalid = || ArtifactError::InvalidPlatform(s.to_string());
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: None,
            }),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self {
                    os: os.to_string(),
                    architecture: arch.to_string(),
                    variant: Some(variant.to_string()),
                })
            }
            _ => Err(invalid()),
        }
    }
}
