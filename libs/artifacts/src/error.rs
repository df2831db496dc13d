//! Error types for the artifact table.

use thiserror::Error;

/// Errors raised while parsing or validating the artifact table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    /// The image reference could not be parsed.
    #[error("invalid image reference '{input}': {reason}")]
    InvalidReference { input: String, reason: String },

    /// The image reference floats (`latest` or no tag at all).
    #[error("image {image} is not pinned (tag: {})", tag.as_deref().unwrap_or("<none>"))]
    UnpinnedTag { image: String, tag: Option<String> },

    /// The image is pinned by digest only, so the loaded image has no tag.
    #[error("image {image} is pinned by digest only, give it a tag")]
    DigestWithoutTag { image: String },

    /// Two entries would be written to the same tarball.
    #[error("tarball name collision: {first} and {second} both map to {file_name}")]
    TarballCollision {
        file_name: String,
        first: String,
        second: String,
    },

    /// Two entries use the same service name.
    #[error("duplicate service name: {0}")]
    DuplicateService(String),

    /// A platform string was not `os/arch[/variant]`.
    #[error("invalid platform: {0}")]
    InvalidPlatform(String),

    /// A registry override file could not be parsed.
    #[error("invalid registry file: {0}")]
    InvalidRegistryFile(String),
}
