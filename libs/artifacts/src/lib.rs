//! # dindbox-artifacts
//!
//! The fixed set of service images a dindbox sandbox starts with, and the
//! naming contract shared by the build-time prefetcher and the runtime
//! image loader.
//!
//! ## Invariants
//!
//! - Every image is pinned; `latest` is rejected
//! - Tarball names are `{repository basename}.tar` and unique across the table
//! - Table order is stable, so fingerprints are deterministic
//! - Tarballs are written deterministically (see [`archive`])

pub mod archive;
mod error;
mod naming;
mod reference;
mod registry;

pub use error::ArtifactError;
pub use naming::{tarball_name, TARBALL_EXTENSION};
pub use reference::{ImageReference, Platform, Reference, DOCKER_HUB, DOCKER_HUB_API_HOST};
pub use registry::{
    ArtifactRegistry, RegistryEntry, TarballArtifact, DEFAULT_ARTIFACT_DIR, SUPABASE_IMAGES,
};
