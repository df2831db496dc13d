//! # dindbox-image-builder
//!
//! Build-time tooling for the dindbox sandbox image.
//!
//! - [`prefetch`]: pull the artifact table straight from registries into
//!   `docker load` tarballs, without a running container daemon
//! - [`oci`]: the registry client doing the pulling
//! - [`auth`]: anonymous bearer token exchange
//!
//! The `dindbox-build` binary wraps prefetch and renders the sandbox build
//! plan with its layer keys.

pub mod auth;
pub mod oci;
pub mod prefetch;

pub use oci::{OciClient, OciConfig, OciError};
pub use prefetch::{
    ImageFailure, PrefetchConfig, PrefetchError, PrefetchReport, PrefetchedImage, Prefetcher,
};
