//! Deterministic on-disk names for prefetched image tarballs.

use crate::reference::ImageReference;

/// Extension shared by every prefetched artifact.
pub const TARBALL_EXTENSION: &str = "tar";

/// File name of the tarball holding `image`.
///
/// The name is the last repository path segment with the tag or digest
/// stripped, plus `.tar`: `supabase/postgres:15.8.1.085` -> `postgres.tar`.
/// The result never contains a path separator.
pub fn tarball_name(image: &ImageReference) -> String {
    format!("{}.{}", image.repository_basename(), TARBALL_EXTENSION)
}
