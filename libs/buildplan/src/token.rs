//! Cache invalidation token.

use std::fmt;

use crate::error::PlanError;

/// Token baked into the current sandbox image.
///
/// Bump this whenever a step guarded by the token must re-run (for
/// example to pick up a new release of a tool installed without a pin).
pub const CURRENT_TOKEN: &str = "v43-pre-pull-supabase-images";

/// Opaque version string. Only equality matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheInvalidationToken(String);

impl CacheInvalidationToken {
    pub fn new(value: impl Into<String>) -> Result<Self, PlanError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(PlanError::EmptyToken);
        }
        Ok(Self(value))
    }

    /// The token the sandbox image is currently built with.
    pub fn current() -> Self {
        Self(CURRENT_TOKEN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheInvalidationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
