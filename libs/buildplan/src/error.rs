//! Build plan errors.

use thiserror::Error;

/// Errors from validating or keying a build plan.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// Two steps share a name.
    #[error("duplicate step name: {0}")]
    DuplicateStep(String),

    /// A step requires a state no earlier step provides.
    #[error("step '{step}' requires '{state}'{}", provided_later_by.as_ref().map(|s| format!(", which is only provided later by '{s}'")).unwrap_or_default())]
    MissingRequirement {
        step: String,
        state: String,
        provided_later_by: Option<String>,
    },

    /// Two steps provide the same state.
    #[error("state '{state}' provided by both '{first}' and '{second}'")]
    DuplicateState {
        state: String,
        first: String,
        second: String,
    },

    /// The cache invalidation token is blank.
    #[error("cache invalidation token must not be empty")]
    EmptyToken,

    /// A custom artifact table was given without the file it comes from.
    #[error("custom artifact registry needs a registry file for the prefetch step")]
    UnsourcedRegistry,
}
