//! # dindbox-buildplan
//!
//! The sandbox image as an explicit graph of named build steps, plus the
//! cache keys the external layer builder uses to decide which layers to
//! rebuild.
//!
//! ## Cache invalidation
//!
//! Every layer key is a SHA-256 over the parent key, the step's commands,
//! its declared inputs, and (for guarded steps) the
//! [`CacheInvalidationToken`]. Bumping the token therefore rebuilds the
//! first guarded layer and everything after it, and nothing before it.

mod error;
mod plan;
mod sandbox;
mod token;

pub use error::PlanError;
pub use plan::{BuildPlan, BuildStep, LayerKey, RenderedStep, TOKEN_PLACEHOLDER};
pub use sandbox::{
    asset_digest, sandbox_image_plan, SandboxPlanInputs, BASE_IMAGE, BOOTSTRAP_BINARY_PATH,
    BOOTSTRAP_SCRIPT_PATH,
};
pub use token::{CacheInvalidationToken, CURRENT_TOKEN};
