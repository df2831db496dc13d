//! Error types for the bootstrap.

use thiserror::Error;

use crate::config::ConfigError;
use crate::daemon::DaemonError;
use crate::loader::LoadError;
use crate::network::NetworkError;

/// Fatal bootstrap errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BootstrapError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            BootstrapError::Config(_) => "config_invalid",
            BootstrapError::Network(e) => e.reason_code(),
            BootstrapError::Daemon(_) => "daemon_start_failed",
            BootstrapError::Load(LoadError::DaemonNotReady { .. }) => "daemon_not_ready",
            BootstrapError::Load(LoadError::ArtifactDir { .. }) => "artifact_dir_unreadable",
            BootstrapError::Io(_) => "io_error",
        }
    }
}
