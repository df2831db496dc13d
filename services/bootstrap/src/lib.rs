//! Sandbox start-up for nested containers.
//!
//! Runs once when a sandbox boots, in this order:
//! 1. outbound NAT for the nested network ([`network`])
//! 2. storage driver choice ([`storage`])
//! 3. nested daemon launch ([`daemon`])
//! 4. preload of prefetched image tarballs ([`loader`])

pub mod command;
pub mod config;
pub mod daemon;
pub mod docker;
pub mod error;
pub mod loader;
pub mod logging;
pub mod network;
pub mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

pub use command::{CommandOutput, CommandRunner, SystemRunner};
#[cfg(any(test, feature = "testing"))]
pub use command::RecordingRunner;
pub use config::Config;
pub use daemon::{DaemonConfig, DaemonHandle, DaemonLauncher};
pub use docker::{DaemonApi, DockerClient};
pub use error::BootstrapError;
pub use loader::{FailedTarball, ImageLoader, LoadError, LoadReport, LoaderConfig};
pub use network::{BinaryLocator, NetworkBootstrap, NetworkReport, SystemLocator};
#[cfg(any(test, feature = "testing"))]
pub use network::StaticLocator;
pub use storage::{StorageDecision, StorageDriver};

/// Everything a successful start produced.
pub struct BootstrapOutcome {
    pub network: NetworkReport,
    pub storage: StorageDecision,
    pub load: LoadReport,
    pub daemon: DaemonHandle,
}

/// Runs the start-up sequence.
pub struct Bootstrap {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    locator: Arc<dyn BinaryLocator>,
    mountinfo_path: PathBuf,
}

impl Bootstrap {
    /// Bootstrap against the real host.
    pub fn new(config: Config) -> Self {
        Self::with_host(config, Arc::new(SystemRunner), Arc::new(SystemLocator))
    }

    /// Bootstrap with a custom command runner and binary locator.
    pub fn with_host(
        config: Config,
        runner: Arc<dyn CommandRunner>,
        locator: Arc<dyn BinaryLocator>,
    ) -> Self {
        Self {
            config,
            runner,
            locator,
            mountinfo_path: PathBuf::from(storage::MOUNTINFO_PATH),
        }
    }

    pub fn with_mountinfo_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mountinfo_path = path.into();
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run every step. The daemon is left running in the returned outcome.
    pub async fn run(&self) -> Result<BootstrapOutcome, BootstrapError> {
        let network = NetworkBootstrap::new(&*self.runner, &*self.locator)
            .with_ip_forward_path(&self.config.ip_forward_path)
            .run()?;
        if network.is_degraded() {
            warn!(
                installed_rules = network.installed_rules(),
                "NAT is incomplete, nested containers may not reach the network"
            );
        }

        let storage = self.decide_storage();
        info!(
            driver = %storage.driver,
            reason = %storage.reason,
            "storage driver selected"
        );

        let daemon = DaemonLauncher::new(DaemonConfig {
            binary: self.config.dockerd_path.clone(),
            socket: self.config.docker_socket.clone(),
            storage_driver: storage.driver,
            debug: self.config.daemon_debug,
            socket_timeout: self.config.socket_timeout,
        })
        .launch()
        .await?;

        let loader = ImageLoader::new(
            Arc::new(DockerClient::new(&self.config.docker_socket)),
            LoaderConfig {
                artifact_dir: self.config.artifact_dir.clone(),
                ready_attempts: self.config.ready_attempts,
                ready_interval: self.config.ready_interval,
            },
        );

        let load = match loader.load_all().await {
            Ok(load) => load,
            // The daemon is healthy; it just starts without preloaded images.
            Err(LoadError::ArtifactDir { dir, source }) => {
                warn!(
                    dir = %dir.display(),
                    error = %source,
                    "cannot read artifact directory, skipping image preload"
                );
                LoadReport {
                    loaded: Vec::new(),
                    failed: vec![FailedTarball {
                        path: dir,
                        reason: source.to_string(),
                    }],
                }
            }
            Err(e) => {
                warn!(pid = daemon.pid(), "stopping daemon after failed preload");
                daemon.terminate().await.ok();
                return Err(e.into());
            }
        };

        if !load.is_complete() {
            warn!(
                failed = load.failed.len(),
                loaded = load.loaded.len(),
                "some image tarballs did not load"
            );
        }

        Ok(BootstrapOutcome {
            network,
            storage,
            load,
            daemon,
        })
    }

    fn decide_storage(&self) -> StorageDecision {
        let host_is_overlay = match std::fs::read_to_string(&self.mountinfo_path) {
            Ok(mountinfo) => storage::detect_overlay_root(&mountinfo),
            Err(e) => {
                warn!(
                    path = %self.mountinfo_path.display(),
                    error = %e,
                    "cannot read mount table, assuming non-overlay root"
                );
                false
            }
        };

        let max_layers = storage::max_layer_count(&self.config.artifact_dir).unwrap_or_else(|e| {
            warn!(
                dir = %self.config.artifact_dir.display(),
                error = %e,
                "cannot scan artifact directory for layer counts"
            );
            0
        });

        storage::decide(self.config.storage_driver, host_is_overlay, max_layers)
    }
}
