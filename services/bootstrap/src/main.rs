//! dind-bootstrap - sandbox entrypoint for nested containers.
//!
//! Sets up NAT, starts the nested daemon, preloads the prefetched images,
//! then either supervises the daemon (default) or detaches from it.
//!
//! Configuration is read from `DIND_*` environment variables.

use std::error::Error as _;
use std::process::ExitCode;

use dindbox_bootstrap::{logging, Bootstrap, BootstrapError, Config};
use tracing::{error, info};

/// Bootstrap version (semver).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let config = Config::from_env();

    let boot_log = config
        .as_ref()
        .map(|c| c.boot_log.clone())
        .unwrap_or_else(|_| Config::default().boot_log);
    if let Err(e) = logging::init(&boot_log) {
        logging::init_stderr();
        tracing::warn!(path = %boot_log.display(), error = %e, "boot log unavailable, logging to stderr only");
    }

    info!(version = VERSION, "dind-bootstrap starting");

    let result = match config {
        Ok(config) => run(config).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(code) => {
            info!(exit_code = code, "dind-bootstrap exiting");
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
        Err(e) => {
            error!(reason = e.reason_code(), error = %e, "bootstrap failed");
            let mut source = e.source();
            while let Some(cause) = source {
                error!(cause = %cause, "caused by");
                source = cause.source();
            }
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> Result<i32, BootstrapError> {
    let detach = config.detach;
    let outcome = Bootstrap::new(config).run().await?;

    info!(
        interface = %outcome.network.context.interface,
        nat_rules = outcome.network.installed_rules(),
        storage_driver = %outcome.storage.driver,
        images_loaded = outcome.load.loaded.len(),
        images_failed = outcome.load.failed.len(),
        daemon_pid = outcome.daemon.pid(),
        "sandbox ready"
    );

    if detach {
        let pid = outcome.daemon.detach();
        info!(pid, "leaving daemon running");
        return Ok(0);
    }

    Ok(outcome.daemon.supervise().await?)
}
