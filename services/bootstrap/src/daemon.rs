//! Nested daemon process launch and supervision.
//!
//! The daemon is started as a child of the bootstrap with NAT management
//! disabled (network setup owns NAT) and the selected storage driver. The
//! launch is complete once the control socket exists.
//!
//! Supervising the child lets the sandbox tell a daemon crash (non-zero
//! exit) from a normal teardown.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

use crate::storage::StorageDriver;

/// How often the socket and child are polled during launch.
const LAUNCH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Daemon launch and supervision errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon_start_failed: binary not found at {0}")]
    BinaryMissing(PathBuf),

    #[error("daemon_start_failed: spawning {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("daemon_start_failed: daemon exited during start-up with {status}")]
    ExitedEarly { status: String },

    #[error("daemon_start_failed: socket {socket} did not appear within {timeout:?}")]
    SocketTimeout { socket: PathBuf, timeout: Duration },

    #[error("waiting for daemon: {0}")]
    Wait(#[from] std::io::Error),
}

/// How to start the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub binary: PathBuf,
    pub socket: PathBuf,
    pub storage_driver: StorageDriver,
    pub debug: bool,
    pub socket_timeout: Duration,
}

/// Daemon arguments for a storage driver.
pub fn daemon_args(driver: StorageDriver, debug: bool) -> Vec<String> {
    let mut args = vec![
        "--iptables=false".to_string(),
        "--ip6tables=false".to_string(),
        format!("--storage-driver={driver}"),
    ];
    if debug {
        args.push("-D".to_string());
    }
    args
}

/// Starts the daemon.
pub struct DaemonLauncher {
    config: DaemonConfig,
}

impl DaemonLauncher {
    pub fn new(config: DaemonConfig) -> Self {
        Self { config }
    }

    /// Spawn the daemon and wait for its socket.
    ///
    /// A daemon that exits before the socket shows up, or never creates it,
    /// is a start failure and is not retried.
    pub async fn launch(&self) -> Result<DaemonHandle, DaemonError> {
        let config = &self.config;
        if !config.binary.is_file() {
            return Err(DaemonError::BinaryMissing(config.binary.clone()));
        }

        let args = daemon_args(config.storage_driver, config.debug);
        info!(
            binary = %config.binary.display(),
            args = ?args,
            "starting nested daemon"
        );

        let mut child = Command::new(&config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| DaemonError::Spawn {
                binary: config.binary.clone(),
                source,
            })?;

        let pid = child.id().unwrap_or_default();
        let started = Instant::now();

        loop {
            if let Some(status) = child.try_wait()? {
                return Err(DaemonError::ExitedEarly {
                    status: describe(status),
                });
            }

            if config.socket.exists() {
                info!(
                    pid,
                    socket = %config.socket.display(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "daemon socket is up"
                );
                return Ok(DaemonHandle { child, pid });
            }

            if started.elapsed() >= config.socket_timeout {
                warn!(pid, "daemon socket did not appear, stopping daemon");
                child.kill().await.ok();
                return Err(DaemonError::SocketTimeout {
                    socket: config.socket.clone(),
                    timeout: config.socket_timeout,
                });
            }

            tokio::time::sleep(LAUNCH_POLL_INTERVAL).await;
        }
    }
}

/// The running daemon.
pub struct DaemonHandle {
    child: Child,
    pid: u32,
}

impl DaemonHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for the daemon to exit, forwarding SIGTERM, SIGINT and SIGHUP to
    /// it. Returns its exit code (128 + signal when killed by one).
    pub async fn supervise(mut self) -> Result<i32, DaemonError> {
        let status = wait_with_signals(&mut self.child, self.pid).await?;
        let code = exit_code(status);
        info!(pid = self.pid, exit_code = code, status = %describe(status), "daemon exited");
        Ok(code)
    }

    /// Leave the daemon running without a supervisor.
    pub fn detach(self) -> u32 {
        // Dropping a tokio Child does not kill it
        debug!(pid = self.pid, "detaching from daemon");
        self.pid
    }

    /// Ask the daemon to stop and wait for it.
    pub async fn terminate(mut self) -> Result<i32, DaemonError> {
        if let Ok(pid) = i32::try_from(self.pid) {
            kill(Pid::from_raw(pid), Signal::SIGTERM).ok();
        }
        let status = self.child.wait().await?;
        Ok(exit_code(status))
    }
}

async fn wait_with_signals(child: &mut Child, pid: u32) -> Result<ExitStatus, DaemonError> {
    let nix_pid = Pid::from_raw(pid as i32);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            status = child.wait() => return Ok(status?),

            _ = sigterm.recv() => {
                info!(pid, "forwarding SIGTERM to daemon");
                let _ = kill(nix_pid, Signal::SIGTERM);
            }

            _ = sigint.recv() => {
                info!(pid, "forwarding SIGINT to daemon");
                let _ = kill(nix_pid, Signal::SIGINT);
            }

            _ = sighup.recv() => {
                info!(pid, "forwarding SIGHUP to daemon");
                let _ = kill(nix_pid, Signal::SIGHUP);
            }
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(128)
}

fn describe(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        _ => "unknown status".to_string(),
    }
}
