//! Configuration for the bootstrap.
//!
//! Everything has a default matching the sandbox image layout; nothing is
//! required. Values come from `DIND_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use dindbox_artifacts::DEFAULT_ARTIFACT_DIR;
use thiserror::Error;

use crate::network::IP_FORWARD_PATH;
use crate::storage::StorageDriver;

/// Default path of the nested daemon binary.
pub const DEFAULT_DOCKERD_PATH: &str = "/usr/bin/dockerd";

/// Default control socket of the nested daemon.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Default boot log path.
pub const DEFAULT_BOOT_LOG: &str = "/run/dindbox/bootstrap.log";

/// A variable was set to something unusable.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("config_invalid: {var}={value:?}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

/// Bootstrap configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory of prefetched image tarballs.
    pub artifact_dir: PathBuf,

    /// Nested daemon binary.
    pub dockerd_path: PathBuf,

    /// Nested daemon control socket.
    pub docker_socket: PathBuf,

    /// Forced storage driver; selected automatically when unset.
    pub storage_driver: Option<StorageDriver>,

    /// Start the daemon with `-D`.
    pub daemon_debug: bool,

    /// How long to wait for the daemon socket to appear.
    pub socket_timeout: Duration,

    /// Readiness probes before giving up on the daemon.
    pub ready_attempts: u32,

    /// Delay between readiness probes.
    pub ready_interval: Duration,

    /// Exit after loading images, leaving the daemon running.
    pub detach: bool,

    /// Boot log path.
    pub boot_log: PathBuf,

    /// Kernel IPv4 forwarding switch.
    pub ip_forward_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from(DEFAULT_ARTIFACT_DIR),
            dockerd_path: PathBuf::from(DEFAULT_DOCKERD_PATH),
            docker_socket: PathBuf::from(DEFAULT_DOCKER_SOCKET),
            storage_driver: None,
            daemon_debug: true,
            socket_timeout: Duration::from_secs(30),
            ready_attempts: 60,
            ready_interval: Duration::from_secs(1),
            detach: false,
            boot_log: PathBuf::from(DEFAULT_BOOT_LOG),
            ip_forward_path: PathBuf::from(IP_FORWARD_PATH),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let path = |var: &str, default: PathBuf| get(var).map(PathBuf::from).unwrap_or(default);

        let storage_driver = match get("DIND_STORAGE_DRIVER") {
            Some(raw) => Some(raw.parse::<StorageDriver>().map_err(|reason| ConfigError {
                var: "DIND_STORAGE_DRIVER",
                value: raw.clone(),
                reason,
            })?),
            None => None,
        };

        Ok(Self {
            artifact_dir: path("DIND_ARTIFACT_DIR", defaults.artifact_dir),
            dockerd_path: path("DIND_DOCKERD_PATH", defaults.dockerd_path),
            docker_socket: path("DIND_DOCKER_SOCKET", defaults.docker_socket),
            storage_driver,
            daemon_debug: parse_bool("DIND_DAEMON_DEBUG", get("DIND_DAEMON_DEBUG"))?
                .unwrap_or(defaults.daemon_debug),
            socket_timeout: parse_number("DIND_SOCKET_TIMEOUT_MS", get("DIND_SOCKET_TIMEOUT_MS"))?
                .map(Duration::from_millis)
                .unwrap_or(defaults.socket_timeout),
            ready_attempts: parse_number("DIND_READY_ATTEMPTS", get("DIND_READY_ATTEMPTS"))?
                .map(|n: u64| n.max(1).min(u32::MAX as u64) as u32)
                .unwrap_or(defaults.ready_attempts),
            ready_interval: parse_number("DIND_READY_INTERVAL_MS", get("DIND_READY_INTERVAL_MS"))?
                .map(Duration::from_millis)
                .unwrap_or(defaults.ready_interval),
            detach: parse_bool("DIND_DETACH", get("DIND_DETACH"))?.unwrap_or(defaults.detach),
            boot_log: path("DIND_BOOT_LOG", defaults.boot_log),
            ip_forward_path: path("DIND_IP_FORWARD_PATH", defaults.ip_forward_path),
        })
    }
}

fn parse_bool(var: &'static str, raw: Option<String>) -> Result<Option<bool>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError {
            var,
            value: raw,
            reason: "expected a boolean (1/0, true/false)".to_string(),
        }),
    }
}

fn parse_number(var: &'static str, raw: Option<String>) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    raw.trim().parse().map(Some).map_err(|e| ConfigError {
        var,
        value: raw.clone(),
        reason: format!("expected a non-negative integer: {e}"),
    })
}
