//! Outbound NAT for containers started by the nested daemon.
//!
//! The nested daemon runs with `--iptables=false`, so the sandbox sets up
//! source NAT itself in a single pass:
//!
//! 1. interface of the default route (fatal if none)
//! 2. IPv4 address of that interface (fatal if none)
//! 3. IPv4 forwarding on (fatal if it cannot be written)
//! 4. iptables backend from the probe chain (NAT skipped if none)
//! 5. SNAT rules for TCP and UDP, each best-effort
//! 6. legacy iptables pinned as the system default, best-effort

mod discover;
mod iptables;

use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::command::CommandRunner;

pub use discover::{parse_default_device, parse_ipv4};
pub use iptables::{
    default_probes, resolve_backend, BinaryLocator, IptablesBackend, IptablesProbe, NatRule,
    Protocol, SystemLocator, LEGACY_IP6TABLES_PATH, LEGACY_IPTABLES_PATH,
};
#[cfg(any(test, feature = "testing"))]
pub use iptables::StaticLocator;

/// Kernel switch for IPv4 forwarding.
pub const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// Fatal network setup errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// No default route, so there is no interface to NAT through.
    #[error("no_default_device: no default route found; routing table:\n{routes}")]
    NoDefaultDevice { routes: String },

    /// The default interface has no IPv4 address.
    #[error("no_ipv4_address: no IPv4 address on {interface}")]
    NoIpv4Address { interface: String, output: String },

    /// IPv4 forwarding could not be enabled.
    #[error("ip_forward_failed: writing {path}: {source}")]
    IpForward {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A discovery command could not be run at all.
    #[error("failed to run {command}: {source}")]
    Command {
        command: String,
        #[source]
        source: io::Error,
    },
}

impl NetworkError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            NetworkError::NoDefaultDevice { .. } => "no_default_device",
            NetworkError::NoIpv4Address { .. } => "no_ipv4_address",
            NetworkError::IpForward { .. } => "ip_forward_failed",
            NetworkError::Command { .. } => "net_command_failed",
        }
    }
}

/// Interface and address outbound traffic is rewritten to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkContext {
    pub interface: String,
    pub address: Ipv4Addr,
}

/// Result of installing one NAT rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    pub rule: NatRule,
    /// Why the rule was not installed; `None` on success.
    pub error: Option<String>,
}

impl RuleOutcome {
    pub fn installed(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of pinning one alternative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlternativeOutcome {
    Pinned { name: String, path: PathBuf },
    Failed { name: String, reason: String },
}

impl fmt::Display for AlternativeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlternativeOutcome::Pinned { name, path } => {
                write!(f, "{name} -> {}", path.display())
            }
            AlternativeOutcome::Failed { name, reason } => write!(f, "{name}: {reason}"),
        }
    }
}

/// What network setup did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkReport {
    pub context: NetworkContext,
    /// `None` when no iptables binary was found and NAT was skipped.
    pub backend: Option<IptablesBackend>,
    pub rules: Vec<RuleOutcome>,
    pub alternatives: Vec<AlternativeOutcome>,
}

impl NetworkReport {
    /// NAT was skipped or only partly installed.
    pub fn is_degraded(&self) -> bool {
        self.backend.is_none() || self.rules.iter().any(|r| !r.installed())
    }

    pub fn installed_rules(&self) -> usize {
        self.rules.iter().filter(|r| r.installed()).count()
    }
}

/// Runs the network setup against a command runner and binary locator.
pub struct NetworkBootstrap<'a> {
    runner: &'a dyn CommandRunner,
    locator: &'a dyn BinaryLocator,
    probes: Vec<IptablesProbe>,
    ip_forward_path: PathBuf,
}

impl<'a> NetworkBootstrap<'a> {
    pub fn new(runner: &'a dyn CommandRunner, locator: &'a dyn BinaryLocator) -> Self {
        Self {
            runner,
            locator,
            probes: default_probes(),
            ip_forward_path: PathBuf::from(IP_FORWARD_PATH),
        }
    }

    pub fn with_probes(mut self, probes: Vec<IptablesProbe>) -> Self {
        self.probes = probes;
        self
    }

    pub fn with_ip_forward_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ip_forward_path = path.into();
        self
    }

    /// Run all steps. Only discovery and forwarding failures are errors.
    pub fn run(&self) -> Result<NetworkReport, NetworkError> {
        let context = self.discover()?;
        info!(
            interface = %context.interface,
            address = %context.address,
            "default interface discovered"
        );

        enable_ip_forward(&self.ip_forward_path)?;
        debug!(path = %self.ip_forward_path.display(), "IPv4 forwarding enabled");

        let backend = resolve_backend(&self.probes, self.locator);
        let rules = match &backend {
            Some(backend) => {
                info!(
                    iptables = %backend.path.display(),
                    probe = %backend.probe,
                    "iptables backend selected"
                );
                self.install_rules(backend, &context)
            }
            None => {
                warn!(
                    probes = self.probes.len(),
                    "no iptables binary found, NAT skipped; nested containers will have no egress"
                );
                Vec::new()
            }
        };

        let alternatives = self.pin_alternatives();

        Ok(NetworkReport {
            context,
            backend,
            rules,
            alternatives,
        })
    }

    fn discover(&self) -> Result<NetworkContext, NetworkError> {
        let routes = self.run_checked("ip", &["route", "show", "default"])?;
        let Some(interface) = parse_default_device(&routes) else {
            // Full table for the diagnostic; best-effort
            let table = self
                .runner
                .run("ip", &["route", "show"])
                .map(|out| out.stdout)
                .unwrap_or_default();
            return Err(NetworkError::NoDefaultDevice { routes: table });
        };

        let addrs = self.run_checked("ip", &["-4", "addr", "show", "dev", &interface])?;
        let address = parse_ipv4(&addrs).ok_or_else(|| NetworkError::NoIpv4Address {
            interface: interface.clone(),
            output: addrs.clone(),
        })?;

        Ok(NetworkContext { interface, address })
    }

    /// Run a discovery command. A non-zero exit yields empty output so the
    /// caller reports the missing route or address.
    fn run_checked(&self, program: &str, args: &[&str]) -> Result<String, NetworkError> {
        let output = self
            .runner
            .run(program, args)
            .map_err(|source| NetworkError::Command {
                command: format!("{program} {}", args.join(" ")),
                source,
            })?;

        if !output.success() {
            warn!(
                command = %format!("{program} {}", args.join(" ")),
                status = ?output.status,
                stderr = %output.stderr.trim(),
                "discovery command failed"
            );
            return Ok(String::new());
        }
        Ok(output.stdout)
    }

    fn install_rules(&self, backend: &IptablesBackend, context: &NetworkContext) -> Vec<RuleOutcome> {
        let program = backend.path.to_string_lossy();

        NatRule::for_interface(&context.interface, context.address)
            .into_iter()
            .map(|rule| {
                let args = rule.args();
                let args: Vec<&str> = args.iter().map(String::as_str).collect();

                let error = match self.runner.run(&program, &args) {
                    Ok(out) if out.success() => None,
                    Ok(out) => Some(format!(
                        "exit status {:?}: {}",
                        out.status,
                        out.stderr.trim()
                    )),
                    Err(e) => Some(e.to_string()),
                };

                match &error {
                    None => info!(rule = %rule, "NAT rule installed"),
                    Some(reason) => warn!(rule = %rule, reason = %reason, "NAT rule failed"),
                }

                RuleOutcome { rule, error }
            })
            .collect()
    }

    fn pin_alternatives(&self) -> Vec<AlternativeOutcome> {
        [
            ("iptables", LEGACY_IPTABLES_PATH),
            ("ip6tables", LEGACY_IP6TABLES_PATH),
        ]
        .into_iter()
        .filter(|(_, path)| self.locator.exists(Path::new(path)))
        .map(|(name, path)| {
            let outcome = match self.runner.run("update-alternatives", &["--set", name, path]) {
                Ok(out) if out.success() => AlternativeOutcome::Pinned {
                    name: name.to_string(),
                    path: PathBuf::from(path),
                },
                Ok(out) => AlternativeOutcome::Failed {
                    name: name.to_string(),
                    reason: out.stderr.trim().to_string(),
                },
                Err(e) => AlternativeOutcome::Failed {
                    name: name.to_string(),
                    reason: e.to_string(),
                },
            };

            match &outcome {
                AlternativeOutcome::Pinned { .. } => debug!(alternative = %outcome, "alternative pinned"),
                AlternativeOutcome::Failed { .. } => {
                    warn!(alternative = %outcome, "could not pin alternative")
                }
            }
            outcome
        })
        .collect()
    }
}

fn enable_ip_forward(path: &Path) -> Result<(), NetworkError> {
    std::fs::write(path, b"1\n").map_err(|source| NetworkError::IpForward {
        path: path.to_path_buf(),
        source,
    })
}
