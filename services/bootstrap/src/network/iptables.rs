//! iptables backend resolution and NAT rules.
//!
//! The backend is chosen by walking an ordered list of probes; the first one
//! that finds a binary wins. If none does, NAT is skipped.

#[cfg(any(test, feature = "testing"))]
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Legacy iptables at its Debian location. Preferred because
/// `update-alternatives` choices may not survive into the sandbox.
pub const LEGACY_IPTABLES_PATH: &str = "/usr/sbin/iptables-legacy";

/// Legacy ip6tables at its Debian location.
pub const LEGACY_IP6TABLES_PATH: &str = "/usr/sbin/ip6tables-legacy";

/// Looks up binaries on the filesystem.
pub trait BinaryLocator: Send + Sync {
    /// Whether an executable file exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Resolve `name` through `PATH`.
    fn search(&self, name: &str) -> Option<PathBuf>;
}

/// Looks binaries up on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLocator;

impl BinaryLocator for SystemLocator {
    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn search(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }
}

/// Fixed answers for tests, behind the `testing` feature.
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Default, Clone)]
pub struct StaticLocator {
    files: HashSet<PathBuf>,
    on_path: HashMap<String, PathBuf>,
}

#[cfg(any(test, feature = "testing"))]
impl StaticLocator {
    /// A host with no binaries at all.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.insert(path.into());
        self
    }

    pub fn with_on_path(mut self, name: &str, path: impl Into<PathBuf>) -> Self {
        self.on_path.insert(name.to_string(), path.into());
        self
    }
}

#[cfg(any(test, feature = "testing"))]
impl BinaryLocator for StaticLocator {
    fn exists(&self, path: &Path) -> bool {
        self.files.contains(path)
    }

    fn search(&self, name: &str) -> Option<PathBuf> {
        self.on_path.get(name).cloned()
    }
}

/// One candidate in the backend chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IptablesProbe {
    /// A binary expected at a known absolute path.
    FixedPath(PathBuf),
    /// A binary name resolved through `PATH`.
    PathSearch(String),
}

impl IptablesProbe {
    fn probe(&self, locator: &dyn BinaryLocator) -> Option<PathBuf> {
        match self {
            IptablesProbe::FixedPath(path) => locator.exists(path).then(|| path.clone()),
            IptablesProbe::PathSearch(name) => locator.search(name),
        }
    }
}

impl fmt::Display for IptablesProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IptablesProbe::FixedPath(path) => write!(f, "path {}", path.display()),
            IptablesProbe::PathSearch(name) => write!(f, "PATH lookup of {name}"),
        }
    }
}

/// Legacy binary at its known path, then a legacy binary on `PATH`, then
/// whatever `iptables` is on `PATH`.
pub fn default_probes() -> Vec<IptablesProbe> {
    vec![
        IptablesProbe::FixedPath(PathBuf::from(LEGACY_IPTABLES_PATH)),
        IptablesProbe::PathSearch("iptables-legacy".to_string()),
        IptablesProbe::PathSearch("iptables".to_string()),
    ]
}

/// The iptables binary NAT rules are installed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IptablesBackend {
    pub path: PathBuf,
    /// The probe that found it.
    pub probe: IptablesProbe,
}

/// First probe that finds a binary, if any.
pub fn resolve_backend(
    probes: &[IptablesProbe],
    locator: &dyn BinaryLocator,
) -> Option<IptablesBackend> {
    probes.iter().find_map(|probe| {
        probe.probe(locator).map(|path| IptablesBackend {
            path,
            probe: probe.clone(),
        })
    })
}

/// Transport protocol a NAT rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Source NAT of outbound traffic on the default interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatRule {
    pub interface: String,
    pub source: Ipv4Addr,
    pub protocol: Protocol,
}

impl NatRule {
    /// The TCP and UDP rules for an interface, in install order.
    pub fn for_interface(interface: &str, source: Ipv4Addr) -> [NatRule; 2] {
        [Protocol::Tcp, Protocol::Udp].map(|protocol| NatRule {
            interface: interface.to_string(),
            source,
            protocol,
        })
    }

    /// iptables arguments appending this rule.
    pub fn args(&self) -> Vec<String> {
        let source = self.source.to_string();
        [
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-o",
            self.interface.as_str(),
            "-j",
            "SNAT",
            "--to-source",
            source.as_str(),
            "-p",
            self.protocol.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

impl fmt::Display for NatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SNAT {} via {} -> {}",
            self.protocol.as_str(),
            self.interface,
            self.source
        )
    }
}
