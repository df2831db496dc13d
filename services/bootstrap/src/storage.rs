//! Storage driver selection for the nested daemon.
//!
//! overlay2 on top of an overlay root stacks every image layer into the
//! mount options of a single mount call. The kernel caps that string at one
//! page, so deep images fail to start. On such hosts `vfs` is used instead.
//!
//! The choice is made once before the daemon starts. Switching drivers on a
//! live daemon would require wiping its data.

use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;

use dindbox_artifacts::archive::read_archive_manifest;
use dindbox_artifacts::TARBALL_EXTENSION;
use tracing::{debug, warn};

/// Kernel limit on the mount option string (one page).
pub const MOUNT_OPTION_LIMIT_BYTES: usize = 4096;

/// Approximate option bytes each lower layer adds (`lowerdir` path entry).
pub const PER_LAYER_MOUNT_OPTION_BYTES: usize = 100;

/// Share of the limit considered safe to use, in percent.
pub const SAFE_LIMIT_PERCENT: usize = 80;

/// Where the root mount is looked up.
pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Storage driver passed to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageDriver {
    Overlay2,
    Vfs,
}

impl StorageDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageDriver::Overlay2 => "overlay2",
            StorageDriver::Vfs => "vfs",
        }
    }
}

impl fmt::Display for StorageDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageDriver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overlay2" => Ok(StorageDriver::Overlay2),
            "vfs" => Ok(StorageDriver::Vfs),
            other => Err(format!("unknown storage driver '{other}', expected vfs or overlay2")),
        }
    }
}

/// Why a driver was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionReason {
    /// Set explicitly in configuration.
    Override,
    /// Overlay root and the deepest image would exceed the mount option budget.
    LayerLimit { layers: usize },
    /// Overlay root but every image fits.
    WithinLimit { layers: usize },
    /// Root is not overlay, so nothing stacks.
    NonOverlayHost,
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionReason::Override => f.write_str("configured override"),
            DecisionReason::LayerLimit { layers } => {
                write!(f, "overlay root, {layers} layers exceed the mount option limit")
            }
            DecisionReason::WithinLimit { layers } => {
                write!(f, "overlay root, {layers} layers fit the mount option limit")
            }
            DecisionReason::NonOverlayHost => f.write_str("root filesystem is not overlay"),
        }
    }
}

/// The driver for this sandbox's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDecision {
    pub driver: StorageDriver,
    pub reason: DecisionReason,
}

/// Pure selection rule.
pub fn select(host_is_overlay: bool, max_layer_count: usize) -> StorageDecision {
    if !host_is_overlay {
        return StorageDecision {
            driver: StorageDriver::Overlay2,
            reason: DecisionReason::NonOverlayHost,
        };
    }

    let budget = MOUNT_OPTION_LIMIT_BYTES * SAFE_LIMIT_PERCENT / 100;
    if max_layer_count * PER_LAYER_MOUNT_OPTION_BYTES > budget {
        StorageDecision {
            driver: StorageDriver::Vfs,
            reason: DecisionReason::LayerLimit {
                layers: max_layer_count,
            },
        }
    } else {
        StorageDecision {
            driver: StorageDriver::Overlay2,
            reason: DecisionReason::WithinLimit {
                layers: max_layer_count,
            },
        }
    }
}

/// Selection with an optional configured override.
pub fn decide(
    override_driver: Option<StorageDriver>,
    host_is_overlay: bool,
    max_layer_count: usize,
) -> StorageDecision {
    match override_driver {
        Some(driver) => StorageDecision {
            driver,
            reason: DecisionReason::Override,
        },
        None => select(host_is_overlay, max_layer_count),
    }
}

/// Whether `/` is an overlay mount, from `/proc/self/mountinfo` text.
///
/// Later entries shadow earlier ones, so the last `/` mount counts.
pub fn detect_overlay_root(mountinfo: &str) -> bool {
    mountinfo
        .lines()
        .filter_map(|line| {
            let (mount, fs) = line.split_once(" - ")?;
            let mount_point = mount.split_whitespace().nth(4)?;
            let fs_type = fs.split_whitespace().next()?;
            (mount_point == "/").then_some(fs_type)
        })
        .last()
        .is_some_and(|fs_type| matches!(fs_type, "overlay" | "fuse.fuse-overlayfs"))
}

/// Deepest image among the tarballs in `dir`.
///
/// A missing directory counts as zero layers. Unreadable tarballs are
/// skipped; the loader reports them later.
pub fn max_layer_count(dir: &Path) -> io::Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut max = 0;
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(TARBALL_EXTENSION) {
            continue;
        }

        match read_archive_manifest(&path) {
            Ok(images) => {
                let layers = images.iter().map(|i| i.layers.len()).max().unwrap_or(0);
                debug!(path = %path.display(), layers, "tarball layer count");
                max = max.max(layers);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "cannot read tarball manifest"),
        }
    }

    Ok(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const OVERLAY_ROOT: &str = "\
24 1 0:22 / / rw,relatime - overlay overlay rw,lowerdir=/l1:/l2,upperdir=/u,workdir=/w
25 24 0:23 / /proc rw,nosuid,nodev,noexec,relatime - proc proc rw
";

    const EXT4_ROOT: &str = "\
21 1 259:2 / / rw,relatime shared:1 - ext4 /dev/nvme0n1p2 rw
22 21 0:20 / /sys rw,nosuid shared:2 - sysfs sysfs rw
";

    #[rstest]
    #[case(true, 50, StorageDriver::Vfs)]
    #[case(true, 33, StorageDriver::Vfs)]
    #[case(true, 32, StorageDriver::Overlay2)]
    #[case(true, 0, StorageDriver::Overlay2)]
    #[case(false, 50, StorageDriver::Overlay2)]
    #[case(false, 500, StorageDriver::Overlay2)]
    fn test_select(#[case] overlay: bool, #[case] layers: usize, #[case] expected: StorageDriver) {
        assert_eq!(select(overlay, layers).driver, expected);
    }

    #[test]
    fn test_override_wins() {
        let decision = decide(Some(StorageDriver::Overlay2), true, 80);
        assert_eq!(decision.driver, StorageDriver::Overlay2);
        assert_eq!(decision.reason, DecisionReason::Override);
    }

    #[test]
    fn test_detect_overlay_root() {
        assert!(detect_overlay_root(OVERLAY_ROOT));
        assert!(!detect_overlay_root(EXT4_ROOT));
        assert!(!detect_overlay_root(""));

        // A later overlay mount on / shadows the ext4 one
        let shadowed = format!("{EXT4_ROOT}30 21 0:40 / / rw - overlay overlay rw\n");
        assert!(detect_overlay_root(&shadowed));
    }

    #[test]
    fn test_driver_parse() {
        assert_eq!("VFS".parse::<StorageDriver>().unwrap(), StorageDriver::Vfs);
        assert_eq!(" overlay2 ".parse::<StorageDriver>().unwrap(), StorageDriver::Overlay2);
        assert!("btrfs".parse::<StorageDriver>().is_err());
    }

    #[test]
    fn test_max_layer_count_missing_dir() {
        assert_eq!(max_layer_count(Path::new("/nonexistent/images")).unwrap(), 0);
    }
}
