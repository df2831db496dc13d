//! Image tarball layout.
//!
//! Tarballs use the layout `docker load` accepts: a `manifest.json` index,
//! the image config, and one file per layer blob. Layer blobs are stored as
//! fetched from the registry (the daemon decompresses them on load).
//!
//! Archives are written deterministically: fixed entry order, `manifest.json`
//! first, zero mtime/uid/gid and mode 0644, so the same blobs always produce
//! byte-identical files.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::reference::Platform;

/// Name of the index entry inside an image tarball.
pub const MANIFEST_FILE: &str = "manifest.json";

/// One image described by `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArchiveManifestEntry {
    /// Path of the config blob inside the archive.
    pub config: String,
    /// Names the daemon tags the image with on load.
    #[serde(default)]
    pub repo_tags: Vec<String>,
    /// Paths of the layer blobs inside the archive, base layer first.
    pub layers: Vec<String>,
}

/// A blob to place into an archive.
#[derive(Debug, Clone)]
pub struct ArchiveBlob {
    /// Content digest (`sha256:<hex>`).
    pub digest: String,
    /// Registry media type; decides the file extension.
    pub media_type: String,
    /// Where the verified blob currently lives on disk.
    pub path: PathBuf,
}

/// Everything needed to write one image tarball.
#[derive(Debug, Clone)]
pub struct ArchiveContents {
    pub repo_tag: String,
    pub config: ArchiveBlob,
    pub layers: Vec<ArchiveBlob>,
}

fn digest_hex(digest: &str) -> &str {
    digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest)
}

/// File name of the config blob inside the archive.
pub fn config_entry_name(digest: &str) -> String {
    format!("{}.json", digest_hex(digest))
}

/// File name of a layer blob inside the archive.
pub fn layer_entry_name(digest: &str, media_type: &str) -> String {
    let extension = if media_type.ends_with("gzip") {
        "tar.gz"
    } else if media_type.ends_with("zstd") {
        "tar.zst"
    } else {
        "tar"
    };
    format!("{}.{}", digest_hex(digest), extension)
}

impl ArchiveContents {
    /// The `manifest.json` entry for these contents.
    pub fn manifest(&self) -> ArchiveManifestEntry {
        ArchiveManifestEntry {
            config: config_entry_name(&self.config.digest),
            repo_tags: vec![self.repo_tag.clone()],
            layers: self
                .layers
                .iter()
                .map(|l| layer_entry_name(&l.digest, &l.media_type))
                .collect(),
        }
    }
}

fn header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

/// Write an image tarball to `dest`. Returns the archive size in bytes.
pub fn write_archive(dest: &Path, contents: &ArchiveContents) -> io::Result<u64> {
    let manifest = serde_json::to_vec(&[contents.manifest()])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let file = File::create(dest)?;
    let mut builder = tar::Builder::new(BufWriter::new(file));

    let mut manifest_header = header(manifest.len() as u64);
    builder.append_data(&mut manifest_header, MANIFEST_FILE, manifest.as_slice())?;

    let config_name = config_entry_name(&contents.config.digest);
    append_blob(&mut builder, &config_name, &contents.config.path)?;

    for layer in &contents.layers {
        let name = layer_entry_name(&layer.digest, &layer.media_type);
        append_blob(&mut builder, &name, &layer.path)?;
    }

    let writer = builder.into_inner()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok(file.metadata()?.len())
}

fn append_blob<W: io::Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    source: &Path,
) -> io::Result<()> {
    let file = File::open(source)?;
    let size = file.metadata()?.len();
    let mut entry_header = header(size);
    builder.append_data(&mut entry_header, name, BufReader::new(file))
}

/// Body of the entry called `name`, if the archive has one.
fn read_entry(path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
    let file = File::open(path)?;
    let mut archive = tar::Archive::new(BufReader::new(file));

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.as_os_str() != name {
            continue;
        }
        let mut body = Vec::new();
        entry.read_to_end(&mut body)?;
        return Ok(Some(body));
    }
    Ok(None)
}

fn invalid_data(e: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Read `manifest.json` from an image tarball.
///
/// Fails with `InvalidData` if the archive is unreadable or has no index.
pub fn read_archive_manifest(path: &Path) -> io::Result<Vec<ArchiveManifestEntry>> {
    match read_entry(path, MANIFEST_FILE)? {
        Some(body) => serde_json::from_slice(&body).map_err(invalid_data),
        None => Err(invalid_data(format!(
            "{} has no {MANIFEST_FILE}",
            path.display()
        ))),
    }
}

/// Platform fields of an image config blob.
#[derive(Debug, Deserialize)]
struct ConfigPlatform {
    os: String,
    architecture: String,
    #[serde(default)]
    variant: Option<String>,
}

/// Platform of the image `entry` describes, read from its config blob.
pub fn read_archive_platform(path: &Path, entry: &ArchiveManifestEntry) -> io::Result<Platform> {
    let body = read_entry(path, &entry.config)?.ok_or_else(|| {
        invalid_data(format!("{} has no {}", path.display(), entry.config))
    })?;
    let config: ConfigPlatform = serde_json::from_slice(&body).map_err(invalid_data)?;
    Ok(Platform {
        os: config.os,
        architecture: config.architecture,
        variant: config.variant,
    })
}

/// Whether `path` holds a readable tarball of exactly `repo_tag`, built for
/// `platform`.
pub fn archive_holds(path: &Path, repo_tag: &str, platform: &Platform) -> bool {
    let Ok(entries) = read_archive_manifest(path) else {
        return false;
    };
    let Some(entry) = entries
        .iter()
        .find(|e| e.repo_tags.iter().any(|t| t == repo_tag))
    else {
        return false;
    };

    match read_archive_platform(path, entry) {
        Ok(held) => platform.matches(&held.os, &held.architecture, held.variant.as_deref()),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn blob(dir: &Path, name: &str, body: &[u8], digest: &str, media_type: &str) -> ArchiveBlob {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        ArchiveBlob {
            digest: digest.to_string(),
            media_type: media_type.to_string(),
            path,
        }
    }

    fn contents(dir: &Path) -> ArchiveContents {
        ArchiveContents {
            repo_tag: "kong:2.8.1".to_string(),
            config: blob(
                dir,
                "config",
                br#"{"architecture":"arm64","os":"linux","variant":"v8"}"#,
                "sha256:c0ffee",
                "application/vnd.docker.container.image.v1+json",
            ),
            layers: vec![
                blob(
                    dir,
                    "l1",
                    b"layer-one",
                    "sha256:aaaa",
                    "application/vnd.docker.image.rootfs.diff.tar.gzip",
                ),
                blob(
                    dir,
                    "l2",
                    b"layer-two",
                    "sha256:bbbb",
                    "application/vnd.oci.image.layer.v1.tar",
                ),
            ],
        }
    }

    #[test]
    fn test_entry_names() {
        assert_eq!(config_entry_name("sha256:abc"), "abc.json");
        assert_eq!(
            layer_entry_name("sha256:abc", "application/vnd.oci.image.layer.v1.tar+gzip"),
            "abc.tar.gz"
        );
        assert_eq!(
            layer_entry_name("sha256:abc", "application/vnd.oci.image.layer.v1.tar+zstd"),
            "abc.tar.zst"
        );
        assert_eq!(
            layer_entry_name("sha256:abc", "application/vnd.oci.image.layer.v1.tar"),
            "abc.tar"
        );
    }

    #[test]
    fn test_written_archive_is_loadable_layout() {
        let dir = tempdir().unwrap();
        let contents = contents(dir.path());
        let dest = dir.path().join("kong.tar");

        write_archive(&dest, &contents).unwrap();

        let manifest = read_archive_manifest(&dest).unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].config, "c0ffee.json");
        assert_eq!(manifest[0].repo_tags, vec!["kong:2.8.1".to_string()]);
        assert_eq!(manifest[0].layers, vec!["aaaa.tar.gz", "bbbb.tar"]);
        let arm64: Platform = "linux/arm64/v8".parse().unwrap();
        assert!(archive_holds(&dest, "kong:2.8.1", &arm64));
        assert!(!archive_holds(&dest, "kong:2.8.2", &arm64));
    }

    #[test]
    fn test_holds_checks_the_config_platform() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("kong.tar");
        write_archive(&dest, &contents(dir.path())).unwrap();

        let manifest = read_archive_manifest(&dest).unwrap();
        let held = read_archive_platform(&dest, &manifest[0]).unwrap();
        assert_eq!(held.to_string(), "linux/arm64/v8");

        assert!(!archive_holds(&dest, "kong:2.8.1", &Platform::linux_amd64()));
        assert!(archive_holds(&dest, "kong:2.8.1", &"linux/arm64".parse().unwrap()));
    }

    #[test]
    fn test_archive_is_deterministic() {
        let dir = tempdir().unwrap();
        let contents = contents(dir.path());
        let first = dir.path().join("first.tar");
        let second = dir.path().join("second.tar");

        write_archive(&first, &contents).unwrap();
        write_archive(&second, &contents).unwrap();

        assert_eq!(std::fs::read(&first).unwrap(), std::fs::read(&second).unwrap());
    }

    #[test]
    fn test_garbage_is_not_an_archive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.tar");
        std::fs::write(&path, b"definitely not a tarball").unwrap();

        assert!(read_archive_manifest(&path).is_err());
        assert!(!archive_holds(&path, "kong:2.8.1", &Platform::default()));
    }
}
