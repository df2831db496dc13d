//! Prefetch against a fake OCI registry.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use dindbox_artifacts::archive::read_archive_manifest;
use dindbox_artifacts::ArtifactRegistry;
use dindbox_image_builder::{PrefetchConfig, PrefetchError, Prefetcher};
use serde_json::json;
use sha2::{Digest, Sha256};
use tempfile::tempdir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "anon-token";
const REPO: &str = "library/kong";

fn digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

struct FakeImage {
    config: Vec<u8>,
    layers: Vec<Vec<u8>>,
    manifest: Vec<u8>,
    index: Vec<u8>,
}

impl FakeImage {
    fn new() -> Self {
        let config = br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers"}}"#.to_vec();
        let layers = vec![b"base-layer-bytes".to_vec(), b"app-layer-bytes".to_vec()];

        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "digest": digest(&config),
                "size": config.len(),
            },
            "layers": layers.iter().map(|l| json!({
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "digest": digest(l),
                "size": l.len(),
            })).collect::<Vec<_>>(),
        }))
        .unwrap();

        let index = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
            "manifests": [
                {
                    "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                    "digest": "sha256:0000000000000000000000000000000000000000000000000000000000000000",
                    "size": 10,
                    "platform": {"architecture": "arm64", "os": "linux", "variant": "v8"}
                },
                {
                    "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                    "digest": digest(&manifest),
                    "size": manifest.len(),
                    "platform": {"architecture": "amd64", "os": "linux"}
                }
            ]
        }))
        .unwrap();

        Self {
            config,
            layers,
            manifest,
            index,
        }
    }

    /// Mount the image behind an anonymous bearer token.
    async fn mount(&self, server: &MockServer) {
        let challenge = format!(
            r#"Bearer realm="{}/token",service="fake-registry",scope="repository:{REPO}:pull""#,
            server.uri()
        );

        Mock::given(method("GET"))
            .and(path("/token"))
            .and(query_param("service", "fake-registry"))
            .and(query_param("scope", format!("repository:{REPO}:pull")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": TOKEN})))
            .mount(server)
            .await;

        let authed = |p: String, body: &[u8]| {
            Mock::given(method("GET"))
                .and(path(p))
                .and(header("authorization", format!("Bearer {TOKEN}").as_str()))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
                .with_priority(1)
        };

        authed(format!("/v2/{REPO}/manifests/2.8.1"), &self.index)
            .mount(server)
            .await;
        authed(
            format!("/v2/{REPO}/manifests/{}", digest(&self.manifest)),
            &self.manifest,
        )
        .mount(server)
        .await;
        authed(format!("/v2/{REPO}/blobs/{}", digest(&self.config)), &self.config)
            .mount(server)
            .await;
        for layer in &self.layers {
            authed(format!("/v2/{REPO}/blobs/{}", digest(layer)), layer)
                .mount(server)
                .await;
        }

        // Anything under the repository without a token is challenged
        Mock::given(method("GET"))
            .and(wiremock::matchers::path_regex(format!("^/v2/{REPO}/.*")))
            .respond_with(
                ResponseTemplate::new(401).insert_header("www-authenticate", challenge.as_str()),
            )
            .with_priority(10)
            .mount(server)
            .await;
    }
}

fn config_for(dir: &Path, server: &MockServer) -> PrefetchConfig {
    let mut config = PrefetchConfig::new(dir);
    config.mirrors = HashMap::from([("registry-1.docker.io".to_string(), server.uri())]);
    config
}

fn tar_entries(path: &Path) -> HashMap<String, Vec<u8>> {
    let mut archive = tar::Archive::new(std::fs::File::open(path).unwrap());
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut body = Vec::new();
            entry.read_to_end(&mut body).unwrap();
            (name, body)
        })
        .collect()
}

fn dir_listing(dir: &Path) -> Vec<(String, u64)> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| {
            let e = e.unwrap();
            (
                e.file_name().to_string_lossy().into_owned(),
                e.metadata().unwrap().len(),
            )
        })
        .collect();
    files.sort();
    files
}

#[tokio::test]
async fn test_prefetch_writes_loadable_tarball() {
    let server = MockServer::start().await;
    let image = FakeImage::new();
    image.mount(&server).await;

    let dir = tempdir().unwrap();
    let registry = ArtifactRegistry::from_entries([("kong", "library/kong:2.8.1")]).unwrap();

    let report = Prefetcher::new(config_for(dir.path(), &server))
        .run(&registry)
        .await
        .unwrap();

    assert_eq!(report.images.len(), 1);
    let fetched = &report.images[0];
    assert!(!fetched.skipped);
    assert_eq!(fetched.layer_count, 2);
    assert_eq!(fetched.manifest_digest.as_deref(), Some(digest(&image.manifest).as_str()));

    let tarball = dir.path().join("kong.tar");
    assert_eq!(fetched.artifact.path, tarball);

    let manifest = read_archive_manifest(&tarball).unwrap();
    assert_eq!(manifest.len(), 1);
    assert_eq!(manifest[0].repo_tags, vec!["kong:2.8.1".to_string()]);
    assert_eq!(manifest[0].layers.len(), 2);

    // Every path manifest.json names is in the archive with the registry's bytes
    let entries = tar_entries(&tarball);
    assert_eq!(entries[&manifest[0].config], image.config);
    for (name, expected) in manifest[0].layers.iter().zip(&image.layers) {
        assert_eq!(&entries[name], expected);
    }

    // No staging or temp files left behind
    assert_eq!(dir_listing(dir.path()).len(), 1);
}

#[tokio::test]
async fn test_prefetch_rerun_is_noop() {
    let server = MockServer::start().await;
    let image = FakeImage::new();
    image.mount(&server).await;

    let dir = tempdir().unwrap();
    let registry = ArtifactRegistry::from_entries([("kong", "library/kong:2.8.1")]).unwrap();
    let prefetcher = Prefetcher::new(config_for(dir.path(), &server));

    prefetcher.run(&registry).await.unwrap();
    let first = dir_listing(dir.path());
    let first_bytes = std::fs::read(dir.path().join("kong.tar")).unwrap();
    let requests_after_first = server.received_requests().await.unwrap().len();

    let report = prefetcher.run(&registry).await.unwrap();

    assert_eq!(report.skipped(), 1);
    assert_eq!(report.fetched(), 0);
    assert_eq!(report.images[0].layer_count, 2);
    assert_eq!(dir_listing(dir.path()), first);
    assert_eq!(std::fs::read(dir.path().join("kong.tar")).unwrap(), first_bytes);
    assert_eq!(
        server.received_requests().await.unwrap().len(),
        requests_after_first
    );
}

#[tokio::test]
async fn test_other_platform_is_not_skipped() {
    let server = MockServer::start().await;
    let image = FakeImage::new();
    image.mount(&server).await;

    let dir = tempdir().unwrap();
    let registry = ArtifactRegistry::from_entries([("kong", "library/kong:2.8.1")]).unwrap();
    Prefetcher::new(config_for(dir.path(), &server))
        .run(&registry)
        .await
        .unwrap();
    let amd64_bytes = std::fs::read(dir.path().join("kong.tar")).unwrap();

    // The arm64 manifest is listed in the index but not served
    let mut config = config_for(dir.path(), &server);
    config.platform = "linux/arm64/v8".parse().unwrap();
    let err = Prefetcher::new(config).run(&registry).await.unwrap_err();
    assert!(matches!(err, PrefetchError::Incomplete { .. }));

    let arm64_manifest = format!(
        "/v2/{REPO}/manifests/sha256:0000000000000000000000000000000000000000000000000000000000000000"
    );
    let requested = server.received_requests().await.unwrap();
    assert!(requested.iter().any(|r| r.url.path() == arm64_manifest));

    // A failed fetch keeps the previous tarball in place
    assert_eq!(std::fs::read(dir.path().join("kong.tar")).unwrap(), amd64_bytes);
}

#[tokio::test]
async fn test_prefetch_replaces_foreign_tarball() {
    let server = MockServer::start().await;
    FakeImage::new().mount(&server).await;

    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("kong.tar"), b"left over from an older build").unwrap();

    let registry = ArtifactRegistry::from_entries([("kong", "library/kong:2.8.1")]).unwrap();
    let report = Prefetcher::new(config_for(dir.path(), &server))
        .run(&registry)
        .await
        .unwrap();

    assert_eq!(report.fetched(), 1);
    let manifest = read_archive_manifest(&dir.path().join("kong.tar")).unwrap();
    assert_eq!(manifest[0].repo_tags, vec!["kong:2.8.1".to_string()]);
}

#[tokio::test]
async fn test_missing_tag_fails_whole_run() {
    let server = MockServer::start().await;
    FakeImage::new().mount(&server).await;

    let dir = tempdir().unwrap();
    let registry = ArtifactRegistry::from_entries([
        ("kong", "library/kong:2.8.1"),
        ("vector", "timberio/vector:0.0.0-missing"),
    ])
    .unwrap();

    let err = Prefetcher::new(config_for(dir.path(), &server))
        .run(&registry)
        .await
        .unwrap_err();

    match err {
        PrefetchError::Incomplete { total, failures } => {
            assert_eq!(total, 2);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].service, "vector");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // The failed image leaves nothing behind, not even a partial file
    let files: Vec<String> = dir_listing(dir.path()).into_iter().map(|(n, _)| n).collect();
    assert_eq!(files, vec!["kong.tar".to_string()]);
}

#[tokio::test]
async fn test_platform_missing_from_index_fails() {
    let server = MockServer::start().await;
    FakeImage::new().mount(&server).await;

    let dir = tempdir().unwrap();
    let registry = ArtifactRegistry::from_entries([("kong", "library/kong:2.8.1")]).unwrap();
    let mut config = config_for(dir.path(), &server);
    config.platform = "linux/s390x".parse().unwrap();

    let err = Prefetcher::new(config).run(&registry).await.unwrap_err();
    assert!(err.to_string().contains("linux/s390x"));
    assert!(!dir.path().join("kong.tar").exists());
}
