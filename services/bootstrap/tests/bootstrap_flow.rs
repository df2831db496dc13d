//! Image preload and the full start-up sequence against a fake daemon API
//! served on a Unix socket.

use std::convert::Infallible;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dindbox_artifacts::archive::{read_archive_manifest, write_archive, ArchiveBlob, ArchiveContents};
use dindbox_bootstrap::loader::LoadError;
use dindbox_bootstrap::network::LEGACY_IPTABLES_PATH;
use dindbox_bootstrap::{
    Bootstrap, BootstrapError, CommandOutput, CommandRunner, Config, DaemonApi, DockerClient,
    ImageLoader, LoaderConfig, RecordingRunner, StaticLocator, StorageDriver,
};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use tempfile::{tempdir, NamedTempFile};
use tokio::net::UnixListener;

/// Serve a fake Engine API on `socket`. `/_ping` answers OK when `ready`.
/// `/images/load` accepts well-formed image tarballs.
fn serve(socket: &Path, ready: bool) {
    let listener = UnixListener::bind(socket).unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(req, ready));
                let _ = Http::new().serve_connection(stream, service).await;
            });
        }
    });
}

async fn handle(req: Request<Body>, ready: bool) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/_ping") if ready => Response::new(split_body(&["O", "K"])),
        (&Method::GET, "/_ping") => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from("starting"))
            .unwrap(),
        (&Method::POST, "/images/load") => {
            let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
            Response::new(Body::from(load_reply(&body)))
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from(r#"{"message":"page not found"}"#))
            .unwrap(),
    };
    Ok(response)
}

/// A chunked body delivered one part at a time.
fn split_body(parts: &[&'static str]) -> Body {
    let (mut sender, body) = Body::channel();
    let parts = parts.to_vec();
    tokio::spawn(async move {
        for part in parts {
            if sender.send_data(part.into()).await.is_err() {
                return;
            }
            tokio::task::yield_now().await;
        }
    });
    body
}

fn load_reply(tarball: &[u8]) -> String {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(tarball).unwrap();

    match read_archive_manifest(file.path()) {
        Ok(entries) => entries
            .iter()
            .flat_map(|e| e.repo_tags.iter())
            .map(|tag| format!("{{\"stream\":\"Loaded image: {tag}\\n\"}}\n"))
            .collect(),
        Err(_) => {
            "{\"errorDetail\":{\"message\":\"unexpected EOF\"},\"error\":\"unexpected EOF\"}\n"
                .to_string()
        }
    }
}

fn write_image(dir: &Path, name: &str, layers: usize) {
    let blob = |seed: usize| {
        let path = dir.join(format!(".{name}-{seed}.blob"));
        std::fs::write(&path, format!("{name} {seed}")).unwrap();
        ArchiveBlob {
            digest: format!("sha256:{seed:064x}"),
            media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
            path,
        }
    };

    let contents = ArchiveContents {
        repo_tag: format!("supabase/{name}:1.0"),
        config: blob(0),
        layers: (1..=layers).map(blob).collect(),
    };
    write_archive(&dir.join(format!("{name}.tar")), &contents).unwrap();
}

fn loader_config(dir: &Path, attempts: u32) -> LoaderConfig {
    LoaderConfig {
        artifact_dir: dir.to_path_buf(),
        ready_attempts: attempts,
        ready_interval: Duration::from_millis(20),
    }
}

#[tokio::test]
async fn corrupt_tarball_does_not_block_the_rest() {
    let run = tempdir().unwrap();
    let images = tempdir().unwrap();
    let socket = run.path().join("docker.sock");
    serve(&socket, true);

    write_image(images.path(), "gotrue", 4);
    write_image(images.path(), "realtime", 6);
    std::fs::write(images.path().join("postgres.tar"), b"truncated").unwrap();

    let loader = ImageLoader::new(
        Arc::new(DockerClient::new(&socket)),
        loader_config(images.path(), 3),
    );
    let report = loader.load_all().await.unwrap();

    let loaded: Vec<_> = report.loaded.iter().flat_map(|l| l.images.clone()).collect();
    assert_eq!(loaded, vec!["supabase/gotrue:1.0", "supabase/realtime:1.0"]);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].path.ends_with("postgres.tar"));
    assert!(report.failed[0].reason.contains("unexpected EOF"));
}

#[tokio::test]
async fn ping_reads_the_whole_chunked_body() {
    let run = tempdir().unwrap();
    let socket = run.path().join("docker.sock");
    serve(&socket, true);

    DockerClient::new(&socket).ping().await.unwrap();
}

#[tokio::test]
async fn unresponsive_daemon_is_not_ready() {
    let run = tempdir().unwrap();
    let images = tempdir().unwrap();
    let socket = run.path().join("docker.sock");
    serve(&socket, false);
    write_image(images.path(), "kong", 2);

    let loader = ImageLoader::new(
        Arc::new(DockerClient::new(&socket)),
        loader_config(images.path(), 3),
    );
    let err = loader.load_all().await.unwrap_err();

    match err {
        LoadError::DaemonNotReady {
            attempts,
            last_error,
        } => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("starting"));
        }
        other => panic!("expected DaemonNotReady, got {other:?}"),
    }
}

const ROUTES: &str = "default via 172.20.0.1 dev eth0\n";
const ADDRS: &str = "3: eth0: <UP>\n    inet 172.20.0.5/16 scope global eth0\n";
const OVERLAY_MOUNTINFO: &str =
    "31 1 0:30 / / rw,relatime - overlay overlay rw,lowerdir=/a:/b,upperdir=/c,workdir=/d\n";

struct Sandbox {
    _root: tempfile::TempDir,
    config: Config,
    mountinfo: PathBuf,
    daemon_args: PathBuf,
}

/// A sandbox layout in a temp dir with a fake daemon binary that records
/// its arguments and sleeps. The fake API server stands in for its socket.
fn sandbox(ready: bool) -> Sandbox {
    let root = tempdir().unwrap();
    let path = |p: &str| root.path().join(p);

    let images = path("images");
    std::fs::create_dir(&images).unwrap();
    write_image(&images, "auth", 3);
    write_image(&images, "studio", 40);

    let daemon_args = path("dockerd.args");
    let dockerd = path("dockerd");
    std::fs::write(
        &dockerd,
        format!(
            "#!/bin/sh\necho \"$@\" > {}\nexec sleep 30\n",
            daemon_args.display()
        ),
    )
    .unwrap();
    std::fs::set_permissions(&dockerd, std::fs::Permissions::from_mode(0o755)).unwrap();

    let socket = path("docker.sock");
    serve(&socket, ready);

    let mountinfo = path("mountinfo");
    std::fs::write(&mountinfo, OVERLAY_MOUNTINFO).unwrap();
    std::fs::write(path("ip_forward"), "0\n").unwrap();

    let config = Config {
        artifact_dir: images,
        dockerd_path: dockerd,
        docker_socket: socket,
        storage_driver: None,
        daemon_debug: false,
        socket_timeout: Duration::from_secs(5),
        ready_attempts: 3,
        ready_interval: Duration::from_millis(20),
        detach: false,
        boot_log: path("boot.log"),
        ip_forward_path: path("ip_forward"),
    };

    Sandbox {
        config,
        mountinfo,
        daemon_args,
        _root: root,
    }
}

fn healthy_host() -> Arc<RecordingRunner> {
    Arc::new(
        RecordingRunner::new()
            .respond(&["ip", "route", "show", "default"], CommandOutput::ok(ROUTES))
            .respond(&["ip", "-4", "addr"], CommandOutput::ok(ADDRS)),
    )
}

async fn recorded_args(path: &Path) -> String {
    for _ in 0..100 {
        if let Ok(args) = std::fs::read_to_string(path) {
            if !args.is_empty() {
                return args.trim().to_string();
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("fake daemon never recorded its arguments");
}

#[tokio::test]
async fn full_start_on_overlay_host() {
    let sandbox = sandbox(true);
    let runner = healthy_host();
    let locator = StaticLocator::empty().with_file(LEGACY_IPTABLES_PATH);

    let outcome = Bootstrap::with_host(
        sandbox.config.clone(),
        runner.clone() as Arc<dyn CommandRunner>,
        Arc::new(locator),
    )
    .with_mountinfo_path(&sandbox.mountinfo)
    .run()
    .await
    .unwrap();

    assert_eq!(outcome.network.context.interface, "eth0");
    assert_eq!(outcome.network.installed_rules(), 2);
    assert_eq!(runner.calls_to(LEGACY_IPTABLES_PATH), 2);
    assert_eq!(
        std::fs::read_to_string(&sandbox.config.ip_forward_path).unwrap(),
        "1\n"
    );

    // 40 layers on an overlay root do not fit the mount options
    assert_eq!(outcome.storage.driver, StorageDriver::Vfs);
    assert_eq!(
        recorded_args(&sandbox.daemon_args).await,
        "--iptables=false --ip6tables=false --storage-driver=vfs"
    );

    assert_eq!(outcome.load.loaded.len(), 2);
    assert!(outcome.load.is_complete());

    outcome.daemon.terminate().await.unwrap();
}

#[tokio::test]
async fn unreadable_artifact_dir_keeps_the_daemon_running() {
    let sandbox = sandbox(true);
    let not_a_dir = sandbox.config.boot_log.with_file_name("images.txt");
    std::fs::write(&not_a_dir, "not a directory").unwrap();
    let config = Config {
        artifact_dir: not_a_dir.clone(),
        ..sandbox.config.clone()
    };

    let outcome = Bootstrap::with_host(
        config,
        healthy_host() as Arc<dyn CommandRunner>,
        Arc::new(StaticLocator::empty().with_file(LEGACY_IPTABLES_PATH)),
    )
    .with_mountinfo_path(&sandbox.mountinfo)
    .run()
    .await
    .unwrap();

    assert!(outcome.load.loaded.is_empty());
    assert!(!outcome.load.is_complete());
    assert_eq!(outcome.load.failed[0].path, not_a_dir);
    assert_eq!(outcome.storage.driver, StorageDriver::Overlay2);

    // SIGTERM: 128 + 15, so the daemon was still up
    assert_eq!(outcome.daemon.terminate().await.unwrap(), 143);
}

#[tokio::test]
async fn no_default_route_stops_before_the_daemon() {
    let sandbox = sandbox(true);
    let runner = Arc::new(RecordingRunner::new());

    let err = Bootstrap::with_host(
        sandbox.config.clone(),
        runner.clone() as Arc<dyn CommandRunner>,
        Arc::new(StaticLocator::empty().with_file(LEGACY_IPTABLES_PATH)),
    )
    .with_mountinfo_path(&sandbox.mountinfo)
    .run()
    .await
    .err()
    .unwrap();

    assert_eq!(err.reason_code(), "no_default_device");
    assert_eq!(runner.calls_to(LEGACY_IPTABLES_PATH), 0);
    assert!(!sandbox.daemon_args.exists());
}

#[tokio::test]
async fn daemon_never_ready_is_fatal() {
    let sandbox = sandbox(false);

    let err = Bootstrap::with_host(
        sandbox.config.clone(),
        healthy_host() as Arc<dyn CommandRunner>,
        Arc::new(StaticLocator::empty()),
    )
    .with_mountinfo_path(&sandbox.mountinfo)
    .run()
    .await
    .err()
    .unwrap();

    assert!(matches!(
        err,
        BootstrapError::Load(LoadError::DaemonNotReady { attempts: 3, .. })
    ));
    assert_eq!(err.reason_code(), "daemon_not_ready");
}
