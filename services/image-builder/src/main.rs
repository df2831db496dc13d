//! dindbox-build - build-time tooling for the sandbox image.
//!
//! - `prefetch`: write the service image tarballs into the artifact directory
//! - `plan`: print the sandbox build plan with layer keys as JSON

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use dindbox_artifacts::{ArtifactRegistry, Platform, DEFAULT_ARTIFACT_DIR};
use dindbox_buildplan::{sandbox_image_plan, CacheInvalidationToken, SandboxPlanInputs};
use dindbox_image_builder::{PrefetchConfig, Prefetcher};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Build-time tooling for the dindbox sandbox image.
#[derive(Debug, Parser)]
#[command(name = "dindbox-build")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull every service image into a tarball, without a container daemon.
    Prefetch(PrefetchArgs),

    /// Print the sandbox build plan with layer keys as JSON.
    Plan(PlanArgs),
}

#[derive(Debug, Args)]
struct TableArgs {
    /// Directory the tarballs live in.
    #[arg(long, env = "DIND_ARTIFACT_DIR", default_value = DEFAULT_ARTIFACT_DIR)]
    dir: PathBuf,

    /// Platform images are resolved for (os/arch[/variant]).
    #[arg(long, env = "DIND_PLATFORM", default_value = "linux/amd64")]
    platform: Platform,

    /// TOML file of `[[image]]` entries replacing the built-in table.
    #[arg(long, env = "DIND_REGISTRY_FILE")]
    registry_file: Option<PathBuf>,
}

impl TableArgs {
    fn registry(&self) -> Result<ArtifactRegistry> {
        match &self.registry_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                ArtifactRegistry::from_toml_str(&raw)
                    .with_context(|| format!("parsing {}", path.display()))
            }
            None => Ok(ArtifactRegistry::supabase()),
        }
    }
}

#[derive(Debug, Args)]
struct PrefetchArgs {
    #[command(flatten)]
    table: TableArgs,

    /// Images fetched at the same time.
    #[arg(long, env = "DIND_PREFETCH_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Registry mirror as `api-host=url` (repeatable).
    #[arg(long = "mirror", value_name = "HOST=URL")]
    mirrors: Vec<String>,
}

#[derive(Debug, Args)]
struct PlanArgs {
    #[command(flatten)]
    table: TableArgs,

    /// Cache invalidation token; defaults to the built-in one.
    #[arg(long, env = "DIND_CACHE_TOKEN")]
    token: Option<String>,

    /// Bootstrap script asset whose digest keys the bootstrap layer.
    #[arg(long, default_value = "services/bootstrap/assets/start-dockerd.sh")]
    bootstrap_script: PathBuf,

    /// `dind-bootstrap` binary installed into the image.
    #[arg(
        long,
        env = "DIND_BOOTSTRAP_BINARY",
        default_value = "target/release/dind-bootstrap"
    )]
    bootstrap_binary: PathBuf,

    /// `dindbox-build` binary installed into the image; defaults to this one.
    #[arg(long, env = "DIND_IMAGE_BUILDER_BINARY")]
    image_builder_binary: Option<PathBuf>,
}

fn read_asset(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn parse_mirrors(raw: &[String]) -> Result<HashMap<String, String>> {
    raw.iter()
        .map(|m| match m.split_once('=') {
            Some((host, url)) if !host.is_empty() && !url.is_empty() => {
                Ok((host.to_string(), url.to_string()))
            }
            _ => bail!("invalid mirror '{m}', expected HOST=URL"),
        })
        .collect()
}

async fn prefetch(args: PrefetchArgs) -> Result<()> {
    let registry = args.table.registry()?;

    let mut config = PrefetchConfig::new(&args.table.dir);
    config.platform = args.table.platform.clone();
    config.concurrency = args.concurrency;
    config.mirrors = parse_mirrors(&args.mirrors)?;

    let report = Prefetcher::new(config).run(&registry).await?;

    for image in &report.images {
        info!(
            service = %image.service,
            path = %image.artifact.path.display(),
            size_bytes = image.size_bytes,
            layers = image.layer_count,
            skipped = image.skipped,
            "Tarball ready"
        );
    }

    Ok(())
}

fn plan(args: PlanArgs) -> Result<()> {
    let registry = args.table.registry()?;
    let token = match args.token {
        Some(token) => CacheInvalidationToken::new(token)?,
        None => CacheInvalidationToken::current(),
    };
    let script = read_asset(&args.bootstrap_script)?;
    let bootstrap_binary = read_asset(&args.bootstrap_binary)?;
    let image_builder_binary = match &args.image_builder_binary {
        Some(path) => read_asset(path)?,
        None => read_asset(&std::env::current_exe().context("locating dindbox-build")?)?,
    };
    let artifact_dir = args.table.dir.to_string_lossy();
    let registry_file = args
        .table
        .registry_file
        .as_ref()
        .map(|path| path.to_string_lossy());

    let plan = sandbox_image_plan(&SandboxPlanInputs {
        registry: &registry,
        registry_file: registry_file.as_deref(),
        artifact_dir: &artifact_dir,
        platform: &args.table.platform,
        bootstrap_script: &script,
        bootstrap_binary: &bootstrap_binary,
        image_builder_binary: &image_builder_binary,
    })?;
    let rendered = plan.render(&token)?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "base_image": plan.base_image(),
            "token": token.as_str(),
            "steps": rendered,
        }))?
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    // Logs go to stderr; `plan` prints its JSON on stdout
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Prefetch(args) => prefetch(args).await,
        Commands::Plan(args) => plan(args),
    };

    if let Err(e) = result {
        error!(error = %format!("{e:#}"), "dindbox-build failed");
        std::process::exit(1);
    }
}
