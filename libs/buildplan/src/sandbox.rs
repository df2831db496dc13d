//! The sandbox image plan.
//!
//! Package lists are opaque to this crate; what matters here is the order
//! of the steps, the states they depend on, and which inputs feed each
//! layer key.

use dindbox_artifacts::{ArtifactRegistry, Platform};
use sha2::{Digest, Sha256};

use crate::error::PlanError;
use crate::plan::{BuildPlan, BuildStep, TOKEN_PLACEHOLDER};

/// Base image every sandbox is built from.
pub const BASE_IMAGE: &str = "debian:bookworm-slim+python3.12";

/// Where the bootstrap script asset is installed inside the image.
pub const BOOTSTRAP_SCRIPT_PATH: &str = "/start-dockerd.sh";

/// Where the bootstrap binary is installed inside the image.
pub const BOOTSTRAP_BINARY_PATH: &str = "/usr/local/bin/dind-bootstrap";

/// Inputs the sandbox plan is parameterised over.
#[derive(Debug, Clone)]
pub struct SandboxPlanInputs<'a> {
    pub registry: &'a ArtifactRegistry,
    /// Where the prefetch step reads `registry` from. `None` means the
    /// built-in table, which is only accepted when `registry` is that table.
    pub registry_file: Option<&'a str>,
    pub artifact_dir: &'a str,
    pub platform: &'a Platform,
    /// Contents of the bootstrap script asset.
    pub bootstrap_script: &'a [u8],
    /// Contents of the `dind-bootstrap` binary installed into the image.
    pub bootstrap_binary: &'a [u8],
    /// Contents of the `dindbox-build` binary installed into the image.
    pub image_builder_binary: &'a [u8],
}

/// Environment of every sandbox process. `SANDBOX_VERSION` carries the
/// cache invalidation token into the running sandbox.
const SANDBOX_ENV: &[(&str, &str)] = &[
    ("HOME", "/root"),
    ("NODE_ENV", "development"),
    ("PNPM_HOME", "/root/.local/share/pnpm"),
    ("PATH", "/root/.bun/bin:/root/.local/share/pnpm:/usr/local/bin:/usr/bin:/bin"),
    ("PLAYWRIGHT_BROWSERS_PATH", "/root/.cache/ms-playwright"),
    ("PYTHONPATH", "/app"),
    ("SANDBOX_VERSION", TOKEN_PLACEHOLDER),
    ("NODE_PATH", "/usr/lib/node_modules"),
];

/// SHA-256 of an asset, as recorded in layer inputs.
pub fn asset_digest(contents: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(contents)))
}

fn prefetch_command(inputs: &SandboxPlanInputs<'_>) -> Result<String, PlanError> {
    let mut command = format!(
        "dindbox-build prefetch --dir {} --platform {}",
        inputs.artifact_dir, inputs.platform
    );
    match inputs.registry_file {
        Some(path) => {
            command.push_str(" --registry-file ");
            command.push_str(path);
        }
        None if inputs.registry.fingerprint() != ArtifactRegistry::supabase().fingerprint() => {
            return Err(PlanError::UnsourcedRegistry);
        }
        None => {}
    }
    Ok(command)
}

/// Build the plan for the sandbox image.
///
/// Fails if a custom artifact table is given without the file the prefetch
/// step should read it from.
pub fn sandbox_image_plan(inputs: &SandboxPlanInputs<'_>) -> Result<BuildPlan, PlanError> {
    let plan = BuildPlan::new(BASE_IMAGE, ["apt", "python"])
        .step(
            BuildStep::new("system-packages")
                .requires(["apt"])
                .provides(["curl", "git", "iproute2", "iptables", "wget", "unzip"])
                .commands([
                    "apt-get update",
                    "apt-get install -y git curl build-essential ca-certificates gnupg \
                     openssh-client jq unzip wget iproute2 iptables net-tools",
                ]),
        )
        .step(
            BuildStep::new("docker-apt-source")
                .requires(["apt", "curl"])
                .provides(["docker-apt-source"])
                .commands([
                    "install -m 0755 -d /etc/apt/keyrings",
                    "curl -fsSL https://download.docker.com/linux/debian/gpg -o /etc/apt/keyrings/docker.asc",
                    "chmod a+r /etc/apt/keyrings/docker.asc",
                    "echo \"deb [arch=$(dpkg --print-architecture) signed-by=/etc/apt/keyrings/docker.asc] \
                     https://download.docker.com/linux/debian $(. /etc/os-release && echo $VERSION_CODENAME) stable\" \
                     > /etc/apt/sources.list.d/docker.list",
                    "apt-get update",
                ]),
        )
        .step(
            BuildStep::new("docker-engine")
                .requires(["docker-apt-source"])
                .provides(["dockerd", "docker-cli"])
                .commands([
                    "apt-get install -y docker-ce docker-ce-cli containerd.io \
                     docker-buildx-plugin docker-compose-plugin",
                ]),
        )
        .step(
            BuildStep::new("runc-upgrade")
                .requires(["dockerd", "wget"])
                .provides(["runc"])
                .commands([
                    "rm -f $(which runc)",
                    "wget -q https://github.com/opencontainers/runc/releases/download/v1.3.0/runc.amd64",
                    "install -m 0755 runc.amd64 /usr/local/bin/runc",
                    "rm runc.amd64",
                ]),
        )
        .step(
            BuildStep::new("iptables-legacy")
                .requires(["iptables"])
                .provides(["iptables-legacy-default"])
                .commands([
                    "update-alternatives --set iptables /usr/sbin/iptables-legacy",
                    "update-alternatives --set ip6tables /usr/sbin/ip6tables-legacy",
                ]),
        )
        .step(
            BuildStep::new("supabase-cli")
                .requires(["curl"])
                .provides(["supabase-cli"])
                .commands([
                    "curl -fsSL -o /tmp/supabase.deb \"$(curl -s https://api.github.com/repos/supabase/cli/releases/latest \
                     | grep 'browser_download_url.*linux_amd64.deb' | cut -d '\"' -f 4)\"",
                    "dpkg -i /tmp/supabase.deb",
                    "rm /tmp/supabase.deb",
                ]),
        )
        .step(
            BuildStep::new("image-builder")
                .provides(["dindbox-build"])
                .commands(["install -m 0755 dindbox-build /usr/local/bin/dindbox-build"])
                .input("dindbox-build", env!("CARGO_PKG_VERSION"))
                .input("dindbox-build-binary", asset_digest(inputs.image_builder_binary)),
        )
        .step(
            BuildStep::new("prefetch-images")
                .requires(["dindbox-build", "supabase-cli"])
                .provides(["service-image-tarballs"])
                .commands([prefetch_command(inputs)?])
                .input("artifact-registry", inputs.registry.fingerprint()),
        )
        .step(
            BuildStep::new("bootstrap")
                .requires(["dockerd", "runc", "iptables-legacy-default", "service-image-tarballs"])
                .provides(["dind-bootstrap"])
                .commands([
                    format!("install -m 0755 dind-bootstrap {BOOTSTRAP_BINARY_PATH}"),
                    format!("install -m 0755 start-dockerd.sh {BOOTSTRAP_SCRIPT_PATH}"),
                ])
                .input("bootstrap-script", asset_digest(inputs.bootstrap_script))
                .input("bootstrap-binary", asset_digest(inputs.bootstrap_binary)),
        )
        .step(
            BuildStep::new("nodejs")
                .requires(["curl", "apt"])
                .provides(["node", "npm"])
                .commands([
                    "curl -fsSL https://deb.nodesource.com/setup_22.x | bash -",
                    "apt-get install -y nodejs",
                ]),
        )
        .step(
            BuildStep::new("pnpm-bun")
                .requires(["npm", "curl", "unzip"])
                .provides(["pnpm", "bun"])
                .commands([
                    "npm install -g pnpm@latest",
                    "curl -fsSL https://bun.sh/install | bash",
                ]),
        )
        .step(
            BuildStep::new("python-tools")
                .requires(["python"])
                .provides(["uv", "playwright"])
                .commands(["pip install uv httpx websockets playwright 'pydantic>=2.0' 'PyJWT[crypto]'"]),
        )
        .step(
            BuildStep::new("agent-cli")
                .requires(["npm"])
                .provides(["opencode"])
                .commands([
                    "npm install -g opencode-ai@latest",
                    "npm install -g @opencode-ai/plugin@latest zod",
                    "npm install -g opencode-anthropic-auth@0.0.7",
                ])
                .guarded(),
        )
        .step(
            BuildStep::new("browsers")
                .requires(["playwright"])
                .provides(["chromium"])
                .commands(["playwright install chromium", "playwright install-deps chromium"]),
        )
        .step(
            BuildStep::new("workspace-dirs")
                .provides(["workspace"])
                .commands(["mkdir -p /workspace /app/plugins /tmp/opencode"]),
        )
        .step(
            BuildStep::new("env")
                .requires(["workspace"])
                .provides(["sandbox-env"])
                .commands(
                    SANDBOX_ENV
                        .iter()
                        .map(|(key, value)| format!("echo '{key}={value}' >> /etc/environment")),
                )
                .guarded(),
        );
    Ok(plan)
}
