//! `snapdesk-package` – build the release CLI and assemble a distributable
//! directory next to the bundled backup engine.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use snapctl_lib::{config, logging};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{error, info, warn};

const PRODUCT_NAME: &str = "SnapDesk";
const CLI_PACKAGE: &str = "snapctl";
const DIST_CONFIG: &str = "snapdesk.yaml.dist";
const PRIVATE_PREFIX: &str = "_private_";
const EXCLUDES_DIR: &str = "excludes";
const LICENSE_FILE: &str = "LICENSE";

#[derive(Parser)]
#[command(author, version, about = "Build and package the SnapDesk client", long_about = None)]
struct Cli {
    /// Workspace root (defaults to the one this binary was built from)
    #[arg(long)]
    workspace: Option<PathBuf>,
    /// Directory holding engine binaries in <os>-<arch> subdirectories
    #[arg(long)]
    engine_dir: Option<PathBuf>,
    /// Directory holding the dist config files
    #[arg(long)]
    dist_dir: Option<PathBuf>,
    /// Target OS name used for the output directory
    #[arg(long, default_value = std::env::consts::OS)]
    os: String,
    /// Target architecture used for the output directory
    #[arg(long, default_value = std::env::consts::ARCH)]
    arch: String,
    /// Reuse an existing release build
    #[arg(long)]
    skip_build: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let logging_config = config::load_config(None)
        .map(|c| c.logging)
        .unwrap_or_default();
    logging::init_logging(&logging_config, &[]).context("failed to initialise logging")?;

    let cli = Cli::parse();
    let workspace = match cli.workspace {
        Some(w) => w,
        None => workspace_root()?,
    };
    let layout = Layout {
        engine_dir: cli
            .engine_dir
            .unwrap_or_else(|| workspace.join("engine-binaries")),
        dist_dir: cli.dist_dir.unwrap_or_else(|| workspace.join("dist")),
        workspace,
    };
    let target = Target {
        os: cli.os,
        arch: cli.arch,
    };

    let mut report = Report::default();

    if cli.skip_build {
        info!("Skipping cargo build");
    } else {
        let ok = cargo_build(&layout.workspace).await?;
        report.record("build", ok, "cargo build --release");
        if !ok {
            report.print();
            bail!("release build failed");
        }
    }

    let cli_binary = layout
        .workspace
        .join("target")
        .join("release")
        .join(executable_name(CLI_PACKAGE, &target.os));
    let manifest = assemble(&layout, &target, &cli_binary, &mut report)?;

    report.print();
    if report.failed() {
        bail!("packaging finished with errors");
    }
    info!(
        "{} {} packaged into {}",
        PRODUCT_NAME,
        manifest.product_version,
        manifest.directory.display()
    );
    Ok(())
}

// ===========================================================================
// Layout and naming
// ===========================================================================

struct Layout {
    workspace: PathBuf,
    engine_dir: PathBuf,
    dist_dir: PathBuf,
}

struct Target {
    os: String,
    arch: String,
}

impl Target {
    fn dir_name(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }
}

fn workspace_root() -> Result<PathBuf> {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    Path::new(manifest_dir)
        .ancestors()
        .nth(2)
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("Unable to determine workspace root"))
}

fn executable_name(stem: &str, os: &str) -> String {
    if os == "windows" {
        format!("{}.exe", stem)
    } else {
        stem.to_string()
    }
}

/// Four-part product version: pre-release and build suffixes dropped,
/// missing components filled with zeros.
fn product_version(version: &str) -> String {
    let core = version
        .split(['-', '+'])
        .next()
        .unwrap_or_default()
        .trim();
    let mut parts: Vec<&str> = core.split('.').filter(|p| !p.is_empty()).take(4).collect();
    while parts.len() < 4 {
        parts.push("0");
    }
    parts.join(".")
}

/// The dist config to ship and whether it makes this a private build.
fn dist_config(dist_dir: &Path) -> (PathBuf, bool) {
    let private = dist_dir.join(format!("{}{}", PRIVATE_PREFIX, DIST_CONFIG));
    if private.is_file() {
        warn!("Building with a private dist config file");
        (private, true)
    } else {
        info!("Building with default dist config file");
        (dist_dir.join(DIST_CONFIG), false)
    }
}

fn build_root(workspace: &Path, private: bool) -> PathBuf {
    workspace.join(if private { "BUILDS-PRIVATE" } else { "BUILDS" })
}

/// Engine binary for `target`: the plain engine name first, then any file
/// whose name starts with it (release archives carry version suffixes).
fn find_engine_binary(engine_dir: &Path, target: &Target) -> Option<PathBuf> {
    let dir = engine_dir.join(target.dir_name());
    let exact = dir.join(executable_name("restic", &target.os));
    if exact.is_file() {
        return Some(exact);
    }
    let mut candidates: Vec<PathBuf> = fs::read_dir(&dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("restic"))
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

// ===========================================================================
// Steps
// ===========================================================================

/// `cargo build --release -p snapctl`, forwarding output as it is produced.
async fn cargo_build(workspace: &Path) -> Result<bool> {
    let cargo = std::env::var("CARGO").unwrap_or_else(|_| "cargo".into());
    info!("Building {} release binary...", CLI_PACKAGE);
    let mut child = Command::new(&cargo)
        .args(["build", "--release", "-p", CLI_PACKAGE])
        .current_dir(workspace)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to start {}", cargo))?;

    let stdout = child.stdout.take().context("cargo stdout not captured")?;
    let stderr = child.stderr.take().context("cargo stderr not captured")?;
    let forward_err = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "cargo", "{}", line);
        }
    });
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await? {
        info!(target: "cargo", "{}", line);
    }
    let _ = forward_err.await;

    let status = child.wait().await.context("cargo did not finish")?;
    if !status.success() {
        error!("cargo exited with {}", status);
    }
    Ok(status.success())
}

#[derive(Debug, Serialize)]
struct Manifest {
    product: String,
    version: String,
    product_version: String,
    os: String,
    arch: String,
    private: bool,
    files: Vec<String>,
    #[serde(skip)]
    directory: PathBuf,
}

/// Copy every artifact into `BUILDS[-PRIVATE]/<os>-<arch>/` and write the
/// manifest. Missing optional inputs are recorded as failed steps rather
/// than aborting the run.
fn assemble(layout: &Layout, target: &Target, cli_binary: &Path, report: &mut Report) -> Result<Manifest> {
    let (dist_source, private) = dist_config(&layout.dist_dir);
    let out_dir = build_root(&layout.workspace, private).join(target.dir_name());
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let mut files = Vec::new();
    let mut copy = |step: &str, from: &Path, name: &str, report: &mut Report| {
        match fs::copy(from, out_dir.join(name)) {
            Ok(_) => {
                files.push(name.to_string());
                report.record(step, true, &from.display().to_string());
            }
            Err(e) => report.record(step, false, &format!("{}: {}", from.display(), e)),
        }
    };

    copy("cli binary", cli_binary, &executable_name(CLI_PACKAGE, &target.os), &mut *report);

    match find_engine_binary(&layout.engine_dir, target) {
        Some(engine) => copy("engine binary", &engine, &executable_name("restic", &target.os), &mut *report),
        None => report.record(
            "engine binary",
            false,
            &format!("none in {}", layout.engine_dir.join(target.dir_name()).display()),
        ),
    }

    copy("license", &layout.workspace.join(LICENSE_FILE), LICENSE_FILE, &mut *report);

    let dist_name = dist_source
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DIST_CONFIG)
        .replace(PRIVATE_PREFIX, "");
    copy("dist config", &dist_source, &dist_name, &mut *report);

    let excludes = layout.workspace.join(EXCLUDES_DIR);
    match copy_dir(&excludes, &out_dir.join(EXCLUDES_DIR)) {
        Ok(n) => {
            files.push(EXCLUDES_DIR.to_string());
            report.record("excludes", true, &format!("{} files", n));
        }
        Err(e) => report.record("excludes", false, &format!("{}: {}", excludes.display(), e)),
    }

    let version = env!("CARGO_PKG_VERSION").to_string();
    let manifest = Manifest {
        product: PRODUCT_NAME.to_string(),
        product_version: product_version(&version),
        version,
        os: target.os.clone(),
        arch: target.arch.clone(),
        private,
        files,
        directory: out_dir.clone(),
    };
    let json = serde_json::to_string_pretty(&manifest)?;
    let manifest_path = out_dir.join("manifest.json");
    match fs::write(&manifest_path, json) {
        Ok(()) => report.record("manifest", true, &manifest_path.display().to_string()),
        Err(e) => report.record("manifest", false, &e.to_string()),
    }
    Ok(manifest)
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<usize> {
    fs::create_dir_all(to)?;
    let mut copied = 0;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_dir(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), dest)?;
            copied += 1;
        }
    }
    Ok(copied)
}

// ===========================================================================
// Report
// ===========================================================================

#[derive(Default)]
struct Report {
    steps: Vec<(String, bool, String)>,
}

impl Report {
    fn record(&mut self, step: &str, ok: bool, detail: &str) {
        if ok {
            info!(step, "{}", detail);
        } else {
            error!(step, "{}", detail);
        }
        self.steps.push((step.to_string(), ok, detail.to_string()));
    }

    fn failed(&self) -> bool {
        self.steps.iter().any(|(_, ok, _)| !ok)
    }

    fn print(&self) {
        for (step, ok, detail) in &self.steps {
            println!("[{}] {}: {}", if *ok { "OK" } else { "FAIL" }, step, detail);
        }
    }
}
