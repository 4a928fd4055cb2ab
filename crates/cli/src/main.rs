//! `snapctl` – command-line front-end for the SnapDesk backup client.
//!
//! Every engine action is submitted to the task runner and polled from the
//! main task, the same way a windowed front-end keeps its event loop alive
//! while a backup runs.

mod serve;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engine::platform::ENGINE_BINARY_NAME;
use engine::types::*;
use engine::view::snapshot_id_from_label;
use engine::{Action, AppContext, CommandRegistry, CommandResult, TaskRunner};
use serde_json::Value;
use snapctl_lib::config::{load_config, FrontendConfig};
use snapctl_lib::logging::init_logging;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ===========================================================================
// CLI definition
// ===========================================================================

#[derive(Parser)]
#[command(
    name = "snapctl",
    version,
    about = "Command-line client for SnapDesk backups"
)]
struct Cli {
    /// Configuration file layered over the bundled defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Run backups with --dry-run.
    #[arg(long, global = true)]
    dry_run: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List snapshots, newest first.
    Snapshots {
        #[arg(long)]
        json: bool,
    },

    /// Report whether a recent snapshot exists.
    State {
        #[arg(long)]
        json: bool,
    },

    /// Show the content tree of a snapshot.
    Browse {
        /// Snapshot id, or a row label as printed by `snapshots`.
        snapshot: String,
        #[arg(long)]
        json: bool,
    },

    /// Run a backup of the configured paths.
    Backup {
        /// Back up even when a recent snapshot exists.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        json: bool,
    },

    /// Restore a snapshot into a directory.
    Restore {
        snapshot: String,
        #[arg(long)]
        target: PathBuf,
        /// Only restore matching paths. Repeatable.
        #[arg(long = "include")]
        includes: Vec<String>,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        json: bool,
    },

    /// Find a path across all snapshots.
    Find {
        path: String,
        #[arg(long)]
        json: bool,
    },

    /// Remove a snapshot.
    Forget {
        snapshot: String,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        json: bool,
    },

    /// Pass a raw command line to the backup engine.
    Raw {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
        #[arg(long)]
        json: bool,
    },

    /// Check that the backup engine binary can be found.
    CheckBinary {
        #[arg(long)]
        json: bool,
    },

    /// Run an action descriptor given as JSON, e.g. '{"action":"list"}'.
    Call {
        descriptor: String,
        #[arg(long)]
        json: bool,
        /// Skip the confirmation prompt for restore and forget.
        #[arg(long)]
        yes: bool,
        /// Directory for artifacts output.
        #[arg(long)]
        artifacts: Option<PathBuf>,
    },

    /// Run a scripted scenario from a YAML file.
    RunScenario {
        /// Path to the scenario YAML file.
        file: PathBuf,
        /// Directory for artifacts output.
        #[arg(long)]
        artifacts: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },

    /// Collect engine and environment facts.
    Doctor {
        #[arg(long)]
        json: bool,
        /// Write result JSON to this path.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Print the effective configuration without secrets.
    Config,

    /// Start daemon mode over a Unix socket.
    Serve {
        /// Path for the Unix domain socket.
        #[arg(long)]
        socket: PathBuf,
    },
}

// ===========================================================================
// Main
// ===========================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    init_logging(&config.logging, &config.secrets()).context("failed to initialise logging")?;

    let ctx = Arc::new(AppContext::default_platform(config.engine()).with_dry_run(cli.dry_run));
    let session = Session {
        ctx,
        registry: CommandRegistry::new(),
        runner: TaskRunner::current().context("no tokio runtime")?,
        poll: Duration::from_millis(config.ui.poll_interval_ms.max(1)),
    };

    let code = match cli.command {
        Commands::Snapshots { json } => session.run_action(Action::List, json).await,
        Commands::State { json } => session.run_action(Action::HasRecentSnapshots, json).await,
        Commands::Browse { snapshot, json } => {
            let snapshot = snapshot_id_from_label(&snapshot)
                .unwrap_or(&snapshot)
                .to_string();
            session.run_action(Action::Ls { snapshot }, json).await
        }
        Commands::Backup { force, json } => session.run_action(Action::Backup { force }, json).await,
        Commands::Restore {
            snapshot,
            target,
            includes,
            yes,
            json,
        } => {
            let action = Action::Restore {
                snapshot,
                target,
                includes,
            };
            session.run_confirmed(action, yes, json).await?
        }
        Commands::Find { path, json } => session.run_action(Action::Find { path }, json).await,
        Commands::Forget {
            snapshot,
            yes,
            json,
        } => {
            session
                .run_confirmed(Action::Forget { snapshot }, yes, json)
                .await?
        }
        Commands::Raw { command, json } => {
            let action = Action::Raw {
                command: command.join(" "),
            };
            session.run_action(action, json).await
        }
        Commands::CheckBinary { json } => session.run_action(Action::CheckBinary, json).await,
        Commands::Call {
            descriptor,
            json,
            yes,
            artifacts,
        } => session.cmd_call(&descriptor, json, yes, artifacts).await?,
        Commands::RunScenario {
            file,
            artifacts,
            json,
        } => session.cmd_run_scenario(&file, json, artifacts).await,
        Commands::Doctor { json, out } => session.cmd_doctor(json, out).await?,
        Commands::Config => {
            let view = FrontendConfig::from(&config);
            println!("{}", serde_json::to_string_pretty(&view)?);
            0
        }
        Commands::Serve { socket } => {
            serve::run_daemon(socket, session.ctx, session.registry, session.runner, session.poll)
                .await?;
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

// ===========================================================================
// Session: the coordinating side of every subcommand
// ===========================================================================

struct Session {
    ctx: Arc<AppContext>,
    registry: CommandRegistry,
    runner: TaskRunner,
    poll: Duration,
}

impl Session {
    /// Preflight, submit, poll until done, render. Returns the exit code.
    async fn run_action(&self, action: Action, json: bool) -> i32 {
        if let Some(r) = preflight(&self.ctx, &action) {
            return output_result(&r, json);
        }
        let descriptor = match serde_json::to_value(&action) {
            Ok(v) => v,
            Err(e) => {
                let r = result_err(
                    "call",
                    action.name(),
                    &new_run_id(),
                    0,
                    ErrorCode::InternalError,
                    e.to_string(),
                );
                return output_result(&r, json);
            }
        };
        let result = self.drive(descriptor, json).await;
        output_result(&result, json)
    }

    /// Destructive actions need an explicit yes, either `--yes` or an
    /// interactive prompt. Without a terminal the action is refused.
    async fn run_confirmed(&self, action: Action, yes: bool, json: bool) -> Result<i32> {
        if let Some(r) = confirm_destructive(&action, yes)? {
            return Ok(output_result(&r, json));
        }
        Ok(self.run_action(action, json).await)
    }

    /// Submit `descriptor` and poll its handle, printing engine lines as they
    /// arrive. Lines go to stderr in JSON mode so stdout stays one document.
    async fn drive(&self, descriptor: Value, json: bool) -> CommandResult {
        let handle = self
            .registry
            .submit(&self.runner, descriptor, Arc::clone(&self.ctx));
        let label = handle.label().to_string();
        let mut busy = BusyIndicator::new(&label);
        let mut output = Vec::new();

        loop {
            // Read the flag first: once it is set every line is already queued.
            let done = handle.is_done();
            for line in handle.drain_output() {
                busy.clear();
                if json {
                    eprintln!("{}", line);
                } else {
                    println!("{}", line);
                }
                output.push(line);
            }
            if done {
                break;
            }
            busy.tick();
            tokio::time::sleep(self.poll).await;
        }
        busy.clear();

        let mut result = match handle.into_result() {
            Ok(r) => r,
            Err(e) => result_err(
                "call",
                e.action(),
                &new_run_id(),
                0,
                ErrorCode::InternalError,
                e.to_string(),
            ),
        };
        result.output = output;
        result
    }

    async fn cmd_call(
        &self,
        descriptor: &str,
        json: bool,
        yes: bool,
        artifacts: Option<PathBuf>,
    ) -> Result<i32> {
        let value: Value = match serde_json::from_str(descriptor) {
            Ok(v) => v,
            Err(e) => {
                let r = result_err(
                    "call",
                    "unknown",
                    &new_run_id(),
                    0,
                    ErrorCode::InvalidInput,
                    format!("invalid JSON descriptor: {}", e),
                );
                return Ok(output_result(&r, json));
            }
        };

        // Malformed descriptors go through anyway so the registry reports them.
        let gate = match Action::from_json(value.clone()) {
            Ok(action) => match confirm_destructive(&action, yes)? {
                Some(r) => Some(r),
                None => preflight(&self.ctx, &action),
            },
            Err(_) => None,
        };
        let result = match gate {
            Some(r) => r,
            None => self.drive(value, json).await,
        };
        if let Some(ref dir) = artifacts {
            write_artifacts(dir, &result);
        }
        Ok(output_result(&result, json))
    }

    async fn cmd_run_scenario(&self, file: &Path, json: bool, artifacts: Option<PathBuf>) -> i32 {
        let yaml = match std::fs::read_to_string(file) {
            Ok(s) => s,
            Err(e) => {
                let r = result_err(
                    "run-scenario",
                    &file.display().to_string(),
                    &new_run_id(),
                    0,
                    ErrorCode::IoError,
                    format!("cannot read scenario file: {}", e),
                );
                return output_result(&r, json);
            }
        };

        let scenario = match engine::scenario::load_scenario(&yaml) {
            Ok(s) => s,
            Err(e) => {
                let r = result_err(
                    "run-scenario",
                    &file.display().to_string(),
                    &new_run_id(),
                    0,
                    ErrorCode::InvalidInput,
                    e,
                );
                return output_result(&r, json);
            }
        };

        let scenario_result = engine::scenario::run_scenario(
            &scenario,
            Arc::clone(&self.ctx),
            &self.registry,
            &self.runner,
            self.poll,
        )
        .await;

        if json {
            let j = serde_json::to_string_pretty(&scenario_result).unwrap_or_default();
            println!("{}", j);
        } else {
            println!(
                "Scenario: {}",
                scenario_result.name.as_deref().unwrap_or("<unnamed>")
            );
            println!("Overall: {}", scenario_result.overall_status.as_str());
            for (i, sr) in scenario_result.step_results.iter().enumerate() {
                println!(
                    "  Step {}: {} -> {} ({}ms)",
                    i,
                    sr.target,
                    sr.status.as_str(),
                    sr.timing_ms.total
                );
                if let Some(ref err) = sr.error {
                    println!("    {}: {}", err.code, err.message);
                }
            }
        }

        if let Some(ref dir) = artifacts {
            let art_dir = dir.join(new_run_id());
            if let Err(e) = std::fs::create_dir_all(&art_dir) {
                eprintln!(
                    "warning: failed to create artifacts dir {}: {}",
                    art_dir.display(),
                    e
                );
            } else {
                let j = serde_json::to_string_pretty(&scenario_result).unwrap_or_default();
                let _ = std::fs::write(art_dir.join("result.json"), j);

                let mut lines = String::new();
                for sr in &scenario_result.step_results {
                    if let Ok(line) = serde_json::to_string(sr) {
                        lines.push_str(&line);
                        lines.push('\n');
                    }
                }
                let _ = std::fs::write(art_dir.join("events.jsonl"), lines);
            }
        }

        scenario_result.overall_status.exit_code()
    }

    async fn cmd_doctor(&self, json: bool, out: Option<PathBuf>) -> Result<i32> {
        let ctx = Arc::clone(&self.ctx);
        let result = tokio::task::spawn_blocking(move || engine::doctor::run_doctor(&ctx))
            .await
            .context("doctor task failed")?;
        if let Some(ref path) = out {
            write_result_file(path, &result);
        }
        Ok(output_result(&result, json))
    }
}

/// Configuration and binary checks made before anything is submitted.
fn preflight(ctx: &AppContext, action: &Action) -> Option<CommandResult> {
    if matches!(action, Action::CheckBinary) {
        return None;
    }
    if action.needs_repository() && !ctx.config.repo.is_configured() {
        return Some(result_err(
            "call",
            action.name(),
            &new_run_id(),
            0,
            ErrorCode::NotConfigured,
            "repository or password not configured (set repo.repository and repo.password)",
        ));
    }
    if ctx.process().locate_binary(&ctx.config.binary).is_none() {
        return Some(result_err(
            "call",
            action.name(),
            &new_run_id(),
            0,
            ErrorCode::BinaryMissing,
            format!(
                "{} not found; install it or set binary.path",
                ENGINE_BINARY_NAME
            ),
        ));
    }
    None
}

/// Asks before restore and forget. Returns the result to report in place of
/// running when the user declines or no terminal is available to ask on.
fn confirm_destructive(action: &Action, yes: bool) -> Result<Option<CommandResult>> {
    if yes || !action.is_destructive() {
        return Ok(None);
    }
    if !std::io::stdin().is_terminal() {
        return Ok(Some(unconfirmed_result(action)));
    }
    let confirmed = dialoguer::Confirm::new()
        .with_prompt(confirmation_prompt(action))
        .default(false)
        .interact()
        .context("confirmation prompt failed")?;
    if confirmed {
        return Ok(None);
    }
    let mut r = result_skip("call", action.name(), &new_run_id(), 0, "declined by user");
    if let Some(err) = r.error.as_mut() {
        err.code = ErrorCode::Cancelled;
    }
    Ok(Some(r))
}

fn unconfirmed_result(action: &Action) -> CommandResult {
    result_err(
        "call",
        action.name(),
        &new_run_id(),
        0,
        ErrorCode::InvalidInput,
        format!("{} needs confirmation; pass --yes", action.name()),
    )
}

fn confirmation_prompt(action: &Action) -> String {
    match action {
        Action::Restore {
            snapshot, target, ..
        } => format!(
            "Restore snapshot {} into {}? Existing files may be overwritten",
            snapshot,
            target.display()
        ),
        Action::Forget { snapshot } => format!("Forget snapshot {}? This cannot be undone", snapshot),
        other => format!("Run {}?", other.name()),
    }
}

// ===========================================================================
// Busy indicator
// ===========================================================================

struct BusyIndicator {
    label: String,
    frame: usize,
    enabled: bool,
    drawn: bool,
    started: Instant,
}

impl BusyIndicator {
    const FRAMES: [char; 4] = ['|', '/', '-', '\\'];

    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            frame: 0,
            enabled: std::io::stderr().is_terminal(),
            drawn: false,
            started: Instant::now(),
        }
    }

    fn tick(&mut self) {
        if !self.enabled {
            return;
        }
        let mut err = std::io::stderr();
        let _ = write!(
            err,
            "\r{} {} ({}s)",
            Self::FRAMES[self.frame % Self::FRAMES.len()],
            self.label,
            self.started.elapsed().as_secs()
        );
        let _ = err.flush();
        self.frame += 1;
        self.drawn = true;
    }

    fn clear(&mut self) {
        if self.drawn {
            let mut err = std::io::stderr();
            let _ = write!(err, "\r\x1b[2K");
            let _ = err.flush();
            self.drawn = false;
        }
    }
}

// ===========================================================================
// Output helpers
// ===========================================================================

/// Print `result` and return the exit code its status maps to.
fn output_result(result: &CommandResult, json: bool) -> i32 {
    if json {
        let j = serde_json::to_string_pretty(result).unwrap_or_default();
        println!("{}", j);
    } else if !print_view(result) {
        print_human(result);
    }
    result.status.exit_code()
}

/// Action-specific rendering for successful results. Returns false when the
/// generic rendering should be used instead.
fn print_view(r: &CommandResult) -> bool {
    let Some(data) = r.data.as_ref().filter(|_| r.status == Status::Pass) else {
        return false;
    };
    match r.target.as_str() {
        "list" => {
            let rows = data["rows"].as_array().map(Vec::as_slice).unwrap_or(&[]);
            if rows.is_empty() {
                println!("No snapshots in repository");
            }
            for row in rows {
                println!("{}", row["label"].as_str().unwrap_or_default());
            }
            true
        }
        "has_recent_snapshots" => {
            println!(
                "[{}] {}",
                data["badge"].as_str().unwrap_or_default(),
                data["summary"].as_str().unwrap_or_default()
            );
            true
        }
        "ls" => {
            println!("{}", data["header"].as_str().unwrap_or_default());
            for entry in data["entries"].as_array().map(Vec::as_slice).unwrap_or(&[]) {
                let depth = entry["depth"].as_u64().unwrap_or(0) as usize;
                let name = entry["name"].as_str().unwrap_or_default();
                let suffix = if entry["type"] == "dir" { "/" } else { "" };
                println!(
                    "{}{}{}  {}  {}",
                    "  ".repeat(depth),
                    name,
                    suffix,
                    entry["size"].as_str().unwrap_or_default(),
                    entry["mtime"].as_str().unwrap_or_default()
                );
            }
            if let Some(skipped) = data["skipped"].as_u64().filter(|n| *n > 0) {
                println!("({} unreadable entries skipped)", skipped);
            }
            true
        }
        _ => false,
    }
}

fn print_human(r: &CommandResult) {
    println!("[{}] {} {}", r.status.as_str().to_uppercase(), r.command, r.target);
    println!("  run_id: {}", r.run_id);
    println!("  timing: {}ms", r.timing_ms.total);

    if let Some(ref err) = r.error {
        println!("  error:  {} – {}", err.code, err.message);
    }

    if let Some(ref data) = r.data {
        if let Ok(s) = serde_json::to_string_pretty(data) {
            for line in s.lines() {
                println!("  {}", line);
            }
        }
    }

    println!(
        "  env: os={} arch={} headless={}",
        r.env_summary.os, r.env_summary.arch, r.env_summary.headless
    );
}

// ===========================================================================
// Artifact helpers
// ===========================================================================

fn write_result_file(path: &Path, result: &CommandResult) {
    let j = serde_json::to_string_pretty(result).unwrap_or_default();
    if let Err(e) = std::fs::write(path, &j) {
        eprintln!(
            "warning: failed to write result to {}: {}",
            path.display(),
            e
        );
    }
}

fn write_artifacts(dir: &Path, result: &CommandResult) {
    let art_dir = dir.join(&result.run_id);
    if let Err(e) = std::fs::create_dir_all(&art_dir) {
        eprintln!(
            "warning: failed to create artifacts dir {}: {}",
            art_dir.display(),
            e
        );
        return;
    }

    let j = serde_json::to_string_pretty(result).unwrap_or_default();
    let _ = std::fs::write(art_dir.join("result.json"), &j);

    // Captured engine output, one line per event.
    let mut events = String::new();
    for line in &result.output {
        if let Ok(ev) = serde_json::to_string(&serde_json::json!({ "output": line })) {
            events.push_str(&ev);
            events.push('\n');
        }
    }
    if let Ok(line) = serde_json::to_string(result) {
        events.push_str(&line);
        events.push('\n');
    }
    let _ = std::fs::write(art_dir.join("events.jsonl"), events);
}
