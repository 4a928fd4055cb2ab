//! Command registry: action descriptors in, `CommandResult` JSON out.
//!
//! Handlers are registered under their action tag and receive the parsed
//! [`Action`], the context and the output sink engine lines are streamed to.

use crate::action::{Action, ActionOutcome};
use crate::adapter::{AdapterError, ResticAdapter};
use crate::context::AppContext;
use crate::snapshot::Freshness;
use crate::tasks::{OutputSink, TaskContext, TaskHandle, TaskRunner};
use crate::tree::SnapshotTree;
use crate::types::*;
use crate::view::{listing_header, snapshot_rows, state_summary, StateBadge};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Signature for all engine commands.
pub type CommandHandler = fn(&Action, &AppContext, &OutputSink) -> Result<Value, CommandError>;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("repository is not configured")]
    NotConfigured,
    #[error("backup engine binary not found")]
    BinaryMissing,
    /// The engine ran and reported failure.
    #[error("{0}")]
    EngineFailed(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl CommandError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CommandError::InvalidInput(_) => ErrorCode::InvalidInput,
            CommandError::NotConfigured => ErrorCode::NotConfigured,
            CommandError::BinaryMissing => ErrorCode::BinaryMissing,
            CommandError::EngineFailed(_) => ErrorCode::EngineFailed,
            CommandError::Io(_) => ErrorCode::IoError,
            CommandError::Other(_) => ErrorCode::InternalError,
        }
    }
}

impl From<AdapterError> for CommandError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::NotConfigured => CommandError::NotConfigured,
            AdapterError::BinaryMissing => CommandError::BinaryMissing,
            AdapterError::InvalidAction(m) => CommandError::InvalidInput(m),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CommandRegistry {
    handlers: HashMap<String, CommandHandler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        let mut reg = Self {
            handlers: HashMap::new(),
        };
        reg.register("list", cmd_list);
        reg.register("ls", cmd_ls);
        reg.register("backup", cmd_success);
        reg.register("restore", cmd_success);
        reg.register("find", cmd_success);
        reg.register("forget", cmd_success);
        reg.register("raw", cmd_success);
        reg.register("has_recent_snapshots", cmd_state);
        reg.register("check-binary", cmd_check_binary);
        reg
    }

    pub fn register(&mut self, name: &str, handler: CommandHandler) {
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    /// Parse `descriptor`, run its handler and wrap the outcome.
    pub fn execute(&self, descriptor: Value, ctx: &AppContext, sink: &OutputSink) -> CommandResult {
        let run_id = new_run_id();
        let start = Instant::now();
        let elapsed = || start.elapsed().as_millis() as u64;
        let target = descriptor_label(&descriptor);

        let action = match Action::from_json(descriptor) {
            Ok(a) => a,
            Err(e) => {
                return result_err(
                    "call",
                    &target,
                    &run_id,
                    elapsed(),
                    ErrorCode::InvalidInput,
                    format!("bad action descriptor: {}", e),
                );
            }
        };

        let handler = match self.handlers.get(action.name()) {
            Some(h) => h,
            None => {
                return result_err(
                    "call",
                    &target,
                    &run_id,
                    elapsed(),
                    ErrorCode::InvalidInput,
                    format!("unknown command: {}", action.name()),
                );
            }
        };

        match handler(&action, ctx, sink) {
            Ok(data) => {
                let mut r = result_ok("call", &target, &run_id, elapsed());
                r.data = Some(data);
                r
            }
            Err(CommandError::EngineFailed(m)) => result_fail("call", &target, &run_id, elapsed(), m),
            Err(e) => result_err("call", &target, &run_id, elapsed(), e.error_code(), e.to_string()),
        }
    }

    /// Run `descriptor` on a task-runner worker. Streamed engine lines go to
    /// the handle's output channel.
    pub fn submit(
        &self,
        runner: &TaskRunner,
        descriptor: Value,
        ctx: Arc<AppContext>,
    ) -> TaskHandle<CommandResult> {
        let registry = self.clone();
        let label = descriptor_label(&descriptor);
        runner.submit_with(label, move |task: &TaskContext| {
            Ok::<_, std::convert::Infallible>(registry.execute(descriptor, &ctx, &task.output))
        })
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn descriptor_label(descriptor: &Value) -> String {
    descriptor
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

// ===========================================================================
// Handlers
// ===========================================================================

fn adapter<'a>(ctx: &'a AppContext, sink: &OutputSink) -> ResticAdapter<'a> {
    ResticAdapter::new(ctx).with_output(sink.clone())
}

/// `list` – engine-order snapshots plus newest-first display rows.
fn cmd_list(action: &Action, ctx: &AppContext, sink: &OutputSink) -> Result<Value, CommandError> {
    match adapter(ctx, sink).run(action)? {
        ActionOutcome::Snapshots(Some(list)) => Ok(json!({
            "rows": snapshot_rows(&list),
            "snapshots": list,
        })),
        ActionOutcome::Snapshots(None) => Err(CommandError::EngineFailed(
            "cannot list snapshots".into(),
        )),
        other => Err(unexpected(other)),
    }
}

/// `ls` – the listing is consumed here into a browse tree.
fn cmd_ls(action: &Action, ctx: &AppContext, sink: &OutputSink) -> Result<Value, CommandError> {
    match adapter(ctx, sink).run(action)? {
        ActionOutcome::Listing(Some(listing)) => {
            let header = listing_header(&listing.snapshot);
            let mut nodes = listing.nodes;
            let tree = SnapshotTree::from_nodes(nodes.by_ref());
            let entries: Vec<Value> = tree
                .walk()
                .into_iter()
                .map(|(depth, e)| {
                    json!({
                        "depth": depth,
                        "key": e.key,
                        "name": e.name,
                        "type": e.node_type,
                        "size": e.size,
                        "mtime": e.mtime,
                    })
                })
                .collect();
            Ok(json!({
                "header": header,
                "snapshot": listing.snapshot,
                "entries": entries,
                "skipped": nodes.skipped(),
            }))
        }
        ActionOutcome::Listing(None) => Err(CommandError::EngineFailed(
            "cannot list snapshot content".into(),
        )),
        other => Err(unexpected(other)),
    }
}

/// Actions whose result is a plain success flag.
fn cmd_success(action: &Action, ctx: &AppContext, sink: &OutputSink) -> Result<Value, CommandError> {
    let outcome = adapter(ctx, sink).run(action)?;
    match outcome {
        ActionOutcome::Success(_) if outcome.is_success() => Ok(json!({ "success": true })),
        ActionOutcome::Success(_) => Err(CommandError::EngineFailed(format!(
            "{} failed",
            action.name()
        ))),
        other => Err(unexpected(other)),
    }
}

/// `has_recent_snapshots` – all three states are reported as data.
fn cmd_state(action: &Action, ctx: &AppContext, sink: &OutputSink) -> Result<Value, CommandError> {
    match adapter(ctx, sink).run(action)? {
        ActionOutcome::Freshness(f) => Ok(json!({
            "freshness": f,
            "recent": f.as_option(),
            "badge": StateBadge::from(f),
            "color": StateBadge::from(f).color(),
            "summary": state_summary(&f),
            "connected": !matches!(f, Freshness::Unreachable),
        })),
        other => Err(unexpected(other)),
    }
}

fn cmd_check_binary(action: &Action, ctx: &AppContext, sink: &OutputSink) -> Result<Value, CommandError> {
    match adapter(ctx, sink).run(action)? {
        ActionOutcome::BinaryPresent(true) => Ok(json!({
            "present": true,
            "path": ctx
                .process()
                .locate_binary(&ctx.config.binary)
                .map(|p| p.display().to_string()),
        })),
        ActionOutcome::BinaryPresent(false) => Err(CommandError::BinaryMissing),
        other => Err(unexpected(other)),
    }
}

fn unexpected(outcome: ActionOutcome) -> CommandError {
    CommandError::Other(format!("unexpected adapter outcome: {:?}", outcome))
}

// ===========================================================================
// Tests
// ===========================================================================
