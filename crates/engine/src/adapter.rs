//! External engine adapter.
//!
//! Turns an [`Action`] into an engine command line, runs it through the
//! context's [`ProcessOps`](crate::traits::ProcessOps) and parses the output.
//! Failures the engine reports (non-zero exit, garbage on stdout) come back
//! as falsy outcomes; only a missing binary, a missing repository and a bad
//! descriptor are errors.

use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::action::{Action, ActionOutcome};
use crate::context::AppContext;
use crate::hooks::run_hook;
use crate::metrics::write_metrics;
use crate::repo::BackendKind;
use crate::snapshot::{parse_snapshots, Freshness, Snapshot, SnapshotListing};
use crate::tasks::OutputSink;
use crate::traits::{CapError, Invocation, ProcessOutput};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("repository is not configured")]
    NotConfigured,
    #[error("backup engine binary not found")]
    BinaryMissing,
    #[error("invalid action: {0}")]
    InvalidAction(String),
}

pub struct ResticAdapter<'a> {
    ctx: &'a AppContext,
    output: OutputSink,
}

impl<'a> ResticAdapter<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self {
            ctx,
            output: OutputSink::detached(),
        }
    }

    /// Forward engine output lines to `sink` while commands run.
    pub fn with_output(mut self, sink: OutputSink) -> Self {
        self.output = sink;
        self
    }

    /// Dispatch one descriptor and log how long it took.
    pub fn run(&self, action: &Action) -> Result<ActionOutcome, AdapterError> {
        let start = Instant::now();
        let outcome = self.dispatch(action);
        tracing::info!(
            action = action.name(),
            ok = outcome.as_ref().is_ok_and(ActionOutcome::is_success),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "runner took {:.2} seconds",
            start.elapsed().as_secs_f64()
        );
        outcome
    }

    fn dispatch(&self, action: &Action) -> Result<ActionOutcome, AdapterError> {
        match action {
            Action::CheckBinary => Ok(ActionOutcome::BinaryPresent(self.binary_present())),
            Action::List => self.snapshots().map(ActionOutcome::Snapshots),
            Action::Ls { snapshot } => self.ls(snapshot).map(ActionOutcome::Listing),
            Action::HasRecentSnapshots => self.freshness().map(ActionOutcome::Freshness),
            Action::Backup { force } => self.backup(*force).map(ActionOutcome::Success),
            Action::Restore {
                snapshot,
                target,
                includes,
            } => self
                .restore(snapshot, target, includes)
                .map(ActionOutcome::Success),
            Action::Find { path } => self.find(path).map(ActionOutcome::Success),
            Action::Forget { snapshot } => self.forget(snapshot).map(ActionOutcome::Success),
            Action::Raw { command } => self.raw(command).map(ActionOutcome::Success),
        }
    }

    // -----------------------------------------------------------------------
    // Invocation plumbing
    // -----------------------------------------------------------------------

    pub fn binary_present(&self) -> bool {
        self.ctx
            .process()
            .locate_binary(&self.ctx.config.binary)
            .is_some()
    }

    fn binary(&self) -> Result<PathBuf, AdapterError> {
        self.ctx
            .process()
            .locate_binary(&self.ctx.config.binary)
            .ok_or(AdapterError::BinaryMissing)
    }

    /// Program, credentials, extra env and bandwidth/connection options.
    fn command(&self, subcommand: &str) -> Result<Invocation, AdapterError> {
        let repo = &self.ctx.config.repo;
        if !repo.is_configured() {
            return Err(AdapterError::NotConfigured);
        }
        let (Some(repository), Some(password)) = (&repo.repository, &repo.password) else {
            return Err(AdapterError::NotConfigured);
        };
        let mut inv = Invocation::new(self.binary()?)
            .arg(subcommand)
            .env("RESTIC_REPOSITORY", repository.as_str())
            .env("RESTIC_PASSWORD", password.as_str());
        for (k, v) in self.ctx.config.env.expanded() {
            inv = inv.env(k, v);
        }
        if let Some(kib) = repo.upload_speed {
            inv = inv.arg("--limit-upload").arg(kib.to_string());
        }
        if let Some(kib) = repo.download_speed {
            inv = inv.arg("--limit-download").arg(kib.to_string());
        }
        if let Some(n) = repo.backend_connections {
            let prefix = BackendKind::from_uri(repository).option_prefix();
            inv = inv.arg("-o").arg(format!("{}.connections={}", prefix, n));
        }
        Ok(inv)
    }

    /// Run to completion. Spawn failures other than a vanished binary are
    /// logged and reported as `None`.
    fn exec(&self, inv: &Invocation, stream: bool) -> Result<Option<ProcessOutput>, AdapterError> {
        tracing::debug!(command = %inv.display(), "running engine");
        let result = if stream {
            let sink = &self.output;
            self.ctx
                .process()
                .run_streaming(inv, &mut |line| sink.send(line))
        } else {
            self.ctx.process().run(inv)
        };
        match result {
            Ok(out) => {
                if !out.success() {
                    tracing::warn!(
                        command = %inv.display(),
                        code = ?out.exit_code,
                        stderr = %out.stderr.trim(),
                        "engine exited with failure"
                    );
                }
                Ok(Some(out))
            }
            Err(CapError::DependencyMissing(_)) => Err(AdapterError::BinaryMissing),
            Err(e) => {
                tracing::error!(command = %inv.display(), error = %e, "cannot run engine");
                Ok(None)
            }
        }
    }

    fn streaming(&self) -> bool {
        self.output.is_attached()
    }

    /// Run a command whose only interesting result is its exit status.
    fn run_ok(&self, inv: Invocation) -> Result<bool, AdapterError> {
        let stream = self.streaming();
        let inv = if stream { inv.arg("--verbose") } else { inv };
        Ok(self.exec(&inv, stream)?.is_some_and(|o| o.success()))
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Snapshots in engine order (oldest first).
    pub fn snapshots(&self) -> Result<Option<Vec<Snapshot>>, AdapterError> {
        let inv = self.command("snapshots")?.arg("--json");
        Ok(self
            .exec(&inv, false)?
            .filter(ProcessOutput::success)
            .and_then(|o| parse_snapshots(&o.stdout)))
    }

    /// Header plus a lazy node stream straight from the engine's stdout.
    pub fn ls(&self, snapshot: &str) -> Result<Option<SnapshotListing>, AdapterError> {
        let snapshot = non_empty(snapshot, "ls needs a snapshot id")?;
        let inv = self.command("ls")?.arg("--json").arg(snapshot);
        tracing::debug!(command = %inv.display(), "listing snapshot");
        match self.ctx.process().spawn_lines(&inv) {
            Ok(lines) => Ok(SnapshotListing::from_lines(lines)),
            Err(CapError::DependencyMissing(_)) => Err(AdapterError::BinaryMissing),
            Err(e) => {
                tracing::error!(error = %e, "cannot list snapshot");
                Ok(None)
            }
        }
    }

    pub fn freshness(&self) -> Result<Freshness, AdapterError> {
        let max_age = self.ctx.config.repo.minimum_backup_age;
        tracing::info!(max_age_secs = max_age, "searching for a recent backup");
        let freshness = match self.snapshots()? {
            Some(list) => Freshness::evaluate(&list, chrono::Utc::now().fixed_offset(), max_age),
            None => Freshness::Unreachable,
        };
        match freshness {
            Freshness::Fresh(t) => tracing::info!(last_backup = %t, "most recent backup is recent enough"),
            Freshness::Stale => tracing::info!("no recent backup found"),
            Freshness::Unreachable => tracing::error!("cannot connect to repository"),
        }
        Ok(freshness)
    }

    pub fn is_initialized(&self) -> Result<bool, AdapterError> {
        let inv = self.command("cat")?.arg("config");
        Ok(self.exec(&inv, false)?.is_some_and(|o| o.success()))
    }

    pub fn init(&self) -> Result<bool, AdapterError> {
        tracing::info!("initializing repository");
        let inv = self.command("init")?;
        Ok(self.exec(&inv, false)?.is_some_and(|o| o.success()))
    }

    pub fn backup(&self, force: bool) -> Result<bool, AdapterError> {
        let cfg = &self.ctx.config.backup;
        if cfg.paths.is_empty() {
            // Still surface configuration problems first.
            self.command("backup")?;
            tracing::error!("no backup paths defined");
            return Ok(false);
        }

        if !self.is_initialized()? && !self.init()? {
            tracing::error!("repository could not be initialized");
            return Ok(false);
        }
        if matches!(self.freshness()?, Freshness::Fresh(_)) && !force {
            tracing::info!("no backup necessary");
            return Ok(true);
        }

        tracing::info!(paths = ?cfg.paths, "running backup");
        if !run_hook("pre-exec", &cfg.pre_exec) {
            return Ok(false);
        }

        let stream = self.streaming();
        let inv = self.backup_invocation(stream)?;
        let output = self.exec(&inv, stream)?;
        let ok = output.as_ref().is_some_and(|o| o.success());
        let text = output
            .map(|o| format!("{}\n{}", o.stdout, o.stderr))
            .unwrap_or_default();
        tracing::debug!(output = %text, "engine backup output");

        if let Err(e) = write_metrics(&self.ctx.config.metrics, self.ctx.metrics(), ok, &text) {
            tracing::error!(error = %e, "cannot write metrics");
        }

        if !run_hook("post-exec", &cfg.post_exec) {
            return Ok(false);
        }
        Ok(ok)
    }

    fn backup_invocation(&self, stream: bool) -> Result<Invocation, AdapterError> {
        let cfg = &self.ctx.config.backup;
        let mut inv = self
            .command("backup")?
            .args(cfg.paths.iter().map(|p| p.display().to_string()));

        let (exclude, exclude_file) = if cfg.exclude_case_ignore {
            ("--iexclude", "--iexclude-file")
        } else {
            ("--exclude", "--exclude-file")
        };
        for pattern in cfg.exclude_patterns.iter().filter(|p| !p.trim().is_empty()) {
            inv = inv.arg(exclude).arg(pattern.as_str());
        }
        for file in &cfg.exclude_files {
            inv = inv.arg(exclude_file).arg(file.display().to_string());
        }
        if cfg.exclude_caches {
            inv = inv.arg("--exclude-caches");
        }
        if cfg.one_file_system && !cfg!(windows) {
            inv = inv.arg("--one-file-system");
        }
        if cfg.use_fs_snapshot && cfg!(windows) {
            inv = inv.arg("--use-fs-snapshot");
        }
        for tag in cfg.tags.iter().filter(|t| !t.trim().is_empty()) {
            inv = inv.arg("--tag").arg(tag.as_str());
        }
        if let Some(extra) = &cfg.additional_parameters {
            inv = inv.args(extra.split_whitespace());
        }
        if stream {
            inv = inv.arg("--verbose");
        }
        if self.ctx.dry_run {
            inv = inv.arg("--dry-run");
        }
        Ok(inv)
    }

    pub fn restore(
        &self,
        snapshot: &str,
        target: &Path,
        includes: &[String],
    ) -> Result<bool, AdapterError> {
        let snapshot = non_empty(snapshot, "restore needs a snapshot id")?;
        if target.as_os_str().is_empty() {
            return Err(AdapterError::InvalidAction("restore needs a target".into()));
        }
        tracing::info!(target = %target.display(), "launching restore");
        let mut inv = self
            .command("restore")?
            .arg(snapshot)
            .arg("--target")
            .arg(target.display().to_string());
        for include in includes.iter().filter(|i| !i.is_empty()) {
            inv = inv.arg("--include").arg(include.as_str());
        }
        self.run_ok(inv)
    }

    /// Streams matching paths to the output sink.
    pub fn find(&self, path: &str) -> Result<bool, AdapterError> {
        let path = non_empty(path, "find needs a path")?;
        tracing::info!(path, "searching snapshots");
        let inv = self.command("find")?.arg(path);
        self.run_ok(inv)
    }

    pub fn forget(&self, snapshot: &str) -> Result<bool, AdapterError> {
        let snapshot = non_empty(snapshot, "forget needs a snapshot id")?;
        tracing::info!(snapshot, "forgetting snapshot");
        let inv = self.command("forget")?.arg(snapshot);
        self.run_ok(inv)
    }

    /// Run an arbitrary engine command line, split on whitespace.
    pub fn raw(&self, command: &str) -> Result<bool, AdapterError> {
        let mut words = command.split_whitespace();
        let sub = words
            .next()
            .ok_or_else(|| AdapterError::InvalidAction("raw needs a command".into()))?;
        tracing::info!(command, "running raw command");
        let inv = self.command(sub)?.args(words);
        let stream = self.streaming();
        Ok(self.exec(&inv, stream)?.is_some_and(|o| o.success()))
    }
}

fn non_empty<'s>(value: &'s str, message: &str) -> Result<&'s str, AdapterError> {
    let v = value.trim();
    if v.is_empty() {
        Err(AdapterError::InvalidAction(message.to_string()))
    } else {
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    const LS: &str = r#"{"time":"2023-01-03T00:16:13+01:00","hostname":"ws01","id":"a2103ca811e8","short_id":"a2103ca8","struct_type":"snapshot"}
{"name":"b.txt","type":"file","path":"/a/b.txt","size":3,"struct_type":"node"}
{"name":"a","type":"dir","path":"/a","struct_type":"node"}"#;

    #[test]
    fn test_check_binary_needs_no_repository() {
        let fake = FakeProcess::without_binary();
        let ctx = context(&fake, Default::default());
        let out = ResticAdapter::new(&ctx).run(&Action::CheckBinary).unwrap();
        assert!(matches!(out, ActionOutcome::BinaryPresent(false)));
        assert!(fake.subcommands().is_empty());
    }

    #[test]
    fn test_not_configured_and_binary_missing_are_errors() {
        let fake = FakeProcess::new();
        let ctx = context(&fake, Default::default());
        assert_eq!(
            ResticAdapter::new(&ctx).run(&Action::List).unwrap_err(),
            AdapterError::NotConfigured
        );

        let fake = FakeProcess::without_binary();
        let ctx = context(&fake, configured());
        assert_eq!(
            ResticAdapter::new(&ctx).run(&Action::List).unwrap_err(),
            AdapterError::BinaryMissing
        );
        assert!(fake.subcommands().is_empty());
    }

    #[test]
    fn test_list_passes_credentials_through_env() {
        let fake = FakeProcess::new().respond("snapshots", 0, &snapshots_json(60));
        let mut cfg = configured();
        cfg.repo.upload_speed = Some(500);
        cfg.repo.backend_connections = Some(4);
        cfg.env.variables = vec!["AWS_REGION=eu-west-1".into()];
        let ctx = context(&fake, cfg);

        let out = ResticAdapter::new(&ctx).snapshots().unwrap().unwrap();
        assert_eq!(out.len(), 1);

        let inv = fake.last_call("snapshots").unwrap();
        assert_eq!(
            inv.args,
            vec!["snapshots", "--limit-upload", "500", "-o", "rest.connections=4", "--json"]
        );
        assert_eq!(inv.env["RESTIC_PASSWORD"], "hunter2");
        assert_eq!(inv.env["AWS_REGION"], "eu-west-1");
        assert!(!inv.display().contains("hunter2"));
    }

    #[test]
    fn test_engine_failures_are_falsy() {
        let fake = FakeProcess::new().respond("snapshots", 0, "Fatal: wrong password");
        let ctx = context(&fake, configured());
        assert_eq!(ResticAdapter::new(&ctx).snapshots().unwrap(), None);

        let fake = FakeProcess::new().respond("snapshots", 1, "[]");
        let ctx = context(&fake, configured());
        assert_eq!(ResticAdapter::new(&ctx).snapshots().unwrap(), None);
    }

    #[test]
    fn test_freshness_has_three_outcomes() {
        let fresh = FakeProcess::new().respond("snapshots", 0, &snapshots_json(60));
        let stale = FakeProcess::new().respond("snapshots", 0, &snapshots_json(10 * 86_400));
        let unreachable = FakeProcess::new().respond("snapshots", 1, "");

        let results: Vec<Freshness> = [fresh, stale, unreachable]
            .iter()
            .map(|f| {
                let ctx = context(f, configured());
                ResticAdapter::new(&ctx).freshness().unwrap()
            })
            .collect();

        assert!(matches!(results[0], Freshness::Fresh(_)));
        assert_eq!(results[1], Freshness::Stale);
        assert_eq!(results[2], Freshness::Unreachable);
        let tri: Vec<Option<bool>> = results.iter().map(Freshness::as_option).collect();
        assert_eq!(tri, vec![Some(true), Some(false), None]);
    }

    #[test]
    fn test_ls_streams_nodes() {
        let fake = FakeProcess::new().respond("ls", 0, LS);
        let ctx = context(&fake, configured());
        let listing = ResticAdapter::new(&ctx).ls("a2103ca8").unwrap().unwrap();
        assert_eq!(listing.snapshot.short_id(), "a2103ca8");
        let paths: Vec<String> = listing.nodes.map(|n| n.path).collect();
        assert_eq!(paths, vec!["/a/b.txt", "/a"]);
        assert_eq!(
            fake.last_call("ls").unwrap().args,
            vec!["ls", "--json", "a2103ca8"]
        );
    }

    #[test]
    fn test_backup_initializes_and_streams() {
        let fake = FakeProcess::new()
            .respond("cat", 1, "")
            .respond("init", 0, "created restic repository")
            .respond("snapshots", 0, "[]")
            .respond("backup", 0, "open repository\nprocessed 3 files\nsnapshot 1 saved");
        let mut cfg = configured();
        cfg.backup.exclude_patterns = vec!["*.tmp".into()];
        cfg.backup.exclude_case_ignore = true;
        cfg.backup.tags = vec!["nightly".into()];
        cfg.backup.additional_parameters = Some("--no-scan  --read-concurrency 4".into());
        let ctx = context(&fake, cfg).with_dry_run(true);

        let (sink, mut rx) = OutputSink::channel();
        let ok = ResticAdapter::new(&ctx).with_output(sink).backup(false).unwrap();
        assert!(ok);
        assert_eq!(fake.subcommands(), vec!["cat", "init", "snapshots", "backup"]);

        let mut lines = Vec::new();
        while let Ok(l) = rx.try_recv() {
            lines.push(l);
        }
        assert_eq!(lines, vec!["open repository", "processed 3 files", "snapshot 1 saved"]);

        let args = fake.last_call("backup").unwrap().args;
        assert_eq!(&args[..2], &["backup", "/home/alice"]);
        for expected in ["--iexclude", "*.tmp", "--tag", "nightly", "--no-scan", "--verbose", "--dry-run"] {
            assert!(args.iter().any(|a| a == expected), "missing {}", expected);
        }
    }

    #[test]
    fn test_failed_init_aborts_backup() {
        let fake = FakeProcess::new()
            .respond("cat", 1, "")
            .respond("init", 1, "Fatal: create repository failed")
            .respond("backup", 0, "");
        let ctx = context(&fake, configured());
        assert!(!ResticAdapter::new(&ctx).backup(false).unwrap());
        assert_eq!(fake.subcommands(), vec!["cat", "init"]);
    }

    #[test]
    fn test_backup_skipped_when_recent_unless_forced() {
        let fake = FakeProcess::new()
            .respond("cat", 0, "{}")
            .respond("snapshots", 0, &snapshots_json(60))
            .respond("backup", 0, "");
        let ctx = context(&fake, configured());
        assert!(ResticAdapter::new(&ctx).backup(false).unwrap());
        assert!(fake.last_call("backup").is_none());

        assert!(ResticAdapter::new(&ctx).backup(true).unwrap());
        assert!(fake.last_call("backup").is_some());
        assert!(fake.last_call("init").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_fatal_pre_hook_aborts_backup() {
        let fake = FakeProcess::new()
            .respond("cat", 0, "{}")
            .respond("snapshots", 0, "[]")
            .respond("backup", 0, "");
        let mut cfg = configured();
        cfg.backup.pre_exec.command = Some("exit 2".into());
        cfg.backup.pre_exec.failure_is_fatal = true;
        let ctx = context(&fake, cfg);
        assert!(!ResticAdapter::new(&ctx).backup(false).unwrap());
        assert!(fake.last_call("backup").is_none());
    }

    #[test]
    fn test_restore_arguments() {
        let fake = FakeProcess::new().respond("restore", 0, "restoring");
        let ctx = context(&fake, configured());
        let adapter = ResticAdapter::new(&ctx);
        let ok = adapter
            .restore("a2103ca8", Path::new("/tmp/out"), &["/home/alice/doc".into()])
            .unwrap();
        assert!(ok);
        assert_eq!(
            fake.last_call("restore").unwrap().args,
            vec!["restore", "a2103ca8", "--target", "/tmp/out", "--include", "/home/alice/doc"]
        );
        assert!(matches!(
            adapter.restore("a2103ca8", Path::new(""), &[]),
            Err(AdapterError::InvalidAction(_))
        ));
    }

    #[test]
    fn test_raw_and_forget() {
        let fake = FakeProcess::new()
            .respond("check", 0, "no errors were found")
            .respond("forget", 1, "");
        let ctx = context(&fake, configured());
        let adapter = ResticAdapter::new(&ctx);
        assert!(adapter.raw("check --read-data-subset 5%").unwrap());
        assert_eq!(
            fake.last_call("check").unwrap().args,
            vec!["check", "--read-data-subset", "5%"]
        );
        assert!(!adapter.forget("a2103ca8").unwrap());
        assert!(matches!(adapter.raw("   "), Err(AdapterError::InvalidAction(_))));
    }
}
