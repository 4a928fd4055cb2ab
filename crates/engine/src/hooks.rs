//! Pre/post backup shell hooks.

use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::config::HookConfig;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookOutput {
    pub exit_code: Option<i32>,
    pub output: String,
}

impl HookOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("hook `{command}` timed out after {secs} seconds")]
    TimedOut { command: String, secs: u64 },
    #[error("cannot start hook `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("powershell");
        cmd.args(["-NoProfile", "-NonInteractive", "-Command", command]);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

/// Run `command` through the platform shell. A zero `timeout_secs` waits
/// forever; otherwise the child is killed at the deadline.
pub fn run_shell(command: &str, timeout_secs: u64) -> Result<HookOutput, HookError> {
    let mut child = shell_command(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| HookError::Spawn {
            command: command.to_string(),
            source,
        })?;

    // stdout and stderr are merged into one text, read off-thread so a
    // talkative hook cannot stall on a full pipe.
    let readers: Vec<_> = [
        child.stdout.take().map(|r| Box::new(r) as Box<dyn Read + Send>),
        child.stderr.take().map(|r| Box::new(r) as Box<dyn Read + Send>),
    ]
    .into_iter()
    .flatten()
    .map(|mut r| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = r.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).to_string()
        })
    })
    .collect();

    let deadline = (timeout_secs > 0).then(|| Instant::now() + Duration::from_secs(timeout_secs));
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(command = %command, error = %e, "cannot poll hook");
                break None;
            }
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(HookError::TimedOut {
                command: command.to_string(),
                secs: timeout_secs,
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    let output = readers
        .into_iter()
        .filter_map(|h| h.join().ok())
        .collect::<Vec<_>>()
        .join("");
    Ok(HookOutput {
        exit_code: status.and_then(|s| s.code()),
        output,
    })
}

/// Run a configured hook. Returns `false` only when the hook failed and its
/// failure is fatal for the surrounding backup.
pub fn run_hook(stage: &str, hook: &HookConfig) -> bool {
    let Some(command) = hook.command.as_deref().filter(|c| !c.trim().is_empty()) else {
        return true;
    };
    let failed = match run_shell(command, hook.timeout) {
        Ok(out) if out.success() => {
            tracing::debug!(stage, command, output = %out.output.trim(), "hook succeeded");
            false
        }
        Ok(out) => {
            tracing::error!(
                stage,
                command,
                code = ?out.exit_code,
                output = %out.output.trim(),
                "hook failed"
            );
            true
        }
        Err(e) => {
            tracing::error!(stage, error = %e, "hook failed");
            true
        }
    };
    !(failed && hook.failure_is_fatal)
}
