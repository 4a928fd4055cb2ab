//! Platform implementations of the capability traits.
//!
//! - [`StdProcess`]: real subprocesses via `std::process`
//! - [`ReqwestTransport`]: metrics push over HTTP via reqwest

use crate::config::BinaryConfig;
use crate::traits::*;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

/// File name of the engine binary on this platform.
pub const ENGINE_BINARY_NAME: &str = if cfg!(windows) { "restic.exe" } else { "restic" };

// ===========================================================================
// Process – wraps std::process
// ===========================================================================

pub struct StdProcess;

impl ProcessOps for StdProcess {
    fn locate_binary(&self, cfg: &BinaryConfig) -> Option<PathBuf> {
        locate_binary(cfg, std::env::var_os("PATH").as_deref())
    }

    fn run(&self, inv: &Invocation) -> CapResult<ProcessOutput> {
        let output = command(inv)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| spawn_error(inv, e))?;
        Ok(ProcessOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn run_streaming(
        &self,
        inv: &Invocation,
        on_line: &mut dyn FnMut(&str),
    ) -> CapResult<ProcessOutput> {
        let mut child = command(inv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(inv, e))?;

        let stderr = collect_stderr(&mut child);
        let mut stdout = String::new();
        if let Some(out) = child.stdout.take() {
            let mut reader = BufReader::new(out);
            loop {
                match read_line_lossy(&mut reader) {
                    Ok(Some(line)) => {
                        on_line(&line);
                        stdout.push_str(&line);
                        stdout.push('\n');
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        join_stderr(stderr);
                        return Err(CapError::Io(e));
                    }
                }
            }
        }
        let status = child.wait()?;
        Ok(ProcessOutput {
            exit_code: status.code(),
            stdout,
            stderr: join_stderr(stderr),
        })
    }

    fn spawn_lines(&self, inv: &Invocation) -> CapResult<LineStream> {
        let mut child = command(inv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(inv, e))?;

        let stderr = collect_stderr(&mut child);
        let reader = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| CapError::Other("child stdout was not captured".into()))?;

        Ok(Box::new(ChildLines {
            child: Some(child),
            reader,
            stderr: Some(stderr),
            program: inv.program.display().to_string(),
        }))
    }
}

fn command(inv: &Invocation) -> Command {
    let mut cmd = Command::new(&inv.program);
    cmd.args(&inv.args).envs(&inv.env);
    cmd
}

fn spawn_error(inv: &Invocation, e: std::io::Error) -> CapError {
    match e.kind() {
        std::io::ErrorKind::NotFound => {
            CapError::DependencyMissing(format!("{} not found", inv.program.display()))
        }
        std::io::ErrorKind::PermissionDenied => {
            CapError::PermissionDenied(format!("cannot execute {}: {}", inv.program.display(), e))
        }
        _ => CapError::Io(e),
    }
}

/// Drain stderr on a side thread so a chatty child never blocks on a full pipe.
fn collect_stderr(child: &mut Child) -> JoinHandle<String> {
    let stderr = child.stderr.take();
    std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut err) = stderr {
            let _ = err.read_to_string(&mut buf);
        }
        buf
    })
}

fn join_stderr(handle: JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

/// One line without its terminator. Bytes that are not UTF-8 (file names in
/// legacy encodings) are replaced rather than ending the stream.
fn read_line_lossy(reader: &mut impl BufRead) -> std::io::Result<Option<String>> {
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf)? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Stdout lines of a live child; the child is reaped when iteration ends and
/// killed if the stream is dropped early.
struct ChildLines {
    child: Option<Child>,
    reader: BufReader<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
    program: String,
}

impl ChildLines {
    fn finish(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let stderr = self.stderr.take().map(join_stderr).unwrap_or_default();
        match child.wait() {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::warn!(
                program = %self.program,
                code = ?status.code(),
                stderr = %stderr.trim(),
                "engine listing exited with failure"
            ),
            Err(e) => tracing::warn!(program = %self.program, error = %e, "cannot reap engine process"),
        }
    }
}

impl Iterator for ChildLines {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.child.as_ref()?;
        match read_line_lossy(&mut self.reader) {
            Ok(Some(line)) => Some(line),
            Err(e) => {
                tracing::warn!(program = %self.program, error = %e, "error reading engine output");
                if let Some(child) = self.child.as_mut() {
                    let _ = child.kill();
                }
                self.finish();
                None
            }
            Ok(None) => {
                self.finish();
                None
            }
        }
    }
}

impl Drop for ChildLines {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
        }
        self.finish();
    }
}

// ===========================================================================
// Binary discovery
// ===========================================================================

/// Resolve the engine binary: explicit path first, then the configured search
/// directories, then every entry of `path_env`.
pub fn locate_binary(cfg: &BinaryConfig, path_env: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    if let Some(ref explicit) = cfg.path {
        return is_executable(explicit).then(|| explicit.clone());
    }
    let from_env = path_env
        .map(|p| std::env::split_paths(p).collect::<Vec<_>>())
        .unwrap_or_default();
    cfg.search_paths
        .iter()
        .chain(from_env.iter())
        .map(|dir| dir.join(ENGINE_BINARY_NAME))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// ===========================================================================
// Metrics transport – wraps reqwest
// ===========================================================================

pub struct ReqwestTransport;

/// reqwest is built without a default crypto provider; install ring once.
fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

#[async_trait::async_trait]
impl MetricsTransport for ReqwestTransport {
    async fn push(
        &self,
        url: &str,
        auth: Option<(String, String)>,
        body: String,
    ) -> CapResult<u16> {
        ensure_crypto_provider();
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| CapError::Network(format!("failed to build HTTP client: {}", e)))?;

        let mut req = client
            .post(url)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(body);
        if let Some((user, password)) = auth {
            req = req.basic_auth(user, Some(password));
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                CapError::Timeout
            } else {
                CapError::Network(format!("POST {}: {}", url, e))
            }
        })?;
        Ok(resp.status().as_u16())
    }
}
