use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::BinaryConfig;

/// Result type for capability operations.
pub type CapResult<T> = Result<T, CapError>;

#[derive(Debug, thiserror::Error)]
pub enum CapError {
    #[error("dependency missing: {0}")]
    DependencyMissing(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Process execution
// ---------------------------------------------------------------------------

/// One fully-described subprocess call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Extra environment, layered over the inherited one.
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Command line for logs. Environment values are never included.
    pub fn display(&self) -> String {
        let mut s = self.program.display().to_string();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

/// Captured outcome of a finished subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Lazily-read stdout lines of a still-running process.
pub type LineStream = Box<dyn Iterator<Item = String> + Send>;

pub trait ProcessOps: Send + Sync {
    /// Resolve the engine binary, or `None` when it is absent or not executable.
    fn locate_binary(&self, cfg: &BinaryConfig) -> Option<PathBuf>;

    /// Run to completion and capture both streams.
    fn run(&self, inv: &Invocation) -> CapResult<ProcessOutput>;

    /// Run to completion, handing each stdout line to `on_line` as soon as it
    /// is read. The returned output's `stdout` still holds the full text.
    fn run_streaming(
        &self,
        inv: &Invocation,
        on_line: &mut dyn FnMut(&str),
    ) -> CapResult<ProcessOutput>;

    /// Start the process and return its stdout as a lazy line stream. The
    /// process is reaped once the stream is exhausted or dropped.
    fn spawn_lines(&self, inv: &Invocation) -> CapResult<LineStream>;
}

// ---------------------------------------------------------------------------
// Metrics push
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait MetricsTransport: Send + Sync {
    /// POST a Prometheus text body and return the HTTP status code.
    async fn push(
        &self,
        url: &str,
        auth: Option<(String, String)>,
        body: String,
    ) -> CapResult<u16>;
}
