use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Final result JSON – the stable output contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub run_id: String,
    pub command: String,
    pub target: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub timing_ms: TimingInfo,
    /// Engine output lines captured while the action ran.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<String>,
    pub env_summary: EnvSummary,
    /// Action-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pass,
    Fail,
    Skip,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pass => "pass",
            Status::Fail => "fail",
            Status::Skip => "skip",
            Status::Error => "error",
        }
    }

    /// Process exit code for CLI front-ends.
    pub fn exit_code(&self) -> i32 {
        match self {
            Status::Pass | Status::Skip => 0,
            Status::Fail => 1,
            Status::Error => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    NotConfigured,
    BinaryMissing,
    EngineFailed,
    PermissionDenied,
    NetworkError,
    IoError,
    Timeout,
    Cancelled,
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TimingInfo {
    pub total: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub steps: HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvSummary {
    pub os: String,
    pub arch: String,
    pub headless: bool,
}

impl Default for EnvSummary {
    fn default() -> Self {
        Self {
            os: current_os().to_string(),
            arch: std::env::consts::ARCH.to_string(),
            headless: detect_headless(),
        }
    }
}

// ---------------------------------------------------------------------------
// Doctor-specific types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorReport {
    pub engine_binary: Option<String>,
    pub engine_version: Option<String>,
    pub repository_configured: bool,
    /// `[KIND] uri` with credentials stripped.
    pub repository: Option<String>,
    pub backup_paths: usize,
    pub metrics_enabled: bool,
    pub os_name: String,
    pub arch: String,
    pub headless: bool,
    pub proxy_env: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Scenario types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<ScenarioStep>,
}

/// One scripted action: the descriptor fields sit next to the expectations,
/// e.g. `{action: ls, snapshot: a2103ca8, expect_status: pass}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioStep {
    #[serde(flatten)]
    pub descriptor: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_expect_status")]
    pub expect_status: Status,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_expect_status() -> Status {
    Status::Pass
}

fn default_timeout_ms() -> u64 {
    30_000
}

// ---------------------------------------------------------------------------
// Scenario result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: Option<String>,
    pub overall_status: Status,
    pub step_results: Vec<CommandResult>,
}

// ---------------------------------------------------------------------------
// Serve / daemon protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn current_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "macos",
        "linux" => "linux",
        "windows" => "windows",
        other => other,
    }
}

pub fn detect_headless() -> bool {
    match std::env::consts::OS {
        "linux" => std::env::var("DISPLAY").is_err() && std::env::var("WAYLAND_DISPLAY").is_err(),
        "macos" => std::env::var("SSH_TTY").is_ok() && std::env::var("DISPLAY").is_err(),
        _ => false,
    }
}

/// Generate a new run ID (UUIDv4).
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn result_with(
    command: &str,
    target: &str,
    run_id: &str,
    total_ms: u64,
    status: Status,
    error: Option<ErrorInfo>,
) -> CommandResult {
    CommandResult {
        run_id: run_id.to_string(),
        command: command.to_string(),
        target: target.to_string(),
        status,
        error,
        timing_ms: TimingInfo {
            total: total_ms,
            steps: HashMap::new(),
        },
        output: vec![],
        env_summary: EnvSummary::default(),
        data: None,
    }
}

/// Build a successful CommandResult shell (caller fills in data).
pub fn result_ok(command: &str, target: &str, run_id: &str, total_ms: u64) -> CommandResult {
    result_with(command, target, run_id, total_ms, Status::Pass, None)
}

/// The engine ran but reported failure (non-zero exit, unparseable output).
pub fn result_fail(
    command: &str,
    target: &str,
    run_id: &str,
    total_ms: u64,
    message: impl Into<String>,
) -> CommandResult {
    let error = ErrorInfo {
        code: ErrorCode::EngineFailed,
        message: message.into(),
        details: serde_json::Value::Null,
    };
    result_with(command, target, run_id, total_ms, Status::Fail, Some(error))
}

/// Build an error CommandResult.
pub fn result_err(
    command: &str,
    target: &str,
    run_id: &str,
    total_ms: u64,
    code: ErrorCode,
    message: impl Into<String>,
) -> CommandResult {
    let error = ErrorInfo {
        code,
        message: message.into(),
        details: serde_json::Value::Null,
    };
    result_with(command, target, run_id, total_ms, Status::Error, Some(error))
}

/// Build a skip CommandResult.
pub fn result_skip(
    command: &str,
    target: &str,
    run_id: &str,
    total_ms: u64,
    reason: impl Into<String>,
) -> CommandResult {
    let error = ErrorInfo {
        code: ErrorCode::NotConfigured,
        message: reason.into(),
        details: serde_json::Value::Null,
    };
    result_with(command, target, run_id, total_ms, Status::Skip, Some(error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_exit_codes() {
        assert_eq!(Status::Pass.exit_code(), 0);
        assert_eq!(Status::Skip.exit_code(), 0);
        assert_eq!(Status::Fail.exit_code(), 1);
        assert_eq!(Status::Error.exit_code(), 2);
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::BinaryMissing.to_string(), "BINARY_MISSING");
        assert_eq!(ErrorCode::NotConfigured.to_string(), "NOT_CONFIGURED");
    }

    #[test]
    fn test_step_keeps_descriptor_fields() {
        let step: ScenarioStep = serde_yaml::from_str(
            "action: restore\nsnapshot: a2103ca8\ntarget: /tmp/out\nexpect_status: fail\n",
        )
        .unwrap();
        assert_eq!(step.expect_status, Status::Fail);
        assert_eq!(step.timeout_ms, 30_000);
        assert_eq!(step.descriptor["action"], "restore");
        assert!(!step.descriptor.contains_key("expect_status"));
    }
}
