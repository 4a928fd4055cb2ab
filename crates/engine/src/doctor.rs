//! Doctor – gather engine and environment facts for diagnostics.

use crate::context::AppContext;
use crate::platform::ENGINE_BINARY_NAME;
use crate::repo::RepoLocation;
use crate::traits::Invocation;
use crate::types::*;
use std::collections::HashMap;
use std::time::Instant;

/// Run the doctor check and return a full report as a CommandResult. A
/// missing engine binary turns the result into a failure, the report is
/// attached either way.
pub fn run_doctor(ctx: &AppContext) -> CommandResult {
    let run_id = new_run_id();
    let start = Instant::now();

    let report = gather_report(ctx);
    let elapsed = start.elapsed().as_millis() as u64;

    let mut r = if report.engine_binary.is_none() {
        result_err(
            "doctor",
            "env",
            &run_id,
            elapsed,
            ErrorCode::BinaryMissing,
            format!("{} not found", ENGINE_BINARY_NAME),
        )
    } else {
        result_ok("doctor", "env", &run_id, elapsed)
    };
    r.data = Some(serde_json::to_value(&report).unwrap_or_default());
    r
}

fn gather_report(ctx: &AppContext) -> DoctorReport {
    let cfg = &ctx.config;
    let binary = ctx.process().locate_binary(&cfg.binary);
    let engine_version = binary.as_ref().and_then(|b| {
        ctx.process()
            .run(&Invocation::new(b).arg("version"))
            .ok()
            .filter(|o| o.success())
            .map(|o| o.stdout.trim().to_string())
    });

    DoctorReport {
        engine_binary: binary.map(|b| b.display().to_string()),
        engine_version,
        repository_configured: cfg.repo.is_configured(),
        repository: cfg
            .repo
            .repository
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .map(|r| RepoLocation::parse(r).label()),
        backup_paths: cfg.backup.paths.len(),
        metrics_enabled: cfg.metrics.enabled,
        os_name: current_os().to_string(),
        arch: std::env::consts::ARCH.to_string(),
        headless: detect_headless(),
        proxy_env: collect_proxy_env(),
    }
}

fn collect_proxy_env() -> HashMap<String, String> {
    let keys = [
        "HTTP_PROXY",
        "http_proxy",
        "HTTPS_PROXY",
        "https_proxy",
        "NO_PROXY",
        "no_proxy",
    ];
    let mut out = HashMap::new();
    for k in keys {
        if let Ok(v) = std::env::var(k) {
            out.insert(k.to_string(), v);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    #[test]
    fn test_doctor_reports_engine_and_hides_credentials() {
        let fake = FakeProcess::new().respond("version", 0, "restic 0.16.4 compiled with go1.21\n");
        let ctx = context(&fake, configured());
        let r = run_doctor(&ctx);
        assert_eq!(r.status, Status::Pass);
        let data = r.data.unwrap();
        assert_eq!(data["engine_version"], "restic 0.16.4 compiled with go1.21");
        assert_eq!(data["repository"], "[REST] rest:https://backup.example.com/repo");
        assert_eq!(data["repository_configured"], true);
        assert!(!data.to_string().contains("hunter2"));
    }

    #[test]
    fn test_doctor_without_binary() {
        let fake = FakeProcess::without_binary();
        let ctx = context(&fake, Default::default());
        let r = run_doctor(&ctx);
        assert_eq!(r.status, Status::Error);
        assert_eq!(r.error.unwrap().code, ErrorCode::BinaryMissing);
        let data = r.data.unwrap();
        assert_eq!(data["engine_version"], serde_json::Value::Null);
        assert_eq!(data["repository_configured"], false);
    }
}
