//! Backup metrics in Prometheus text exposition format.
//!
//! The engine's human-readable backup summary is scraped into a handful of
//! gauges, labelled from [`MetricsConfig`], then written to a `file://`
//! destination or pushed to an HTTP endpoint through [`MetricsTransport`].

use regex::Regex;
use std::sync::OnceLock;

use crate::config::MetricsConfig;
use crate::traits::MetricsTransport;

/// Config value replaced by the machine hostname.
pub const HOSTNAME_PLACEHOLDER: &str = "${HOSTNAME}";
/// Destination placeholder replaced by the resolved backup job name.
pub const BACKUP_JOB_PLACEHOLDER: &str = "${BACKUP_JOB}";

/// Figures scraped from a backup run. Missing lines stay `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackupSummary {
    pub files: Option<[u64; 3]>,
    pub dirs: Option<[u64; 3]>,
    pub added_bytes: Option<u64>,
    pub processed_files: Option<u64>,
    pub processed_bytes: Option<u64>,
    pub duration_secs: Option<u64>,
}

impl BackupSummary {
    pub fn is_complete(&self) -> bool {
        self.files.is_some()
            && self.dirs.is_some()
            && self.added_bytes.is_some()
            && self.processed_files.is_some()
    }
}

struct Patterns {
    counts: Regex,
    added: Regex,
    processed: Regex,
}

fn patterns() -> &'static Patterns {
    static P: OnceLock<Patterns> = OnceLock::new();
    P.get_or_init(|| Patterns {
        counts: Regex::new(
            r"(?m)^\s*(Files|Dirs):\s+(\d+)\s+new,\s+(\d+)\s+changed,\s+(\d+)\s+unmodified",
        )
        .expect("static regex"),
        added: Regex::new(r"(?m)^\s*Added to the repo(?:sitory)?:\s+([\d.]+)\s*([KMGTP]?i?B)")
            .expect("static regex"),
        processed: Regex::new(
            r"(?m)^\s*processed\s+(\d+)\s+files,\s+([\d.]+)\s*([KMGTP]?i?B)\s+in\s+([\d:]+)",
        )
        .expect("static regex"),
    })
}

/// `6.386 MiB` style sizes to bytes.
pub fn parse_size(value: &str, unit: &str) -> Option<u64> {
    let n: f64 = value.parse().ok()?;
    let exp = match unit.trim_end_matches('B').trim_end_matches('i') {
        "" => 0,
        "K" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        "P" => 5,
        _ => return None,
    };
    Some((n * 1024f64.powi(exp)).round() as u64)
}

/// `m:ss` or `h:mm:ss` to seconds.
pub fn parse_clock(s: &str) -> Option<u64> {
    s.split(':')
        .try_fold(0u64, |acc, part| part.parse::<u64>().ok().map(|v| acc * 60 + v))
}

pub fn parse_summary(output: &str) -> BackupSummary {
    let p = patterns();
    let mut summary = BackupSummary::default();

    for c in p.counts.captures_iter(output) {
        let nums = [&c[2], &c[3], &c[4]].map(|s| s.parse::<u64>().unwrap_or(0));
        match &c[1] {
            "Files" => summary.files = Some(nums),
            _ => summary.dirs = Some(nums),
        }
    }
    if let Some(c) = p.added.captures(output) {
        summary.added_bytes = parse_size(&c[1], &c[2]);
    }
    if let Some(c) = p.processed.captures(output) {
        summary.processed_files = c[1].parse().ok();
        summary.processed_bytes = parse_size(&c[2], &c[3]);
        summary.duration_secs = parse_clock(&c[4]);
    }
    summary
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn expand_hostname(value: &str, host: &str) -> String {
    if value == HOSTNAME_PLACEHOLDER {
        host.to_string()
    } else {
        value.to_string()
    }
}

/// Label set shared by every metric line, without braces.
pub fn label_set(cfg: &MetricsConfig, host: &str) -> String {
    let instance = expand_hostname(&cfg.instance, host);
    let job = expand_hostname(&cfg.backup_job, host);
    let mut labels = format!(
        "instance=\"{}\",backup_job=\"{}\"",
        escape_label(&instance),
        escape_label(&job)
    );
    if let Some(group) = cfg.group.as_deref().filter(|g| !g.is_empty()) {
        labels.push_str(&format!(",group=\"{}\"", escape_label(group)));
    }
    for entry in &cfg.additional_labels {
        match entry.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                labels.push_str(&format!(",{}=\"{}\"", k.trim(), escape_label(v.trim())))
            }
            _ => tracing::error!(label = %entry, "bogus additional label in configuration"),
        }
    }
    labels.push_str(&format!(
        ",snapdesk_version=\"snapdesk{}\"",
        env!("CARGO_PKG_VERSION")
    ));
    labels
}

/// Render metric lines. A failed run or an unparseable summary sets
/// `restic_backup_failure` to 1.
pub fn render(summary: &BackupSummary, run_ok: bool, labels: &str, timestamp: i64) -> Vec<String> {
    let mut lines = Vec::new();
    let states = ["new", "changed", "unmodified"];
    if let Some(files) = summary.files {
        for (state, n) in states.iter().zip(files) {
            lines.push(format!("restic_repo_files{{{},state=\"{}\"}} {}", labels, state, n));
        }
    }
    if let Some(dirs) = summary.dirs {
        for (state, n) in states.iter().zip(dirs) {
            lines.push(format!("restic_repo_dirs{{{},state=\"{}\"}} {}", labels, state, n));
        }
    }
    if let Some(added) = summary.added_bytes {
        lines.push(format!("restic_repo_size_bytes{{{},state=\"added\"}} {}", labels, added));
    }
    if let Some(files) = summary.processed_files {
        lines.push(format!("restic_snapshot_files_total{{{}}} {}", labels, files));
    }
    if let Some(bytes) = summary.processed_bytes {
        lines.push(format!("restic_snapshot_size_bytes{{{}}} {}", labels, bytes));
    }
    if let Some(secs) = summary.duration_secs {
        lines.push(format!("restic_backup_duration_seconds{{{}}} {}", labels, secs));
    }
    let failed = !run_ok || !summary.is_complete();
    lines.push(format!("restic_backup_failure{{{}}} {}", labels, u8::from(failed)));
    lines.push(format!("restic_backup_timestamp_seconds{{{}}} {}", labels, timestamp));
    lines
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("no metrics destination configured")]
    NoDestination,
    #[error("unsupported metrics destination: {0}")]
    UnsupportedDestination(String),
    #[error("cannot write metrics file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("metrics push failed: {0}")]
    Push(String),
}

/// Scrape `output`, render and deliver the metrics. Does nothing when
/// metrics are disabled.
pub fn write_metrics(
    cfg: &MetricsConfig,
    transport: &dyn MetricsTransport,
    run_ok: bool,
    output: &str,
) -> Result<(), MetricsError> {
    if !cfg.enabled {
        return Ok(());
    }
    let host = local_hostname();
    let summary = parse_summary(output);
    if !run_ok || !summary.is_complete() {
        tracing::error!("engine finished with errors");
    }
    let lines = render(
        &summary,
        run_ok,
        &label_set(cfg, &host),
        chrono::Utc::now().timestamp(),
    );
    let mut body = lines.join("\n");
    body.push('\n');

    let job = expand_hostname(&cfg.backup_job, &host);
    let destination = cfg
        .destination
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .ok_or(MetricsError::NoDestination)?
        .replace(BACKUP_JOB_PLACEHOLDER, &job);
    let lower = destination.to_ascii_lowercase();

    if lower.starts_with("file://") {
        let path = &destination["file://".len()..];
        std::fs::write(path, body).map_err(|source| MetricsError::Write {
            path: path.to_string(),
            source,
        })?;
        tracing::info!(path, "metrics written");
        Ok(())
    } else if lower.starts_with("http://") || lower.starts_with("https://") {
        let auth = match (&cfg.http_username, &cfg.http_password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => {
                tracing::info!("no metrics authentication present");
                None
            }
        };
        let status = block_on_push(transport, &destination, auth, body)?;
        if (200..300).contains(&status) {
            tracing::info!(status, "metrics pushed");
            Ok(())
        } else {
            Err(MetricsError::Push(format!("HTTP status {}", status)))
        }
    } else {
        Err(MetricsError::UnsupportedDestination(destination))
    }
}

/// Drive the async transport from the synchronous backup worker.
fn block_on_push(
    transport: &dyn MetricsTransport,
    url: &str,
    auth: Option<(String, String)>,
    body: String,
) -> Result<u16, MetricsError> {
    let fut = transport.push(url, auth, body);
    let result = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle.block_on(fut),
        Err(_) => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| MetricsError::Push(e.to_string()))?
            .block_on(fut),
    };
    result.map_err(|e| MetricsError::Push(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::CapResult;
    use std::sync::Mutex;

    const OUTPUT: &str = "\
open repository
using parent snapshot 5a5b4f1c

Files:         216 new,    21 changed,  5836 unmodified
Dirs:           29 new,    47 changed,   880 unmodified
Added to the repository: 6.386 MiB (2.108 MiB stored)

processed 6073 files, 2.341 GiB in 1:02
snapshot 9bdbd8e8 saved
";

    struct RecordingTransport {
        pushed: Mutex<Vec<(String, Option<(String, String)>, String)>>,
        status: u16,
    }

    #[async_trait::async_trait]
    impl MetricsTransport for RecordingTransport {
        async fn push(
            &self,
            url: &str,
            auth: Option<(String, String)>,
            body: String,
        ) -> CapResult<u16> {
            self.pushed
                .lock()
                .unwrap()
                .push((url.to_string(), auth, body));
            Ok(self.status)
        }
    }

    fn transport(status: u16) -> RecordingTransport {
        RecordingTransport {
            pushed: Mutex::new(Vec::new()),
            status,
        }
    }

    #[test]
    fn test_parse_summary() {
        let s = parse_summary(OUTPUT);
        assert_eq!(s.files, Some([216, 21, 5836]));
        assert_eq!(s.dirs, Some([29, 47, 880]));
        assert_eq!(s.added_bytes, Some(6_696_206));
        assert_eq!(s.processed_files, Some(6073));
        assert_eq!(s.duration_secs, Some(62));
        assert!(s.is_complete());
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_size("1", "KiB"), Some(1024));
        assert_eq!(parse_size("12", "B"), Some(12));
        assert_eq!(parse_size("1", "XB"), None);
        assert_eq!(parse_clock("1:02:03"), Some(3723));
        assert_eq!(parse_clock("x:1"), None);
    }

    #[test]
    fn test_labels() {
        let cfg = MetricsConfig {
            instance: HOSTNAME_PLACEHOLDER.into(),
            backup_job: "nightly".into(),
            group: Some("office".into()),
            additional_labels: vec!["site = paris".into(), "broken".into()],
            ..Default::default()
        };
        let labels = label_set(&cfg, "ws01");
        assert!(labels.starts_with(
            "instance=\"ws01\",backup_job=\"nightly\",group=\"office\",site=\"paris\""
        ));
        assert!(labels.contains("snapdesk_version=\"snapdesk"));
    }

    #[test]
    fn test_render_failure_flag() {
        let ok = render(&parse_summary(OUTPUT), true, "a=\"b\"", 10);
        assert!(ok.contains(&"restic_backup_failure{a=\"b\"} 0".to_string()));
        assert!(ok.contains(&"restic_repo_files{a=\"b\",state=\"new\"} 216".to_string()));

        let garbled = render(&parse_summary("Fatal: repository is locked"), true, "a=\"b\"", 10);
        assert!(garbled.contains(&"restic_backup_failure{a=\"b\"} 1".to_string()));
        let failed = render(&parse_summary(OUTPUT), false, "a=\"b\"", 10);
        assert!(failed.contains(&"restic_backup_failure{a=\"b\"} 1".to_string()));
    }

    #[test]
    fn test_write_metrics_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nightly.prom");
        let cfg = MetricsConfig {
            enabled: true,
            destination: Some(format!(
                "file://{}",
                dir.path().join("${BACKUP_JOB}.prom").display()
            )),
            backup_job: "nightly".into(),
            ..Default::default()
        };
        write_metrics(&cfg, &transport(200), true, OUTPUT).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("restic_snapshot_files_total"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_write_metrics_push_with_auth() {
        let t = transport(202);
        let cfg = MetricsConfig {
            enabled: true,
            destination: Some("https://push.example.com/metrics/job/${BACKUP_JOB}".into()),
            backup_job: "nightly".into(),
            http_username: Some("prom".into()),
            http_password: Some("secret".into()),
            ..Default::default()
        };
        write_metrics(&cfg, &t, true, OUTPUT).unwrap();
        let pushed = t.pushed.lock().unwrap();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].0, "https://push.example.com/metrics/job/nightly");
        assert_eq!(pushed[0].1, Some(("prom".to_string(), "secret".to_string())));
    }

    #[test]
    fn test_write_metrics_errors() {
        let mut cfg = MetricsConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(matches!(
            write_metrics(&cfg, &transport(200), true, OUTPUT),
            Err(MetricsError::NoDestination)
        ));
        cfg.destination = Some("ftp://x".into());
        assert!(matches!(
            write_metrics(&cfg, &transport(200), true, OUTPUT),
            Err(MetricsError::UnsupportedDestination(_))
        ));
        cfg.destination = Some("http://x/metrics".into());
        assert!(matches!(
            write_metrics(&cfg, &transport(500), true, OUTPUT),
            Err(MetricsError::Push(_))
        ));
        cfg.enabled = false;
        assert!(write_metrics(&cfg, &transport(500), true, OUTPUT).is_ok());
    }
}
