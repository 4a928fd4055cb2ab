//! Configuration consumed by the engine.
//!
//! The engine does not load configuration itself; front-ends deserialize
//! these sections from their own sources and hand them over in the
//! [`AppContext`](crate::context::AppContext).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default minimum age, in seconds, before a new backup is considered due.
pub const DEFAULT_MINIMUM_BACKUP_AGE: u64 = 86_400;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub repo: RepoConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub env: EnvConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub binary: BinaryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RepoConfig {
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// KiB/s, passed as `--limit-upload`.
    #[serde(default)]
    pub upload_speed: Option<u64>,
    /// KiB/s, passed as `--limit-download`.
    #[serde(default)]
    pub download_speed: Option<u64>,
    #[serde(default)]
    pub backend_connections: Option<u32>,
    #[serde(default = "default_minimum_backup_age")]
    pub minimum_backup_age: u64,
}

fn default_minimum_backup_age() -> u64 {
    DEFAULT_MINIMUM_BACKUP_AGE
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            repository: None,
            password: None,
            upload_speed: None,
            download_speed: None,
            backend_connections: None,
            minimum_backup_age: DEFAULT_MINIMUM_BACKUP_AGE,
        }
    }
}

impl RepoConfig {
    /// Both a repository and a password are required before any engine call.
    pub fn is_configured(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        filled(&self.repository) && filled(&self.password)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_files: Vec<PathBuf>,
    #[serde(default)]
    pub exclude_case_ignore: bool,
    #[serde(default)]
    pub exclude_caches: bool,
    #[serde(default)]
    pub one_file_system: bool,
    #[serde(default)]
    pub use_fs_snapshot: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form extra engine flags, split on whitespace.
    #[serde(default)]
    pub additional_parameters: Option<String>,
    #[serde(default)]
    pub pre_exec: HookConfig,
    #[serde(default)]
    pub post_exec: HookConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HookConfig {
    #[serde(default)]
    pub command: Option<String>,
    /// Seconds; 0 waits forever.
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub failure_is_fatal: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EnvConfig {
    /// `KEY=VALUE` entries exported to every engine call.
    #[serde(default)]
    pub variables: Vec<String>,
}

impl EnvConfig {
    /// Split entries on the first `=`. Malformed entries are logged and skipped.
    pub fn expanded(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for entry in &self.variables {
            match entry.split_once('=') {
                Some((k, v)) if !k.trim().is_empty() => {
                    out.push((k.trim().to_string(), v.trim().to_string()))
                }
                _ => tracing::error!(entry = %entry, "bogus environment variable in configuration"),
            }
        }
        out
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// `file:///path` or an `http(s)://` push URL. `${BACKUP_JOB}` expands.
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default = "default_hostname_placeholder")]
    pub instance: String,
    #[serde(default = "default_hostname_placeholder")]
    pub backup_job: String,
    #[serde(default)]
    pub group: Option<String>,
    /// `label=value` entries.
    #[serde(default)]
    pub additional_labels: Vec<String>,
    #[serde(default)]
    pub http_username: Option<String>,
    #[serde(default, skip_serializing)]
    pub http_password: Option<String>,
}

fn default_hostname_placeholder() -> String {
    crate::metrics::HOSTNAME_PLACEHOLDER.to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            destination: None,
            instance: default_hostname_placeholder(),
            backup_job: default_hostname_placeholder(),
            group: None,
            additional_labels: Vec::new(),
            http_username: None,
            http_password: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BinaryConfig {
    /// Explicit engine binary; skips the search when set.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Directories searched before `PATH`.
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_requires_repository_and_password() {
        let mut repo = RepoConfig::default();
        assert!(!repo.is_configured());
        repo.repository = Some("/srv/backups".into());
        assert!(!repo.is_configured());
        repo.password = Some("   ".into());
        assert!(!repo.is_configured());
        repo.password = Some("hunter2".into());
        assert!(repo.is_configured());
    }

    #[test]
    fn test_password_never_serialized() {
        let repo = RepoConfig {
            repository: Some("rest:https://host/repo".into()),
            password: Some("hunter2".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&repo).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_env_variables_expanded() {
        let env = EnvConfig {
            variables: vec![
                "AWS_ACCESS_KEY_ID = abc".into(),
                "broken".into(),
                "TOKEN=a=b".into(),
            ],
        };
        let vars = env.expanded();
        assert_eq!(
            vars,
            vec![
                ("AWS_ACCESS_KEY_ID".to_string(), "abc".to_string()),
                ("TOKEN".to_string(), "a=b".to_string()),
            ]
        );
    }

    #[test]
    fn test_defaults_from_empty_yaml() {
        let cfg: EngineConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.repo.minimum_backup_age, DEFAULT_MINIMUM_BACKUP_AGE);
        assert!(cfg.backup.paths.is_empty());
        assert_eq!(cfg.metrics.instance, "${HOSTNAME}");
    }
}
