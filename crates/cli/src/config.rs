use config::{Config, ConfigError, Environment, File};
use engine::config::{BackupConfig, BinaryConfig, EngineConfig, EnvConfig, MetricsConfig, RepoConfig};
use engine::repo::RepoLocation;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const BUNDLED_CONFIG: &str = "snapdesk.yaml";
pub const LOCAL_CONFIG: &str = ".snapdesk.yaml";
pub const ENV_PREFIX: &str = "SNAPDESK";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
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
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub ui: UiConfig,
}

impl AppConfig {
    /// The sections handed to the engine.
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            repo: self.repo.clone(),
            backup: self.backup.clone(),
            env: self.env.clone(),
            metrics: self.metrics.clone(),
            binary: self.binary.clone(),
        }
    }

    /// Values the log writer must never print.
    pub fn secrets(&self) -> Vec<String> {
        [&self.repo.password, &self.metrics.http_password]
            .into_iter()
            .flatten()
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .collect()
    }
}

/// A sanitized version of the configuration, safe to print or hand to a UI.
/// The repository URI is reduced to its anonymised label and no password is
/// carried.
#[derive(Debug, Serialize, Deserialize)]
pub struct FrontendConfig {
    pub repository: Option<String>,
    pub repository_configured: bool,
    pub minimum_backup_age: u64,
    pub backup: BackupConfig,
    pub metrics: MetricsConfig,
    pub binary: BinaryConfig,
    pub ui: UiConfig,
}

impl From<&AppConfig> for FrontendConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            repository: config
                .repo
                .repository
                .as_deref()
                .filter(|r| !r.trim().is_empty())
                .map(|r| RepoLocation::parse(r).label()),
            repository_configured: config.repo.is_configured(),
            minimum_backup_age: config.repo.minimum_backup_age,
            backup: config.backup.clone(),
            metrics: config.metrics.clone(),
            binary: config.binary.clone(),
            ui: config.ui.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct UiConfig {
    /// How often the coordinator polls running tasks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    50
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LoggingConfig {
    /// Forces debug level regardless of `levels`.
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub format: LoggingFormatConfig,
    #[serde(default)]
    pub levels: LoggingLevelsConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingFormatConfig {
    #[serde(default = "true_default")]
    pub show_time: bool,
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub location: LoggingLocationConfig,
}

impl Default for LoggingFormatConfig {
    fn default() -> Self {
        Self {
            show_time: true,
            json: false,
            location: LoggingLocationConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LoggingLocationConfig {
    #[serde(default)]
    pub show_file: bool,
    #[serde(default)]
    pub show_line: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingLevelsConfig {
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "true_default")]
    pub info: bool,
    #[serde(default = "true_default")]
    pub warning: bool,
    #[serde(default = "true_default")]
    pub error: bool,
    #[serde(default = "true_default")]
    pub critical: bool,
}

impl Default for LoggingLevelsConfig {
    fn default() -> Self {
        Self {
            debug: false,
            info: true,
            warning: true,
            error: true,
            critical: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RedactionConfig {
    #[serde(default = "true_default")]
    pub enabled: bool,
    #[serde(default)]
    pub patterns: Vec<RedactionPattern>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: Vec::new(),
        }
    }
}

fn true_default() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RedactionPattern {
    pub name: String,
    pub regex: String,
    pub placeholder: String,
}

/// Directory holding the bundled defaults: the crate manifest directory when
/// run through cargo, otherwise the working directory.
fn base_dir() -> PathBuf {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    let base = Path::new(&manifest_dir);
    if base.join(BUNDLED_CONFIG).exists() {
        base.to_path_buf()
    } else {
        PathBuf::from(".")
    }
}

/// Load the layered configuration. Later sources win:
/// bundled `snapdesk.yaml`, local `.snapdesk.yaml`, the explicit file, then
/// `SNAPDESK__SECTION__KEY` environment variables.
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let base = base_dir();

    let mut builder = Config::builder()
        .add_source(File::from(base.join(BUNDLED_CONFIG)).required(false))
        .add_source(File::from(base.join(LOCAL_CONFIG)).required(false));

    if let Some(path) = explicit {
        builder = builder.add_source(File::from(path).required(true));
    }

    // SNAPDESK__REPO__PASSWORD=... maps to repo.password
    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    builder.build()?.try_deserialize()
}
