//! Application context – holds capability trait objects and config.

use crate::config::EngineConfig;
use crate::platform::{ReqwestTransport, StdProcess};
use crate::traits::*;

/// Central context passed to all engine operations.
///
/// Holds trait-object capabilities so front-ends and tests can swap
/// implementations (e.g. a scripted fake engine instead of real processes).
pub struct AppContext {
    process: Box<dyn ProcessOps>,
    metrics: Box<dyn MetricsTransport>,
    pub config: EngineConfig,
    /// Pass `--dry-run` to backups.
    pub dry_run: bool,
}

impl AppContext {
    pub fn new(
        process: Box<dyn ProcessOps>,
        metrics: Box<dyn MetricsTransport>,
        config: EngineConfig,
    ) -> Self {
        Self {
            process,
            metrics,
            config,
            dry_run: false,
        }
    }

    /// Create a context with real subprocesses and HTTP metrics push.
    pub fn default_platform(config: EngineConfig) -> Self {
        Self::new(Box::new(StdProcess), Box::new(ReqwestTransport), config)
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn process(&self) -> &dyn ProcessOps {
        self.process.as_ref()
    }

    pub fn metrics(&self) -> &dyn MetricsTransport {
        self.metrics.as_ref()
    }
}
