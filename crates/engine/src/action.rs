//! Action descriptors: the requests front-ends hand to the adapter.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::snapshot::{Freshness, Snapshot, SnapshotListing};

/// One engine operation. Serialized with an `action` tag so scripted callers
/// can submit plain JSON such as `{"action": "ls", "snapshot": "a2103ca8"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    List,
    Ls {
        snapshot: String,
    },
    Backup {
        #[serde(default)]
        force: bool,
    },
    Restore {
        snapshot: String,
        target: PathBuf,
        #[serde(default, rename = "restore-include")]
        includes: Vec<String>,
    },
    HasRecentSnapshots,
    #[serde(rename = "check-binary")]
    CheckBinary,
    Find {
        path: String,
    },
    Forget {
        snapshot: String,
    },
    Raw {
        command: String,
    },
}

impl Action {
    pub const NAMES: [&'static str; 9] = [
        "list",
        "ls",
        "backup",
        "restore",
        "has_recent_snapshots",
        "check-binary",
        "find",
        "forget",
        "raw",
    ];

    /// The descriptor's `action` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Action::List => "list",
            Action::Ls { .. } => "ls",
            Action::Backup { .. } => "backup",
            Action::Restore { .. } => "restore",
            Action::HasRecentSnapshots => "has_recent_snapshots",
            Action::CheckBinary => "check-binary",
            Action::Find { .. } => "find",
            Action::Forget { .. } => "forget",
            Action::Raw { .. } => "raw",
        }
    }

    /// Whether the action needs a configured repository before it can run.
    pub fn needs_repository(&self) -> bool {
        !matches!(self, Action::CheckBinary)
    }

    /// Whether the action mutates the repository or the local filesystem.
    pub fn is_destructive(&self) -> bool {
        matches!(self, Action::Restore { .. } | Action::Forget { .. })
    }

    pub fn from_json(value: serde_json::Value) -> Result<Action, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// What the adapter produced for an action. Failures the engine reports
/// (non-zero exit, malformed output) are folded into `None`/`false` values.
#[derive(Debug)]
pub enum ActionOutcome {
    Snapshots(Option<Vec<Snapshot>>),
    Listing(Option<SnapshotListing>),
    Success(bool),
    Freshness(Freshness),
    BinaryPresent(bool),
}

impl ActionOutcome {
    /// Truthiness the way the presentation layer reads it.
    pub fn is_success(&self) -> bool {
        match self {
            ActionOutcome::Snapshots(s) => s.is_some(),
            ActionOutcome::Listing(l) => l.is_some(),
            ActionOutcome::Success(ok) | ActionOutcome::BinaryPresent(ok) => *ok,
            ActionOutcome::Freshness(f) => !matches!(f, Freshness::Unreachable),
        }
    }
}
