//! Snapshot records and tree nodes as emitted by the engine's JSON output.
//!
//! Records are taken verbatim; missing fields are tolerated and rendered with
//! [`UNKNOWN`] placeholders instead of failing the whole listing.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::traits::LineStream;

/// Placeholder shown for any field the engine did not provide.
pub const UNKNOWN: &str = "[unknown]";

const SHORT_ID_LEN: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub short_id: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub tree: Option<String>,
}

impl Snapshot {
    /// The engine's short id, or the first 8 characters of the full id.
    pub fn short_id(&self) -> &str {
        match self.short_id.as_deref() {
            Some(s) if !s.is_empty() => s,
            _ => {
                let end = self
                    .id
                    .char_indices()
                    .nth(SHORT_ID_LEN)
                    .map(|(i, _)| i)
                    .unwrap_or(self.id.len());
                &self.id[..end]
            }
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<FixedOffset>> {
        self.time.as_deref().and_then(parse_time)
    }

    pub fn hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or(UNKNOWN)
    }

    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or(UNKNOWN)
    }

    /// Local-agnostic `YYYY-mm-dd HH:MM:SS`, in the snapshot's own offset.
    pub fn display_time(&self) -> String {
        self.timestamp()
            .map(|t| format_time(&t))
            .unwrap_or_else(|| UNKNOWN.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    File,
    Dir,
    Symlink,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub path: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub node_type: NodeType,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub mtime: Option<String>,
}

/// Parse engine timestamps (RFC 3339 with optional nanoseconds).
pub fn parse_time(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s.trim()).ok()
}

pub fn format_time<Tz: chrono::TimeZone>(t: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

// ---------------------------------------------------------------------------
// Listing output
// ---------------------------------------------------------------------------

/// Parse the output of `snapshots --json`. `None` when the text is not a
/// JSON array of snapshot objects.
pub fn parse_snapshots(json: &str) -> Option<Vec<Snapshot>> {
    match serde_json::from_str::<Vec<Snapshot>>(json.trim()) {
        Ok(list) => Some(list),
        Err(e) => {
            tracing::warn!(error = %e, "malformed snapshot list from engine");
            None
        }
    }
}

/// One line of `ls --json` output.
#[derive(Debug, Clone, PartialEq)]
pub enum LsRecord {
    Snapshot(Snapshot),
    Node(TreeNode),
}

/// Classify one `ls --json` line. Both the legacy `struct_type` and the newer
/// `message_type` discriminators are accepted.
pub fn parse_ls_line(line: &str) -> Option<LsRecord> {
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    let kind = value
        .get("struct_type")
        .or_else(|| value.get("message_type"))
        .and_then(|v| v.as_str())?
        .to_string();
    match kind.as_str() {
        "snapshot" => serde_json::from_value(value).ok().map(LsRecord::Snapshot),
        "node" => serde_json::from_value(value).ok().map(LsRecord::Node),
        _ => None,
    }
}

/// Header plus a lazily-parsed node stream read from the live engine process.
pub struct SnapshotListing {
    pub snapshot: Snapshot,
    pub nodes: NodeStream,
}

impl std::fmt::Debug for SnapshotListing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotListing")
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}

impl SnapshotListing {
    /// Read the header line, leaving the rest of the stream untouched.
    /// Returns `None` when the stream is empty or the first record is not a
    /// snapshot header.
    pub fn from_lines(mut lines: LineStream) -> Option<Self> {
        let first = lines.by_ref().find(|l| !l.trim().is_empty())?;
        match parse_ls_line(&first) {
            Some(LsRecord::Snapshot(snapshot)) => Some(Self {
                snapshot,
                nodes: NodeStream { lines, skipped: 0 },
            }),
            _ => {
                tracing::warn!("engine listing did not start with a snapshot header");
                None
            }
        }
    }
}

pub struct NodeStream {
    lines: LineStream,
    skipped: usize,
}

impl NodeStream {
    /// Lines that could not be parsed as a node so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for NodeStream {
    type Item = TreeNode;

    fn next(&mut self) -> Option<TreeNode> {
        for line in self.lines.by_ref() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_ls_line(&line) {
                Some(LsRecord::Node(node)) => return Some(node),
                _ => {
                    self.skipped += 1;
                    tracing::debug!(line = %line, "skipping unparseable listing line");
                }
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Freshness
// ---------------------------------------------------------------------------

/// Whether the repository holds a recent enough snapshot. The three states
/// are rendered differently and must never be collapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "last_backup", rename_all = "snake_case")]
pub enum Freshness {
    Fresh(DateTime<FixedOffset>),
    Stale,
    Unreachable,
}

impl Freshness {
    /// Tri-state view: `Some(true)` fresh, `Some(false)` stale, `None`
    /// unreachable.
    pub fn as_option(&self) -> Option<bool> {
        match self {
            Freshness::Fresh(_) => Some(true),
            Freshness::Stale => Some(false),
            Freshness::Unreachable => None,
        }
    }

    /// Decide freshness from a snapshot list. `max_age_secs` is the minimum
    /// backup age from config; the newest parseable timestamp wins.
    pub fn evaluate(
        snapshots: &[Snapshot],
        now: DateTime<FixedOffset>,
        max_age_secs: u64,
    ) -> Freshness {
        let newest = snapshots.iter().filter_map(Snapshot::timestamp).max();
        let max_age = chrono::TimeDelta::try_seconds(i64::try_from(max_age_secs).unwrap_or(i64::MAX))
            .unwrap_or(chrono::TimeDelta::MAX);
        match newest {
            Some(t) if now.signed_duration_since(t) <= max_age => Freshness::Fresh(t),
            _ => Freshness::Stale,
        }
    }
}
