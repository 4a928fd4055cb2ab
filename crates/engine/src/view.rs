//! View models the presentation layer renders.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

use crate::snapshot::{format_time, Freshness, Snapshot};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRow {
    pub id: String,
    pub short_id: String,
    pub label: String,
}

pub fn snapshot_label(s: &Snapshot) -> String {
    format!(
        "Backup from {} run as {}@{} [ID {}]",
        s.display_time(),
        s.username(),
        s.hostname(),
        s.short_id()
    )
}

/// Rows for the snapshot list, newest first. The engine emits oldest first.
pub fn snapshot_rows(snapshots: &[Snapshot]) -> Vec<SnapshotRow> {
    snapshots
        .iter()
        .rev()
        .map(|s| SnapshotRow {
            id: s.id.clone(),
            short_id: s.short_id().to_string(),
            label: snapshot_label(s),
        })
        .collect()
}

/// Recover the snapshot id embedded in a row label.
pub fn snapshot_id_from_label(label: &str) -> Option<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\[ID (.*)\]").expect("static regex"));
    re.captures(label)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|id| !id.is_empty())
}

/// Caption of the browse window.
pub fn listing_header(s: &Snapshot) -> String {
    format!(
        "Backup content from {} run as {}@{} identified by {}",
        s.display_time(),
        s.username(),
        s.hostname(),
        s.short_id()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBadge {
    UpToDate,
    TooOld,
    NotConnected,
}

impl StateBadge {
    pub fn text(&self) -> &'static str {
        match self {
            StateBadge::UpToDate => "Up to date",
            StateBadge::TooOld => "Too old",
            StateBadge::NotConnected => "Not connected",
        }
    }

    /// Background colour name (Tk palette).
    pub fn color(&self) -> &'static str {
        match self {
            StateBadge::UpToDate => "springgreen4",
            StateBadge::TooOld => "darkred",
            StateBadge::NotConnected => "darkgrey",
        }
    }
}

impl From<Freshness> for StateBadge {
    fn from(f: Freshness) -> Self {
        match f {
            Freshness::Fresh(_) => StateBadge::UpToDate,
            Freshness::Stale => StateBadge::TooOld,
            Freshness::Unreachable => StateBadge::NotConnected,
        }
    }
}

impl std::fmt::Display for StateBadge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.text())
    }
}

/// Badge line with the last backup time when known.
pub fn state_summary(f: &Freshness) -> String {
    match f {
        Freshness::Fresh(t) => format!("{} (last backup {})", StateBadge::from(*f), format_time(t)),
        _ => StateBadge::from(*f).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::parse_snapshots;

    #[test]
    fn test_rows_newest_first() {
        let list = parse_snapshots(
            r#"[
              {"id":"1111111111","time":"2023-01-01T00:00:00Z","hostname":"h","username":"u"},
              {"id":"2222222222","time":"2023-01-02T00:00:00Z","hostname":"h","username":"u"},
              {"id":"3333333333","time":"2023-01-03T00:00:00Z","hostname":"h","username":"u"}
            ]"#,
        )
        .unwrap();
        let ids: Vec<String> = snapshot_rows(&list).into_iter().map(|r| r.short_id).collect();
        assert_eq!(ids, vec!["33333333", "22222222", "11111111"]);
    }

    #[test]
    fn test_label_round_trip() {
        let s = Snapshot {
            id: "a2103ca811e8b081".into(),
            short_id: Some("a2103ca8".into()),
            time: Some("2023-01-03T00:16:13.6256884+01:00".into()),
            hostname: Some("UNIMATRIX0".into()),
            username: Some("orsiris".into()),
            ..Default::default()
        };
        let label = snapshot_label(&s);
        assert_eq!(
            label,
            "Backup from 2023-01-03 00:16:13 run as orsiris@UNIMATRIX0 [ID a2103ca8]"
        );
        assert_eq!(snapshot_id_from_label(&label), Some("a2103ca8"));
        assert_eq!(snapshot_id_from_label("no id here"), None);
        assert_eq!(
            listing_header(&s),
            "Backup content from 2023-01-03 00:16:13 run as orsiris@UNIMATRIX0 identified by a2103ca8"
        );
    }

    #[test]
    fn test_missing_fields_use_placeholders() {
        let s = Snapshot {
            id: "abcdef0123".into(),
            ..Default::default()
        };
        assert_eq!(
            snapshot_label(&s),
            "Backup from [unknown] run as [unknown]@[unknown] [ID abcdef01]"
        );
    }

    #[test]
    fn test_badges_are_distinct() {
        let t = crate::snapshot::parse_time("2023-01-03T00:00:00Z").unwrap();
        let badges = [
            StateBadge::from(Freshness::Fresh(t)),
            StateBadge::from(Freshness::Stale),
            StateBadge::from(Freshness::Unreachable),
        ];
        assert_eq!(
            badges,
            [StateBadge::UpToDate, StateBadge::TooOld, StateBadge::NotConnected]
        );
        assert_eq!(badges[0].color(), "springgreen4");
        assert_eq!(
            state_summary(&Freshness::Fresh(t)),
            "Up to date (last backup 2023-01-03 00:00:00)"
        );
        assert_eq!(state_summary(&Freshness::Unreachable), "Not connected");
    }
}
