//! Browse tree for a snapshot listing.
//!
//! Nodes arrive in whatever order the engine emits them. Parents are
//! inferred from the path string, so a child whose directory record is
//! missing (or arrives later) still lands under the right key.

use serde::Serialize;
use std::collections::HashMap;

use crate::snapshot::{format_time, parse_time, NodeType, TreeNode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeEntry {
    /// Tree key: the node path without its leading `/`, case-folded when the
    /// tree is case-insensitive.
    pub key: String,
    /// Display name, original case.
    pub name: String,
    pub node_type: NodeType,
    /// Human-readable size; empty for directories.
    pub size: String,
    /// `YYYY-mm-dd HH:MM:SS`, empty when unknown.
    pub mtime: String,
    /// Directory created only because a descendant referenced it.
    pub implied: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SnapshotTree {
    entries: HashMap<String, TreeEntry>,
    children: HashMap<String, Vec<String>>,
    case_insensitive: bool,
}

impl SnapshotTree {
    /// Tree using the host platform's path case rules.
    pub fn new() -> Self {
        Self::with_case_insensitive(cfg!(windows))
    }

    pub fn with_case_insensitive(case_insensitive: bool) -> Self {
        Self {
            case_insensitive,
            ..Default::default()
        }
    }

    pub fn from_nodes(nodes: impl IntoIterator<Item = TreeNode>) -> Self {
        let mut tree = Self::new();
        tree.extend(nodes);
        tree
    }

    fn key_for(&self, path: &str) -> String {
        let key = path.trim_start_matches('/').trim_end_matches('/');
        if self.case_insensitive {
            key.to_lowercase()
        } else {
            key.to_string()
        }
    }

    pub fn insert(&mut self, node: TreeNode) {
        let key = self.key_for(&node.path);
        if key.is_empty() {
            return;
        }
        let mtime = node
            .mtime
            .as_deref()
            .and_then(parse_time)
            .map(|t| format_time(&t))
            .unwrap_or_default();
        let name = if node.name.is_empty() {
            base_name(&key).to_string()
        } else {
            node.name
        };

        match node.node_type {
            NodeType::Dir => {
                if let Some(existing) = self.entries.get_mut(&key) {
                    if existing.implied {
                        existing.name = name;
                        existing.mtime = mtime;
                        existing.implied = false;
                    }
                    return;
                }
                self.add(TreeEntry {
                    key,
                    name,
                    node_type: NodeType::Dir,
                    size: String::new(),
                    mtime,
                    implied: false,
                });
            }
            kind => {
                let size = node.size.map(format_bytes).unwrap_or_default();
                self.add(TreeEntry {
                    key,
                    name,
                    node_type: kind,
                    size,
                    mtime,
                    implied: false,
                });
            }
        }
    }

    fn add(&mut self, entry: TreeEntry) {
        let parent = parent_key(&entry.key).to_string();
        self.ensure_dir(&parent);
        let key = entry.key.clone();
        if self.entries.insert(key.clone(), entry).is_none() {
            self.children.entry(parent).or_default().push(key);
        }
    }

    fn ensure_dir(&mut self, key: &str) {
        if key.is_empty() || self.entries.contains_key(key) {
            return;
        }
        self.add(TreeEntry {
            key: key.to_string(),
            name: base_name(key).to_string(),
            node_type: NodeType::Dir,
            size: String::new(),
            mtime: String::new(),
            implied: true,
        });
    }

    /// Look up by path; accepts keys with or without the leading `/`.
    pub fn get(&self, path: &str) -> Option<&TreeEntry> {
        self.entries.get(&self.key_for(path))
    }

    pub fn children(&self, path: &str) -> Vec<&TreeEntry> {
        self.children
            .get(&self.key_for(path))
            .map(|keys| keys.iter().filter_map(|k| self.entries.get(k)).collect())
            .unwrap_or_default()
    }

    pub fn roots(&self) -> Vec<&TreeEntry> {
        self.children("")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Depth-first walk in insertion order, with depth (roots are 0).
    pub fn walk(&self) -> Vec<(usize, &TreeEntry)> {
        let mut out = Vec::with_capacity(self.entries.len());
        let mut stack: Vec<(usize, &TreeEntry)> =
            self.roots().into_iter().rev().map(|e| (0, e)).collect();
        while let Some((depth, entry)) = stack.pop() {
            out.push((depth, entry));
            stack.extend(
                self.children(&entry.key)
                    .into_iter()
                    .rev()
                    .map(|c| (depth + 1, c)),
            );
        }
        out
    }
}

impl Extend<TreeNode> for SnapshotTree {
    fn extend<I: IntoIterator<Item = TreeNode>>(&mut self, iter: I) {
        for node in iter {
            self.insert(node);
        }
    }
}

fn parent_key(key: &str) -> &str {
    key.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
}

fn base_name(key: &str) -> &str {
    key.rsplit_once('/').map(|(_, n)| n).unwrap_or(key)
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(path: &str, kind: NodeType, size: Option<u64>) -> TreeNode {
        TreeNode {
            path: path.into(),
            name: path.rsplit('/').next().unwrap_or_default().into(),
            node_type: kind,
            size,
            mtime: Some("2022-12-28T19:58:51.85719+01:00".into()),
        }
    }

    #[test]
    fn test_parent_inferred_from_child() {
        let mut tree = SnapshotTree::with_case_insensitive(false);
        tree.insert(node("/a/b.txt", NodeType::File, Some(3)));
        let a = tree.get("a").expect("implied parent");
        assert_eq!(a.node_type, NodeType::Dir);
        assert!(a.implied);
        assert_eq!(tree.children("a")[0].name, "b.txt");

        // The real record later fills in the implied directory.
        tree.insert(node("/a", NodeType::Dir, None));
        let a = tree.get("/a").unwrap();
        assert!(!a.implied);
        assert_eq!(a.mtime, "2022-12-28 19:58:51");
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.roots().len(), 1);
    }

    #[test]
    fn test_order_independent() {
        let mut forward = SnapshotTree::with_case_insensitive(false);
        forward.extend([
            node("/a", NodeType::Dir, None),
            node("/a/b.txt", NodeType::File, Some(1)),
        ]);
        let mut backward = SnapshotTree::with_case_insensitive(false);
        backward.extend([
            node("/a/b.txt", NodeType::File, Some(1)),
            node("/a", NodeType::Dir, None),
        ]);
        assert_eq!(forward.get("a"), backward.get("a"));
        assert_eq!(forward.get("a/b.txt"), backward.get("a/b.txt"));
    }

    #[test]
    fn test_deep_implied_chain() {
        let mut tree = SnapshotTree::with_case_insensitive(false);
        tree.insert(node("/C/GIT/Lib/x.py", NodeType::File, Some(2103)));
        let walked: Vec<(usize, &str)> = tree
            .walk()
            .into_iter()
            .map(|(d, e)| (d, e.key.as_str()))
            .collect();
        assert_eq!(
            walked,
            vec![(0, "C"), (1, "C/GIT"), (2, "C/GIT/Lib"), (3, "C/GIT/Lib/x.py")]
        );
        assert_eq!(tree.get("C/GIT/Lib/x.py").unwrap().size, "2.1 KiB");
    }

    #[test]
    fn test_case_insensitive_keys_keep_display_case() {
        let mut tree = SnapshotTree::with_case_insensitive(true);
        tree.insert(node("/C/Users", NodeType::Dir, None));
        tree.insert(node("/c/users/notes.txt", NodeType::File, Some(10)));
        assert_eq!(tree.roots().len(), 1);
        assert_eq!(tree.get("/C/USERS").unwrap().name, "Users");
        assert_eq!(tree.children("c/users").len(), 1);
    }

    #[test]
    fn test_trailing_slash_dir() {
        let mut tree = SnapshotTree::with_case_insensitive(false);
        tree.insert(node("/a/b.txt", NodeType::File, Some(3)));
        tree.insert(node("/a/", NodeType::Dir, None));
        assert_eq!(tree.len(), 2);
        assert!(!tree.get("a").unwrap().implied);
    }

    #[test]
    fn test_duplicate_dir_ignored() {
        let mut tree = SnapshotTree::with_case_insensitive(false);
        tree.insert(node("/a", NodeType::Dir, None));
        tree.insert(node("/a", NodeType::Dir, None));
        assert_eq!(tree.roots().len(), 1);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }
}
