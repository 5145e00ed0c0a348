//! Snapshot forest model and the two searches the restore path relies on.
//!
//! A machine's snapshot history is a forest: each root is a snapshot taken
//! without a parent, children are snapshots taken on top of it. Nodes own
//! their children; searches are pure functions returning borrowed nodes.

use std::fmt;

use chrono::{DateTime, Utc};

/// One node of a machine's snapshot forest.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Hypervisor handle used to address the snapshot on revert.
    pub id: String,
    pub name: String,
    pub description: String,
    pub created: DateTime<Utc>,
    pub state: String,
    /// Whether guest filesystems were frozen. Libvirt does not record it, so
    /// machines listed from libvirt always report `false`.
    pub quiesced: bool,
    pub children: Vec<Snapshot>,
}

impl Snapshot {
    pub fn new(name: impl Into<String>, created: DateTime<Utc>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            description: String::new(),
            created,
            state: String::new(),
            quiesced: false,
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<Snapshot>) -> Self {
        self.children = children;
        self
    }
}

/// A machine in the inventory with its snapshot forest.
#[derive(Debug, Clone, PartialEq)]
pub struct Machine {
    pub name: String,
    pub snapshots: Vec<Snapshot>,
}

impl Machine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            snapshots: Vec::new(),
        }
    }

    /// Total snapshot count across the whole forest.
    pub fn snapshot_count(&self) -> usize {
        fn count(nodes: &[Snapshot]) -> usize {
            nodes.iter().map(|s| 1 + count(&s.children)).sum()
        }
        count(&self.snapshots)
    }
}

/// Which snapshot a restore should revert to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotSelector {
    Named(String),
    Latest,
}

impl SnapshotSelector {
    pub fn from_config(name: Option<&str>) -> Self {
        match name {
            Some(n) if !n.is_empty() => SnapshotSelector::Named(n.to_string()),
            _ => SnapshotSelector::Latest,
        }
    }

    pub fn select<'a>(&self, forest: &'a [Snapshot]) -> Option<&'a Snapshot> {
        match self {
            SnapshotSelector::Named(name) => find_by_name(forest, name),
            SnapshotSelector::Latest => find_latest(forest),
        }
    }
}

impl fmt::Display for SnapshotSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotSelector::Named(name) => f.write_str(name),
            SnapshotSelector::Latest => f.write_str("<latest>"),
        }
    }
}

/// Depth-first, pre-order search for the first snapshot named `name`.
pub fn find_by_name<'a>(forest: &'a [Snapshot], name: &str) -> Option<&'a Snapshot> {
    for snapshot in forest {
        if snapshot.name == name {
            return Some(snapshot);
        }
        if let Some(found) = find_by_name(&snapshot.children, name) {
            return Some(found);
        }
    }
    None
}

/// Pick the newest root, then keep descending into the newest child of the
/// current pick until a leaf is reached.
///
/// A node is never compared with its own descendants, so the result can be
/// older than a sibling root that was passed over.
pub fn find_latest(forest: &[Snapshot]) -> Option<&Snapshot> {
    let mut current = newest(forest)?;
    while let Some(child) = newest(&current.children) {
        current = child;
    }
    Some(current)
}

/// First node with the maximum creation time among `nodes`.
fn newest(nodes: &[Snapshot]) -> Option<&Snapshot> {
    nodes.iter().fold(None, |best: Option<&Snapshot>, s| match best {
        Some(b) if s.created <= b.created => Some(b),
        _ => Some(s),
    })
}

/// Flatten the forest in pre-order, paired with each node's depth.
pub fn walk(forest: &[Snapshot]) -> Vec<(usize, &Snapshot)> {
    fn visit<'a>(nodes: &'a [Snapshot], depth: usize, out: &mut Vec<(usize, &'a Snapshot)>) {
        for node in nodes {
            out.push((depth, node));
            visit(&node.children, depth + 1, out);
        }
    }
    let mut out = Vec::new();
    visit(forest, 0, &mut out);
    out
}
