//! Libvirt `<domainsnapshot>` documents turned into a snapshot forest.

use std::collections::{HashMap, HashSet};

use chrono::DateTime;
use facet::Facet;

use crate::error::LabError;
use crate::snapshot::Snapshot;

// ── XML model structs ──────────────────────────────────────

#[derive(Debug, Default, Facet)]
#[facet(rename = "domainsnapshot")]
#[facet(default)]
struct SnapshotDef {
    #[facet(default)]
    name: String,
    #[facet(default)]
    description: String,
    #[facet(default)]
    state: String,
    #[facet(default)]
    parent: Option<ParentRef>,
    #[facet(rename = "creationTime")]
    #[facet(default)]
    creation_time: i64,
}

#[derive(Debug, Default, Facet)]
#[facet(default)]
struct ParentRef {
    #[facet(default)]
    name: String,
}

/// One snapshot as libvirt describes it, before linking to its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatSnapshot {
    pub parent: Option<String>,
    pub snapshot: Snapshot,
}

pub fn parse_snapshot_xml(xml: &str) -> Result<FlatSnapshot, LabError> {
    let def: SnapshotDef = facet_xml::from_str(xml).map_err(|e| LabError::Inventory {
        message: format!("unreadable snapshot XML: {e}"),
        hint: "check `virsh snapshot-dumpxml` for this domain".into(),
    })?;
    if def.name.is_empty() {
        return Err(LabError::Inventory {
            message: "snapshot XML has no name".into(),
            hint: "check `virsh snapshot-dumpxml` for this domain".into(),
        });
    }
    let created = DateTime::from_timestamp(def.creation_time, 0).unwrap_or_default();

    let mut snapshot = Snapshot::new(def.name, created);
    snapshot.description = def.description.trim().to_string();
    snapshot.state = def.state;
    // Snapshot XML does not record whether the guest filesystems were frozen.
    snapshot.quiesced = false;
    Ok(FlatSnapshot {
        parent: def.parent.map(|p| p.name).filter(|n| !n.is_empty()),
        snapshot,
    })
}

/// Link flat snapshots into a forest, keeping listing order among siblings.
/// A snapshot whose parent is missing from the listing becomes a root.
pub fn build_forest(flat: Vec<FlatSnapshot>) -> Vec<Snapshot> {
    let known: HashSet<String> = flat.iter().map(|f| f.snapshot.name.clone()).collect();

    let mut roots = Vec::new();
    let mut by_parent: HashMap<String, Vec<Snapshot>> = HashMap::new();
    for f in flat {
        match f.parent {
            Some(p) if known.contains(&p) => by_parent.entry(p).or_default().push(f.snapshot),
            _ => roots.push(f.snapshot),
        }
    }

    fn attach(node: &mut Snapshot, by_parent: &mut HashMap<String, Vec<Snapshot>>) {
        if let Some(mut kids) = by_parent.remove(&node.name) {
            for kid in &mut kids {
                attach(kid, by_parent);
            }
            node.children = kids;
        }
    }

    for root in &mut roots {
        attach(root, &mut by_parent);
    }
    roots
}
