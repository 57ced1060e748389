use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::snapshot::{CompositeKey, ReadableNode, ScopedRef, Snapshot};

/// What the state machine remembers about a node between turns: enough to
/// recover its scoped ref and detect content changes after the node is gone.
#[derive(Debug, Clone)]
pub struct KnownNode {
    pub scoped: ScopedRef,
    pub content_hash: String,
    pub label: String,
}

/// Composite-key index of known nodes.
pub type KnownMap = HashMap<CompositeKey, KnownNode>;

/// Build the known-node map for a node list captured in `snapshot_id`.
#[must_use]
pub fn known_map(snapshot_id: &str, nodes: &[ReadableNode]) -> KnownMap {
    nodes
        .iter()
        .map(|node| {
            (
                node.key(),
                KnownNode {
                    scoped: node.scoped_ref(snapshot_id),
                    content_hash: node.content_hash(),
                    label: node.label.clone(),
                },
            )
        })
        .collect()
}

/// Build the known-node map for a whole snapshot.
#[must_use]
pub fn known_map_of(snapshot: &Snapshot) -> KnownMap {
    known_map(&snapshot.snapshot_id, &snapshot.nodes)
}

/// What changed about a surviving node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// The visible label changed.
    Label,
    /// The label survived but state or attributes changed.
    Content,
}

/// A node present in both snapshots whose content hash moved.
#[derive(Debug, Clone, Serialize)]
pub struct Modified {
    #[serde(rename = "ref")]
    pub node_ref: ScopedRef,
    pub previous_label: String,
    pub current_label: String,
    pub change_kind: ChangeKind,
}

/// An incremental difference between two snapshots of the same context.
#[derive(Debug, Clone, Serialize)]
pub struct Delta {
    pub added: Vec<ReadableNode>,
    pub removed: Vec<ScopedRef>,
    pub modified: Vec<Modified>,
    pub confidence: f64,
}

impl Delta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    #[must_use]
    pub fn change_count(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }
}

/// Diff a known-node map against a fresh node list.
///
/// - `added`: fresh keys absent from the map.
/// - `removed`: map keys absent from the fresh set, with scoped refs
///   recovered from the map (the map is the only place they survive).
/// - `modified`: keys present in both whose content hash differs.
#[must_use]
pub fn diff(known: &KnownMap, fresh_snapshot_id: &str, fresh_nodes: &[ReadableNode]) -> Delta {
    let fresh_keys: HashSet<CompositeKey> = fresh_nodes.iter().map(ReadableNode::key).collect();

    let mut added = Vec::new();
    let mut modified = Vec::new();
    for node in fresh_nodes {
        let key = node.key();
        match known.get(&key) {
            None => added.push(node.clone()),
            Some(previous) => {
                let current_hash = node.content_hash();
                if current_hash != previous.content_hash {
                    let change_kind = if node.label == previous.label {
                        ChangeKind::Content
                    } else {
                        ChangeKind::Label
                    };
                    modified.push(Modified {
                        node_ref: node.scoped_ref(fresh_snapshot_id),
                        previous_label: previous.label.clone(),
                        current_label: node.label.clone(),
                        change_kind,
                    });
                }
            }
        }
    }

    let removed: Vec<ScopedRef> = known
        .iter()
        .filter(|(key, _)| !fresh_keys.contains(key))
        .map(|(_, node)| node.scoped.clone())
        .collect();

    let confidence = confidence(added.len(), removed.len(), modified.len(), fresh_nodes.len());
    Delta {
        added,
        removed,
        modified,
        confidence,
    }
}

/// Delta confidence.
///
/// `confidence = 1 / (1 + changes / max(new_count, 1))` where
/// `changes = |added| + |removed| + |modified|`.
///
/// Properties: strictly decreasing in `changes`, non-decreasing in
/// `new_count`, equal to 1 for an empty delta, and bounded in (0, 1].
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn confidence(added: usize, removed: usize, modified: usize, new_count: usize) -> f64 {
    let changes = (added + removed + modified) as f64;
    let scale = new_count.max(1) as f64;
    1.0 / (1.0 + changes / scale)
}

/// Whether a delta is safe to send, or the change volume suggests the maps
/// have desynchronized. Deterministic and side-effect free.
///
/// A fully emptied context (`new_count == 0`) is always reliable: removing
/// everything is a legitimate delta. Otherwise the delta must clear the
/// confidence floor and the change volume must stay within three times the
/// fresh node count.
#[must_use]
pub fn is_reliable(added: usize, removed: usize, modified: usize, new_count: usize) -> bool {
    if new_count == 0 {
        return true;
    }
    let changes = added + removed + modified;
    confidence(added, removed, modified, new_count) >= 0.35 && changes <= new_count.saturating_mul(3)
}
