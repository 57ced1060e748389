use std::collections::HashMap;

use crate::error::BridgeError;
use crate::snapshot::model::{CompositeKey, NodeKind, ReadableNode, ScopedRef, Snapshot};

/// One registered element.
#[derive(Debug, Clone)]
pub struct ElementEntry {
    pub eid: String,
    pub scoped: ScopedRef,
    pub kind: NodeKind,
    pub label: String,
    /// Consecutive snapshots this element has been absent from.
    pub missing_turns: u32,
    pub stale: bool,
}

/// Agent-facing element identity.
///
/// Interactive elements get short sequential eids (`e1`, `e2`, …) that stay
/// stable while the element's composite key persists across snapshots.
/// Readable non-interactive nodes, when requested, get content-hash ids
/// prefixed `rd-`. An eid goes stale after its element has been absent from
/// the most recent snapshot for `stale_turns` consecutive turns.
pub struct ElementRegistry {
    entries: HashMap<String, ElementEntry>,
    by_key: HashMap<CompositeKey, String>,
    next_interactive: u64,
    stale_turns: u32,
}

impl ElementRegistry {
    /// Registry with the configured staleness horizon.
    #[must_use]
    pub fn new(stale_turns: u32) -> Self {
        Self {
            entries: HashMap::new(),
            by_key: HashMap::new(),
            next_interactive: 1,
            stale_turns,
        }
    }

    /// Register a snapshot: mint or refresh eids for its nodes, age entries
    /// that are absent, and mark overdue ones stale.
    ///
    /// Interactive nodes always get eids; readable nodes only when
    /// `include_readable` is set.
    pub fn register_snapshot(&mut self, snapshot: &Snapshot, include_readable: bool) {
        let mut present: std::collections::HashSet<String> = std::collections::HashSet::new();

        for node in &snapshot.nodes {
            if node.kind.is_interactive() {
                let eid = self.assign_interactive(node, &snapshot.snapshot_id);
                present.insert(eid);
            } else if include_readable {
                let eid = format!("rd-{}", node.content_hash());
                self.entries.insert(
                    eid.clone(),
                    ElementEntry {
                        eid: eid.clone(),
                        scoped: node.scoped_ref(&snapshot.snapshot_id),
                        kind: node.kind,
                        label: node.label.clone(),
                        missing_turns: 0,
                        stale: false,
                    },
                );
                self.by_key.insert(node.key(), eid.clone());
                present.insert(eid);
            }
        }

        let stale_turns = self.stale_turns;
        for entry in self.entries.values_mut() {
            if present.contains(&entry.eid) {
                entry.missing_turns = 0;
                entry.stale = false;
            } else {
                entry.missing_turns += 1;
                if entry.missing_turns >= stale_turns {
                    entry.stale = true;
                }
            }
        }
    }

    fn assign_interactive(&mut self, node: &ReadableNode, snapshot_id: &str) -> String {
        let key = node.key();
        if let Some(existing) = self.by_key.get(&key).cloned() {
            if let Some(entry) = self.entries.get_mut(&existing) {
                entry.scoped = node.scoped_ref(snapshot_id);
                entry.label = node.label.clone();
                return existing;
            }
        }
        let eid = format!("e{}", self.next_interactive);
        self.next_interactive += 1;
        self.entries.insert(
            eid.clone(),
            ElementEntry {
                eid: eid.clone(),
                scoped: node.scoped_ref(snapshot_id),
                kind: node.kind,
                label: node.label.clone(),
                missing_turns: 0,
                stale: false,
            },
        );
        self.by_key.insert(key, eid.clone());
        eid
    }

    /// Resolve an eid to its entry.
    ///
    /// # Errors
    ///
    /// `ElementNotFound` for an unknown eid, `StaleElement` for one whose
    /// element has been gone past the staleness horizon.
    pub fn resolve(&self, eid: &str) -> Result<&ElementEntry, BridgeError> {
        let entry = self
            .entries
            .get(eid)
            .ok_or_else(|| BridgeError::ElementNotFound { eid: eid.to_owned() })?;
        if entry.stale {
            return Err(BridgeError::StaleElement {
                eid: eid.to_owned(),
                detail: format!("absent for {} turns", entry.missing_turns),
            });
        }
        Ok(entry)
    }

    /// The eid for a composite key, if registered.
    #[must_use]
    pub fn eid_for_key(&self, key: &CompositeKey) -> Option<&str> {
        self.by_key.get(key).map(String::as_str)
    }

    /// Number of live (non-stale) entries.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.entries.values().filter(|e| !e.stale).count()
    }

    /// Forget everything (full navigation).
    pub fn reset(&mut self) {
        self.entries.clear();
        self.by_key.clear();
        // eids are never reused, even across resets.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::model::test_support::{node, snapshot};

    #[test]
    fn interactive_nodes_get_sequential_eids() {
        let mut registry = ElementRegistry::new(3);
        let s = snapshot(
            1,
            vec![
                node(1, "Save", NodeKind::Button),
                node(2, "Cancel", NodeKind::Button),
                node(3, "Title", NodeKind::Heading),
            ],
        );
        registry.register_snapshot(&s, false);

        assert!(registry.resolve("e1").is_ok());
        assert!(registry.resolve("e2").is_ok());
        // Non-interactive nodes get nothing unless readable ids are requested.
        assert_eq!(registry.live_count(), 2);
    }

    #[test]
    fn eid_stays_stable_across_snapshots_for_same_key() {
        let mut registry = ElementRegistry::new(3);
        let s1 = snapshot(1, vec![node(1, "Save", NodeKind::Button)]);
        registry.register_snapshot(&s1, false);
        let eid_before = registry.eid_for_key(&s1.nodes[0].key()).unwrap().to_owned();

        let s2 = snapshot(2, vec![node(1, "Save", NodeKind::Button)]);
        registry.register_snapshot(&s2, false);
        let eid_after = registry.eid_for_key(&s2.nodes[0].key()).unwrap();

        assert_eq!(eid_before, eid_after);
        // The scoped ref now points at the newer snapshot.
        let entry = registry.resolve(&eid_before).unwrap();
        assert_eq!(entry.scoped.snapshot_id, s2.snapshot_id);
    }

    #[test]
    fn readable_nodes_get_content_hash_eids_on_request() {
        let mut registry = ElementRegistry::new(3);
        let s = snapshot(1, vec![node(5, "Welcome", NodeKind::Heading)]);
        registry.register_snapshot(&s, true);

        let eid = registry.eid_for_key(&s.nodes[0].key()).unwrap().to_owned();
        assert!(eid.starts_with("rd-"));
        assert!(registry.resolve(&eid).is_ok());
    }

    #[test]
    fn absence_ages_into_staleness() {
        let mut registry = ElementRegistry::new(2);
        let with_button = snapshot(1, vec![node(1, "Save", NodeKind::Button)]);
        registry.register_snapshot(&with_button, false);

        let without = snapshot(2, vec![node(9, "Elsewhere", NodeKind::Link)]);
        registry.register_snapshot(&without, false);
        // One missing turn: still resolvable.
        assert!(registry.resolve("e1").is_ok());

        let without2 = snapshot(3, vec![node(9, "Elsewhere", NodeKind::Link)]);
        registry.register_snapshot(&without2, false);
        // Two missing turns at horizon 2: stale.
        let err = registry.resolve("e1").unwrap_err();
        assert!(matches!(err, BridgeError::StaleElement { .. }));
    }

    #[test]
    fn reappearance_clears_aging() {
        let mut registry = ElementRegistry::new(2);
        registry.register_snapshot(&snapshot(1, vec![node(1, "Save", NodeKind::Button)]), false);
        registry.register_snapshot(&snapshot(2, vec![node(2, "Other", NodeKind::Link)]), false);
        registry.register_snapshot(&snapshot(3, vec![node(1, "Save", NodeKind::Button)]), false);

        let entry = registry.resolve("e1").unwrap();
        assert_eq!(entry.missing_turns, 0);
        assert!(!entry.stale);
    }

    #[test]
    fn unknown_eid_is_not_found() {
        let registry = ElementRegistry::new(3);
        assert!(matches!(
            registry.resolve("e99"),
            Err(BridgeError::ElementNotFound { .. })
        ));
    }

    #[test]
    fn reset_forgets_but_does_not_reuse_ids() {
        let mut registry = ElementRegistry::new(3);
        registry.register_snapshot(&snapshot(1, vec![node(1, "Save", NodeKind::Button)]), false);
        registry.reset();
        assert!(registry.resolve("e1").is_err());

        registry.register_snapshot(&snapshot(2, vec![node(2, "New", NodeKind::Button)]), false);
        // The new element gets e2, not a recycled e1.
        assert!(registry.resolve("e2").is_ok());
    }
}
