use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::delta::diff::{KnownMap, known_map};
use crate::snapshot::{CompositeKey, NodeKind, ReadableNode, ScopedRef, Snapshot};

/// Kind of layered surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayType {
    Modal,
    Dialog,
    Dropdown,
}

/// Class-name fragments that, combined with a high z-index, mark an element
/// as an overlay (rule 4).
const OVERLAY_CLASS_PATTERNS: &[&str] = &["modal", "dialog", "overlay", "popup", "dropdown-menu"];

/// Minimum z-index for the class-pattern rule.
const OVERLAY_Z_INDEX_FLOOR: i32 = 1000;

/// An overlay root found in a fresh snapshot.
#[derive(Debug, Clone)]
pub struct DetectedOverlay {
    pub root_key: CompositeKey,
    pub overlay_type: OverlayType,
    pub confidence: f64,
    pub z_index: Option<i32>,
    /// Position of the root in the snapshot's node order.
    pub dom_index: usize,
}

/// One layer of the overlay stack.
#[derive(Debug, Clone)]
pub struct OverlayState {
    pub root_ref: ScopedRef,
    pub overlay_type: OverlayType,
    pub confidence: f64,
    pub content_hash: String,
    /// The overlay's portion of the snapshot it was captured from.
    pub slice: Vec<ReadableNode>,
    /// Refs handed out for the slice, built from the slice nodes' stored
    /// loader ids at capture time. Invalidated wholesale when the overlay
    /// closes, regardless of current loader identity.
    pub captured_refs: Vec<ScopedRef>,
    /// Composite-key map over the slice, for content diffs.
    pub known_nodes: KnownMap,
    pub z_index: Option<i32>,
}

/// Detection rules, applied per node in order; first match wins.
///
/// 1. ARIA dialog/alertdialog with `aria-modal="true"`: modal, 1.0.
/// 2. ARIA dialog/alertdialog without modal: dialog, 0.9.
/// 3. Node kind dialog (no ARIA role attribute): dialog, 0.85.
/// 4. Overlay class pattern with z-index >= 1000: modal/dropdown, 0.7.
///    An unknown z-index compares as 0, so this rule never fires on nodes
///    whose stacking is unknown.
#[must_use]
pub fn detect_node_overlay(node: &ReadableNode, dom_index: usize) -> Option<DetectedOverlay> {
    let attributes = node.attributes.as_ref();
    let role = attributes.and_then(|a| a.get("role")).map(String::as_str);
    let aria_dialog = matches!(role, Some("dialog" | "alertdialog"));
    let aria_modal =
        attributes.and_then(|a| a.get("aria-modal")).map(String::as_str) == Some("true");
    let z_index = node.layout.z_index;

    let (overlay_type, confidence) = if aria_dialog && aria_modal {
        (OverlayType::Modal, 1.0)
    } else if aria_dialog {
        (OverlayType::Dialog, 0.9)
    } else if node.kind == NodeKind::Dialog {
        (OverlayType::Dialog, 0.85)
    } else {
        let class = attributes.and_then(|a| a.get("class")).map(String::as_str)?;
        let matched = OVERLAY_CLASS_PATTERNS
            .iter()
            .find(|pattern| class.contains(*pattern))?;
        if z_index.unwrap_or(0) < OVERLAY_Z_INDEX_FLOOR {
            return None;
        }
        let overlay_type = if *matched == "dropdown-menu" {
            OverlayType::Dropdown
        } else {
            OverlayType::Modal
        };
        (overlay_type, 0.7)
    };

    Some(DetectedOverlay {
        root_key: node.key(),
        overlay_type,
        confidence,
        z_index,
        dom_index,
    })
}

/// All overlay roots in a snapshot, ordered bottom-to-top: ascending
/// z-index, ties broken by DOM order. The last element is the active layer.
#[must_use]
pub fn detect_overlays(snapshot: &Snapshot) -> Vec<DetectedOverlay> {
    let mut detected: Vec<DetectedOverlay> = snapshot
        .nodes
        .iter()
        .enumerate()
        .filter_map(|(index, node)| detect_node_overlay(node, index))
        .collect();
    detected.sort_by_key(|d| (d.z_index.unwrap_or(0), d.dom_index));
    detected
}

/// Structural transition between the detected overlays and the stack.
#[derive(Debug, Clone)]
pub enum OverlayTransition {
    /// Same layer count and same top.
    None,
    /// More layers than the stack: the topmost detected overlay opened.
    Opened(DetectedOverlay),
    /// Fewer layers than the stack: the top closed.
    Closed,
    /// Same count, different top: the top was swapped.
    Replaced(DetectedOverlay),
}

/// Compare detection output against the current stack's root keys
/// (bottom-to-top).
#[must_use]
pub fn diff_against_stack(
    detected: &[DetectedOverlay],
    stack_roots: &[CompositeKey],
) -> OverlayTransition {
    match detected.len().cmp(&stack_roots.len()) {
        std::cmp::Ordering::Greater => {
            // The topmost detected overlay the stack does not know yet. With
            // several new layers in one turn, layers open one per turn.
            match detected
                .iter()
                .rev()
                .find(|d| !stack_roots.contains(&d.root_key))
                .or(detected.last())
            {
                Some(top) => OverlayTransition::Opened(top.clone()),
                None => OverlayTransition::None,
            }
        }
        std::cmp::Ordering::Less => OverlayTransition::Closed,
        std::cmp::Ordering::Equal => {
            match (detected.last(), stack_roots.last()) {
                (Some(top), Some(stack_top)) if top.root_key != *stack_top => {
                    OverlayTransition::Replaced(top.clone())
                }
                _ => OverlayTransition::None,
            }
        }
    }
}

/// The overlay portion of a snapshot: nodes in the dialog region or of
/// dialog kind. Region doubles as the membership test here; see DESIGN.md
/// before changing this.
#[must_use]
pub fn overlay_slice(snapshot: &Snapshot) -> Vec<ReadableNode> {
    snapshot
        .nodes
        .iter()
        .filter(|n| n.is_dialog_layer())
        .cloned()
        .collect()
}

/// The base-page portion of a snapshot (complement of [`overlay_slice`]).
#[must_use]
pub fn non_overlay_slice(snapshot: &Snapshot) -> Vec<ReadableNode> {
    snapshot
        .nodes
        .iter()
        .filter(|n| !n.is_dialog_layer())
        .cloned()
        .collect()
}

/// Content hash over an overlay slice.
#[must_use]
pub fn slice_content_hash(slice: &[ReadableNode]) -> String {
    let mut hasher = Sha256::new();
    for node in slice {
        hasher.update(node.content_hash().as_bytes());
        hasher.update([0x1e]);
    }
    let digest = hasher.finalize();
    use std::fmt::Write;
    let mut s = String::with_capacity(16);
    for b in digest.iter().take(8) {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Build the stack entry for a newly opened (or replacing) overlay.
///
/// `captured_refs` are derived from the slice nodes' own stored loader ids,
/// never re-synthesized from the live frame state.
#[must_use]
pub fn build_overlay_state(detected: &DetectedOverlay, snapshot: &Snapshot) -> OverlayState {
    let slice = overlay_slice(snapshot);
    let captured_refs: Vec<ScopedRef> = slice
        .iter()
        .map(|n| n.scoped_ref(&snapshot.snapshot_id))
        .collect();
    let known_nodes = known_map(&snapshot.snapshot_id, &slice);
    let root_ref = ScopedRef {
        snapshot_id: snapshot.snapshot_id.clone(),
        frame_id: detected.root_key.frame_id.clone(),
        loader_id: detected.root_key.loader_id.clone(),
        backend_node_id: detected.root_key.backend_node_id,
    };
    OverlayState {
        root_ref,
        overlay_type: detected.overlay_type,
        confidence: detected.confidence,
        content_hash: slice_content_hash(&slice),
        slice,
        captured_refs,
        known_nodes,
        z_index: detected.z_index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::test_support::{node, snapshot};
    use std::collections::HashMap;

    fn dialog_node(backend: i64, label: &str, modal: bool) -> ReadableNode {
        let mut n = node(backend, label, NodeKind::Dialog);
        let mut attributes = HashMap::new();
        attributes.insert("role".to_owned(), "dialog".to_owned());
        if modal {
            attributes.insert("aria-modal".to_owned(), "true".to_owned());
        }
        n.attributes = Some(attributes);
        n
    }

    fn classed_node(backend: i64, class: &str, z_index: Option<i32>) -> ReadableNode {
        let mut n = node(backend, "panel", NodeKind::Other);
        let mut attributes = HashMap::new();
        attributes.insert("class".to_owned(), class.to_owned());
        n.attributes = Some(attributes);
        n.layout.z_index = z_index;
        n
    }

    #[test]
    fn rule1_modal_dialog() {
        let n = dialog_node(1, "Confirm", true);
        let d = detect_node_overlay(&n, 0).unwrap();
        assert_eq!(d.overlay_type, OverlayType::Modal);
        assert!((d.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rule2_nonmodal_aria_dialog() {
        let n = dialog_node(1, "Hint", false);
        let d = detect_node_overlay(&n, 0).unwrap();
        assert_eq!(d.overlay_type, OverlayType::Dialog);
        assert!((d.confidence - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn rule3_dialog_kind_without_aria_role() {
        // A <dialog> element surfaces as kind=dialog without a role attr.
        let n = node(1, "Native", NodeKind::Dialog);
        let d = detect_node_overlay(&n, 0).unwrap();
        assert_eq!(d.overlay_type, OverlayType::Dialog);
        assert!((d.confidence - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn rule4_class_with_high_z_index() {
        let d = detect_node_overlay(&classed_node(1, "app-modal fade", Some(2000)), 0).unwrap();
        assert_eq!(d.overlay_type, OverlayType::Modal);
        assert!((d.confidence - 0.7).abs() < f64::EPSILON);

        let d = detect_node_overlay(&classed_node(2, "dropdown-menu show", Some(1500)), 1).unwrap();
        assert_eq!(d.overlay_type, OverlayType::Dropdown);
    }

    #[test]
    fn rule4_never_fires_with_unknown_z_index() {
        // Unknown z-index compares as 0; the rule stays silent.
        assert!(detect_node_overlay(&classed_node(1, "app-modal", None), 0).is_none());
        assert!(detect_node_overlay(&classed_node(1, "app-modal", Some(999)), 0).is_none());
    }

    #[test]
    fn plain_nodes_are_not_overlays() {
        assert!(detect_node_overlay(&node(1, "Save", NodeKind::Button), 0).is_none());
    }

    #[test]
    fn detection_orders_by_z_then_dom() {
        let mut low = dialog_node(1, "Low", false);
        low.layout.z_index = Some(100);
        let mut high = dialog_node(2, "High", false);
        high.layout.z_index = Some(5000);
        let tie = dialog_node(3, "Tie", false); // z unknown → 0

        let s = snapshot(1, vec![high.clone(), low.clone(), tie.clone()]);
        let detected = detect_overlays(&s);
        assert_eq!(detected.len(), 3);
        // Bottom-to-top: unknown-z first, then 100, then 5000 on top.
        assert_eq!(detected[0].root_key.backend_node_id, 3);
        assert_eq!(detected[1].root_key.backend_node_id, 1);
        assert_eq!(detected[2].root_key.backend_node_id, 2);
    }

    #[test]
    fn stack_diff_detects_open_close_replace() {
        let s = snapshot(1, vec![dialog_node(1, "A", true)]);
        let detected = detect_overlays(&s);
        assert_eq!(detected.len(), 1);

        // Empty stack, one detected: opened.
        assert!(matches!(
            diff_against_stack(&detected, &[]),
            OverlayTransition::Opened(_)
        ));

        // Stack has it, detection matches: no transition.
        let roots = vec![detected[0].root_key.clone()];
        assert!(matches!(
            diff_against_stack(&detected, &roots),
            OverlayTransition::None
        ));

        // Stack has one, nothing detected: closed.
        assert!(matches!(
            diff_against_stack(&[], &roots),
            OverlayTransition::Closed
        ));

        // Same count, different top: replaced.
        let other = snapshot(2, vec![dialog_node(9, "B", true)]);
        let other_detected = detect_overlays(&other);
        assert!(matches!(
            diff_against_stack(&other_detected, &roots),
            OverlayTransition::Replaced(_)
        ));
    }

    #[test]
    fn slices_partition_the_snapshot() {
        let mut in_dialog = node(2, "OK", NodeKind::Button);
        in_dialog.placement.region = crate::snapshot::Region::Dialog;
        let s = snapshot(
            1,
            vec![
                node(1, "Outside", NodeKind::Button),
                dialog_node(10, "Confirm", true),
                in_dialog,
            ],
        );
        let overlay = overlay_slice(&s);
        let base = non_overlay_slice(&s);
        assert_eq!(overlay.len(), 2);
        assert_eq!(base.len(), 1);
        assert_eq!(overlay.len() + base.len(), s.node_count());
    }

    #[test]
    fn overlay_state_captures_refs_from_stored_loaders() {
        let s = snapshot(1, vec![dialog_node(10, "Confirm", true)]);
        let detected = detect_overlays(&s);
        let state = build_overlay_state(&detected[0], &s);
        assert_eq!(state.captured_refs.len(), 1);
        // Refs carry the node's stored loader id, not live frame state.
        assert_eq!(state.captured_refs[0].loader_id, s.nodes[0].loader_id);
        assert_eq!(state.captured_refs[0].snapshot_id, s.snapshot_id);
        assert_eq!(state.known_nodes.len(), 1);
    }

    #[test]
    fn slice_hash_tracks_content() {
        let a = vec![node(1, "A", NodeKind::Button)];
        let b = vec![node(1, "B", NodeKind::Button)];
        assert_ne!(slice_content_hash(&a), slice_content_hash(&b));
        assert_eq!(slice_content_hash(&a), slice_content_hash(&a.clone()));
    }
}
