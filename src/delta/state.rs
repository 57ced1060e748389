use serde::Serialize;
use tracing::{debug, info};

use crate::delta::diff::{Delta, KnownMap, diff, is_reliable, known_map, known_map_of};
use crate::delta::frames::{FrameObservation, FrameTracker};
use crate::delta::overlay::{
    DetectedOverlay, OverlayState, OverlayTransition, OverlayType, build_overlay_state,
    detect_overlays, diff_against_stack, non_overlay_slice, overlay_slice, slice_content_hash,
};
use crate::delta::version::VersionManager;
use crate::snapshot::{CompositeKey, ElementRegistry, ReadableNode, ScopedRef, Snapshot};

/// What the agent currently sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Uninitialized,
    Base,
    Overlay,
}

/// Which layer a delta describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaContext {
    Base,
    Overlay,
}

/// The per-turn decision: baseline, incremental delta, or overlay event.
#[derive(Debug)]
pub enum TurnResponse {
    /// A fresh baseline. Sent on first capture, full navigation, and when a
    /// computed delta is not trustworthy.
    FullSnapshot {
        snapshot: Snapshot,
        reason: String,
    },
    /// Nothing changed logically and no frames were invalidated.
    NoChange,
    /// An incremental difference within the current context.
    Delta {
        delta: Delta,
        context: DeltaContext,
        version: u64,
    },
    /// A new overlay became the active context.
    OverlayOpened {
        overlay_type: OverlayType,
        confidence: f64,
        listing: Vec<ReadableNode>,
        version: u64,
    },
    /// The top overlay went away. `base_delta` is present when the stack
    /// emptied and the base page was re-diffed.
    OverlayClosed {
        invalidated: Vec<ScopedRef>,
        base_delta: Option<Delta>,
        version: u64,
    },
    /// The top overlay was swapped for another in one turn.
    OverlayReplaced {
        invalidated: Vec<ScopedRef>,
        overlay_type: OverlayType,
        listing: Vec<ReadableNode>,
        version: u64,
    },
}

/// The delta/overlay state machine for one page.
///
/// Owns the baseline snapshot and its composite-key map, the overlay stack,
/// the frame tracker, the version manager, and the element registry. All of
/// it is mutated only inside [`compute_response`](Self::compute_response)
/// and the pre-validation hook.
pub struct PageSnapshotState {
    mode: Mode,
    baseline: Option<Snapshot>,
    baseline_nodes: KnownMap,
    /// Main-frame loader identity recorded at baseline capture.
    baseline_loader: Option<String>,
    overlays: Vec<OverlayState>,
    versions: VersionManager,
    frames: FrameTracker,
    elements: ElementRegistry,
}

impl PageSnapshotState {
    /// Fresh, uninitialized state.
    #[must_use]
    pub fn new(eid_stale_turns: u32) -> Self {
        Self {
            mode: Mode::Uninitialized,
            baseline: None,
            baseline_nodes: KnownMap::new(),
            baseline_loader: None,
            overlays: Vec::new(),
            versions: VersionManager::new(),
            frames: FrameTracker::new(),
            elements: ElementRegistry::new(eid_stale_turns),
        }
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[must_use]
    pub fn baseline(&self) -> Option<&Snapshot> {
        self.baseline.as_ref()
    }

    #[must_use]
    pub fn overlay_depth(&self) -> usize {
        self.overlays.len()
    }

    /// The element registry backing agent-facing eids.
    #[must_use]
    pub fn elements(&self) -> &ElementRegistry {
        &self.elements
    }

    /// The nodes of the active context: top overlay slice in overlay mode,
    /// baseline nodes otherwise.
    #[must_use]
    pub fn context_nodes(&self) -> Vec<&ReadableNode> {
        match self.mode {
            Mode::Overlay => self
                .overlays
                .last()
                .map(|o| o.slice.iter().collect())
                .unwrap_or_default(),
            Mode::Base => self
                .baseline
                .as_ref()
                .map(|b| b.nodes.iter().collect())
                .unwrap_or_default(),
            Mode::Uninitialized => Vec::new(),
        }
    }

    /// Decide this turn's response for a fresh capture.
    pub fn compute_response(&mut self, mut fresh: Snapshot) -> TurnResponse {
        if self.mode == Mode::Uninitialized {
            return self.initialize(fresh, "first");
        }

        // Frame bookkeeping: refs in navigated-away frames invalidate now.
        self.frames.observe(&frame_observations(&fresh));
        let frame_invalidations = self.frames.drain_invalidations();

        // Full navigation: a new main-frame document resets everything.
        let current_loader = fresh.main_loader_id().map(str::to_owned);
        if let (Some(baseline_loader), Some(current)) = (&self.baseline_loader, &current_loader) {
            if baseline_loader != current {
                info!("full page navigation detected; re-baselining");
                self.reset_all();
                return self.initialize(fresh, "full page navigation detected");
            }
        }

        // Version short-circuit: logically unchanged content with no frame
        // churn is a no-change turn.
        let (version, is_new) = self.versions.observe(&fresh.fingerprint());
        fresh.version = version;
        if !is_new && frame_invalidations.is_empty() {
            return TurnResponse::NoChange;
        }

        self.elements.register_snapshot(&fresh, false);

        let detected = detect_overlays(&fresh);
        let stack_roots: Vec<CompositeKey> =
            self.overlays.iter().map(|o| o.root_ref.key()).collect();
        match diff_against_stack(&detected, &stack_roots) {
            OverlayTransition::Opened(top) => {
                self.handle_opened(&top, &fresh, frame_invalidations)
            }
            OverlayTransition::Closed => self.handle_closed(&fresh, frame_invalidations),
            OverlayTransition::Replaced(top) => {
                self.handle_replaced(&top, &fresh, frame_invalidations)
            }
            OverlayTransition::None => {
                if self.mode == Mode::Overlay {
                    self.handle_overlay_content_change(&fresh, frame_invalidations)
                } else {
                    self.handle_base_change(&fresh, frame_invalidations)
                }
            }
        }
    }

    /// Pre-validation advance: the caller validated an incoming action
    /// against a newer capture than the agent has seen. In base mode the
    /// baseline may move forward so the next diff does not double-count the
    /// pre-action changes. In overlay mode the baseline is frozen; only the
    /// top overlay's slice and captured refs refresh.
    pub fn advance_for_prevalidation(&mut self, fresh: &Snapshot) {
        match self.mode {
            Mode::Base => {
                self.baseline_nodes = known_map_of(fresh);
                self.baseline = Some(fresh.clone());
            }
            Mode::Overlay => {
                if let Some(top) = self.overlays.last_mut() {
                    let slice = overlay_slice(fresh);
                    top.captured_refs = slice
                        .iter()
                        .map(|n| n.scoped_ref(&fresh.snapshot_id))
                        .collect();
                    top.known_nodes = known_map(&fresh.snapshot_id, &slice);
                    top.content_hash = slice_content_hash(&slice);
                    top.slice = slice;
                }
            }
            Mode::Uninitialized => {}
        }
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    fn initialize(&mut self, mut fresh: Snapshot, reason: &str) -> TurnResponse {
        let (version, _) = self.versions.observe(&fresh.fingerprint());
        fresh.version = version;

        self.frames.observe(&frame_observations(&fresh));
        let _ = self.frames.drain_invalidations();
        self.elements.register_snapshot(&fresh, false);

        self.baseline_loader = fresh.main_loader_id().map(str::to_owned);
        self.baseline_nodes = known_map_of(&fresh);
        self.baseline = Some(fresh.clone());
        self.mode = Mode::Base;
        self.overlays.clear();

        TurnResponse::FullSnapshot {
            snapshot: fresh,
            reason: reason.to_owned(),
        }
    }

    fn handle_opened(
        &mut self,
        top: &DetectedOverlay,
        fresh: &Snapshot,
        frame_invalidations: Vec<ScopedRef>,
    ) -> TurnResponse {
        let overlay = build_overlay_state(top, fresh);
        for scoped in &overlay.captured_refs {
            self.frames.register_ref(scoped.clone());
        }
        let listing = overlay.slice.clone();
        let overlay_type = overlay.overlay_type;
        let confidence = overlay.confidence;
        debug!(?overlay_type, depth = self.overlays.len() + 1, "overlay opened");

        self.overlays.push(overlay);
        self.mode = Mode::Overlay;
        self.frames.prune_refs(&frame_invalidations);

        TurnResponse::OverlayOpened {
            overlay_type,
            confidence,
            listing,
            version: fresh.version,
        }
    }

    fn handle_closed(
        &mut self,
        fresh: &Snapshot,
        frame_invalidations: Vec<ScopedRef>,
    ) -> TurnResponse {
        let Some(closed) = self.overlays.pop() else {
            // A close transition with an empty stack cannot come out of
            // diff_against_stack; fall back to a base change.
            return self.handle_base_change(fresh, frame_invalidations);
        };

        // The closed overlay's refs are invalid regardless of whether their
        // loader is still current.
        let mut invalidated = closed.captured_refs;
        invalidated.extend(frame_invalidations);
        self.frames.prune_refs(&invalidated);

        if self.overlays.is_empty() {
            self.mode = Mode::Base;
            let base_nodes = non_overlay_slice(fresh);
            let delta = diff(&self.baseline_nodes, &fresh.snapshot_id, &base_nodes);
            self.frames.prune_refs(&delta.removed);

            let new_baseline = Snapshot {
                nodes: base_nodes,
                ..fresh.clone()
            };
            self.baseline_nodes = known_map_of(&new_baseline);
            self.baseline = Some(new_baseline);

            debug!("overlay closed; back to base");
            TurnResponse::OverlayClosed {
                invalidated,
                base_delta: Some(delta),
                version: fresh.version,
            }
        } else {
            debug!(depth = self.overlays.len(), "overlay closed; stack remains");
            TurnResponse::OverlayClosed {
                invalidated,
                base_delta: None,
                version: fresh.version,
            }
        }
    }

    fn handle_replaced(
        &mut self,
        top: &DetectedOverlay,
        fresh: &Snapshot,
        frame_invalidations: Vec<ScopedRef>,
    ) -> TurnResponse {
        let old = self.overlays.pop();
        let overlay = build_overlay_state(top, fresh);
        for scoped in &overlay.captured_refs {
            self.frames.register_ref(scoped.clone());
        }
        let listing = overlay.slice.clone();
        let overlay_type = overlay.overlay_type;
        self.overlays.push(overlay);
        self.mode = Mode::Overlay;

        let mut invalidated = old.map(|o| o.captured_refs).unwrap_or_default();
        invalidated.extend(frame_invalidations);
        self.frames.prune_refs(&invalidated);

        debug!(?overlay_type, "overlay replaced");
        TurnResponse::OverlayReplaced {
            invalidated,
            overlay_type,
            listing,
            version: fresh.version,
        }
    }

    fn handle_overlay_content_change(
        &mut self,
        fresh: &Snapshot,
        frame_invalidations: Vec<ScopedRef>,
    ) -> TurnResponse {
        let Some(top) = self.overlays.last_mut() else {
            return self.handle_base_change(fresh, frame_invalidations);
        };

        let fresh_slice = overlay_slice(fresh);
        // Removed refs are recovered from the overlay's known map before the
        // map is replaced below.
        let mut delta = diff(&top.known_nodes, &fresh.snapshot_id, &fresh_slice);

        top.captured_refs = fresh_slice
            .iter()
            .map(|n| n.scoped_ref(&fresh.snapshot_id))
            .collect();
        top.known_nodes = known_map(&fresh.snapshot_id, &fresh_slice);
        top.content_hash = slice_content_hash(&fresh_slice);
        top.slice = fresh_slice;

        delta.removed.extend(frame_invalidations);
        self.frames.prune_refs(&delta.removed);

        // The baseline stays frozen while an overlay is up.
        TurnResponse::Delta {
            delta,
            context: DeltaContext::Overlay,
            version: fresh.version,
        }
    }

    fn handle_base_change(
        &mut self,
        fresh: &Snapshot,
        frame_invalidations: Vec<ScopedRef>,
    ) -> TurnResponse {
        let mut delta = diff(&self.baseline_nodes, &fresh.snapshot_id, &fresh.nodes);

        if !is_reliable(
            delta.added.len(),
            delta.removed.len(),
            delta.modified.len(),
            fresh.node_count(),
        ) {
            info!(
                added = delta.added.len(),
                removed = delta.removed.len(),
                modified = delta.modified.len(),
                "delta unreliable; re-baselining"
            );
            self.baseline_loader = fresh.main_loader_id().map(str::to_owned);
            self.baseline_nodes = known_map_of(fresh);
            self.baseline = Some(fresh.clone());
            return TurnResponse::FullSnapshot {
                snapshot: fresh.clone(),
                reason: "delta unreliable".to_owned(),
            };
        }

        delta.removed.extend(frame_invalidations);
        self.frames.prune_refs(&delta.removed);

        self.baseline_nodes = known_map_of(fresh);
        self.baseline = Some(fresh.clone());

        TurnResponse::Delta {
            delta,
            context: DeltaContext::Base,
            version: fresh.version,
        }
    }

    fn reset_all(&mut self) {
        self.mode = Mode::Uninitialized;
        self.baseline = None;
        self.baseline_nodes.clear();
        self.baseline_loader = None;
        self.overlays.clear();
        self.versions.reset();
        self.frames.reset();
        self.elements.reset();
    }
}

/// Unique (frame, loader) pairs in node order; the main frame comes first
/// because snapshots list main-frame nodes first.
fn frame_observations(snapshot: &Snapshot) -> Vec<FrameObservation> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for node in &snapshot.nodes {
        if seen.insert(node.frame_id.clone()) {
            out.push(FrameObservation {
                frame_id: node.frame_id.clone(),
                loader_id: node.loader_id.clone(),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::NodeKind;
    use crate::snapshot::test_support::{node, node_in_frame, snapshot};
    use std::collections::HashMap;

    fn modal_dialog(backend: i64, label: &str) -> ReadableNode {
        let mut n = node(backend, label, NodeKind::Dialog);
        let mut attributes = HashMap::new();
        attributes.insert("role".to_owned(), "dialog".to_owned());
        attributes.insert("aria-modal".to_owned(), "true".to_owned());
        n.attributes = Some(attributes);
        n
    }

    fn dialog_button(backend: i64, label: &str) -> ReadableNode {
        let mut n = node(backend, label, NodeKind::Button);
        n.placement.region = crate::snapshot::Region::Dialog;
        n
    }

    fn base_page() -> Vec<ReadableNode> {
        vec![
            node(1, "Home", NodeKind::Link),
            node(2, "Search", NodeKind::Input),
            node(3, "Results", NodeKind::Heading),
        ]
    }

    #[test]
    fn first_capture_is_baseline_with_reason_first() {
        let mut state = PageSnapshotState::new(3);
        let response = state.compute_response(snapshot(0, base_page()));
        match response {
            TurnResponse::FullSnapshot { snapshot, reason } => {
                assert_eq!(reason, "first");
                assert_eq!(snapshot.version, 1);
            }
            other => panic!("expected FullSnapshot, got {other:?}"),
        }
        assert_eq!(state.mode(), Mode::Base);
    }

    #[test]
    fn unchanged_capture_is_no_change() {
        let mut state = PageSnapshotState::new(3);
        state.compute_response(snapshot(0, base_page()));
        let response = state.compute_response(snapshot(0, base_page()));
        assert!(matches!(response, TurnResponse::NoChange));
    }

    #[test]
    fn base_change_yields_delta_and_advances_baseline() {
        let mut state = PageSnapshotState::new(3);
        state.compute_response(snapshot(0, base_page()));

        let mut next = base_page();
        next.push(node(4, "New link", NodeKind::Link));
        let response = state.compute_response(snapshot(0, next));

        match response {
            TurnResponse::Delta {
                delta,
                context,
                version,
            } => {
                assert_eq!(context, DeltaContext::Base);
                assert_eq!(version, 2);
                assert_eq!(delta.added.len(), 1);
                assert!(delta.removed.is_empty());
            }
            other => panic!("expected Delta, got {other:?}"),
        }
        assert_eq!(state.baseline().unwrap().nodes.len(), 4);
    }

    #[test]
    fn overlay_opens_without_touching_baseline() {
        let mut state = PageSnapshotState::new(3);
        state.compute_response(snapshot(0, base_page()));
        let baseline_before: Vec<i64> = state
            .baseline()
            .unwrap()
            .nodes
            .iter()
            .map(|n| n.backend_node_id)
            .collect();

        let mut with_dialog = base_page();
        with_dialog.push(modal_dialog(10, "Confirm"));
        with_dialog.push(dialog_button(11, "OK"));
        let response = state.compute_response(snapshot(0, with_dialog));

        match response {
            TurnResponse::OverlayOpened {
                overlay_type,
                confidence,
                listing,
                ..
            } => {
                assert_eq!(overlay_type, OverlayType::Modal);
                assert!((confidence - 1.0).abs() < f64::EPSILON);
                assert_eq!(listing.len(), 2, "dialog root and its button");
            }
            other => panic!("expected OverlayOpened, got {other:?}"),
        }
        assert_eq!(state.mode(), Mode::Overlay);

        let baseline_after: Vec<i64> = state
            .baseline()
            .unwrap()
            .nodes
            .iter()
            .map(|n| n.backend_node_id)
            .collect();
        assert_eq!(baseline_before, baseline_after, "baseline untouched");
    }

    #[test]
    fn overlay_close_invalidates_captured_refs_and_rebaselines() {
        let mut state = PageSnapshotState::new(3);
        state.compute_response(snapshot(0, base_page()));

        let mut with_dialog = base_page();
        with_dialog.push(modal_dialog(10, "Confirm"));
        with_dialog.push(dialog_button(11, "OK"));
        state.compute_response(snapshot(0, with_dialog));
        assert_eq!(state.overlay_depth(), 1);

        let response = state.compute_response(snapshot(0, base_page()));
        match response {
            TurnResponse::OverlayClosed {
                invalidated,
                base_delta,
                ..
            } => {
                let invalidated_ids: Vec<i64> =
                    invalidated.iter().map(|r| r.backend_node_id).collect();
                assert!(invalidated_ids.contains(&10));
                assert!(invalidated_ids.contains(&11));
                let delta = base_delta.expect("stack emptied; base was diffed");
                assert!(delta.is_empty(), "base page itself did not change");
            }
            other => panic!("expected OverlayClosed, got {other:?}"),
        }
        assert_eq!(state.mode(), Mode::Base);
        assert_eq!(state.overlay_depth(), 0);
        // The baseline advanced to the non-overlay slice.
        assert_eq!(state.baseline().unwrap().nodes.len(), 3);
    }

    #[test]
    fn overlay_content_change_diffs_slice_and_freezes_baseline() {
        let mut state = PageSnapshotState::new(3);
        state.compute_response(snapshot(0, base_page()));

        let mut with_dialog = base_page();
        with_dialog.push(modal_dialog(10, "Confirm"));
        with_dialog.push(dialog_button(11, "OK"));
        state.compute_response(snapshot(0, with_dialog));

        let baseline_before = state.baseline().unwrap().fingerprint();

        let mut changed = base_page();
        changed.push(modal_dialog(10, "Confirm"));
        changed.push(dialog_button(11, "Proceed")); // label change in overlay
        let response = state.compute_response(snapshot(0, changed));

        match response {
            TurnResponse::Delta { delta, context, .. } => {
                assert_eq!(context, DeltaContext::Overlay);
                assert_eq!(delta.modified.len(), 1, "button label changed in place");
                assert_eq!(delta.modified[0].previous_label, "OK");
                assert_eq!(delta.modified[0].current_label, "Proceed");
            }
            other => panic!("expected overlay Delta, got {other:?}"),
        }
        assert_eq!(state.mode(), Mode::Overlay);
        assert_eq!(
            state.baseline().unwrap().fingerprint(),
            baseline_before,
            "baseline frozen during overlay content change"
        );
    }

    #[test]
    fn overlay_replace_swaps_top_and_invalidates_old_refs() {
        let mut state = PageSnapshotState::new(3);
        state.compute_response(snapshot(0, base_page()));

        let mut with_a = base_page();
        with_a.push(modal_dialog(10, "Dialog A"));
        state.compute_response(snapshot(0, with_a));

        let mut with_b = base_page();
        with_b.push(modal_dialog(20, "Dialog B"));
        let response = state.compute_response(snapshot(0, with_b));

        match response {
            TurnResponse::OverlayReplaced {
                invalidated,
                listing,
                ..
            } => {
                assert!(invalidated.iter().any(|r| r.backend_node_id == 10));
                assert!(listing.iter().any(|n| n.backend_node_id == 20));
            }
            other => panic!("expected OverlayReplaced, got {other:?}"),
        }
        assert_eq!(state.mode(), Mode::Overlay);
        assert_eq!(state.overlay_depth(), 1);
    }

    #[test]
    fn overlay_stack_is_lifo() {
        let mut state = PageSnapshotState::new(3);
        state.compute_response(snapshot(0, base_page()));

        let mut one = base_page();
        one.push(modal_dialog(10, "First"));
        state.compute_response(snapshot(0, one.clone()));

        let mut two = one.clone();
        two.push(modal_dialog(20, "Second"));
        state.compute_response(snapshot(0, two));
        assert_eq!(state.overlay_depth(), 2);

        // Closing pops only the top; mode stays overlay.
        let response = state.compute_response(snapshot(0, one));
        match response {
            TurnResponse::OverlayClosed {
                base_delta,
                invalidated,
                ..
            } => {
                assert!(base_delta.is_none(), "stack not empty yet");
                assert!(invalidated.iter().any(|r| r.backend_node_id == 20));
            }
            other => panic!("expected OverlayClosed, got {other:?}"),
        }
        assert_eq!(state.overlay_depth(), 1);
        assert_eq!(state.mode(), Mode::Overlay);
    }

    #[test]
    fn loader_change_resets_everything() {
        let mut state = PageSnapshotState::new(3);
        state.compute_response(snapshot(0, base_page()));
        state.compute_response(snapshot(0, {
            let mut n = base_page();
            n.push(node(4, "More", NodeKind::Link));
            n
        }));

        let navigated = vec![
            node_in_frame(100, "Fresh page", NodeKind::Heading, "frame-main", "loader-2"),
            node_in_frame(101, "Go", NodeKind::Button, "frame-main", "loader-2"),
        ];
        let response = state.compute_response(snapshot(0, navigated));
        match response {
            TurnResponse::FullSnapshot { snapshot, reason } => {
                assert_eq!(reason, "full page navigation detected");
                assert_eq!(snapshot.version, 1, "version counters reset");
            }
            other => panic!("expected FullSnapshot, got {other:?}"),
        }
        assert_eq!(state.mode(), Mode::Base);
        assert_eq!(state.overlay_depth(), 0);
    }

    #[test]
    fn implausible_delta_rebaselines() {
        let mut state = PageSnapshotState::new(3);
        let many: Vec<ReadableNode> = (1..=20)
            .map(|i| node(i, &format!("Item {i}"), NodeKind::Link))
            .collect();
        state.compute_response(snapshot(0, many));

        // Entirely different, much smaller page under the same loader.
        let different: Vec<ReadableNode> = (100..=104)
            .map(|i| node(i, &format!("Other {i}"), NodeKind::Link))
            .collect();
        let response = state.compute_response(snapshot(0, different));
        match response {
            TurnResponse::FullSnapshot { reason, .. } => {
                assert_eq!(reason, "delta unreliable");
            }
            other => panic!("expected FullSnapshot, got {other:?}"),
        }
    }

    #[test]
    fn prevalidation_advance_respects_mode() {
        let mut state = PageSnapshotState::new(3);
        state.compute_response(snapshot(0, base_page()));

        // Base mode: baseline moves.
        let mut advanced = base_page();
        advanced.push(node(4, "Pre-action", NodeKind::Link));
        state.advance_for_prevalidation(&snapshot(0, advanced));
        assert_eq!(state.baseline().unwrap().nodes.len(), 4);

        // Enter overlay mode.
        let mut with_dialog = base_page();
        with_dialog.push(node(4, "Pre-action", NodeKind::Link));
        with_dialog.push(modal_dialog(10, "Confirm"));
        state.compute_response(snapshot(0, with_dialog.clone()));
        let frozen = state.baseline().unwrap().fingerprint();

        // Overlay mode: baseline frozen, overlay slice refreshed.
        let mut refreshed = with_dialog;
        refreshed.push(dialog_button(11, "OK"));
        state.advance_for_prevalidation(&snapshot(0, refreshed));
        assert_eq!(state.baseline().unwrap().fingerprint(), frozen);
    }

    #[test]
    fn version_is_monotonic_across_turns() {
        let mut state = PageSnapshotState::new(3);
        state.compute_response(snapshot(0, base_page()));

        let mut v2 = base_page();
        v2.push(node(4, "A", NodeKind::Link));
        let r2 = state.compute_response(snapshot(0, v2.clone()));
        let mut v3 = v2;
        v3.push(node(5, "B", NodeKind::Link));
        let r3 = state.compute_response(snapshot(0, v3));

        let (TurnResponse::Delta { version: a, .. }, TurnResponse::Delta { version: b, .. }) =
            (r2, r3)
        else {
            panic!("expected deltas");
        };
        assert!(b > a);
    }
}
