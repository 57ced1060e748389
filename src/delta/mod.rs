//! The delta/overlay state machine: per-turn decisions between a fresh
//! baseline, an incremental delta, and overlay open/close/replace events,
//! plus the frame and version bookkeeping those decisions rest on.

mod diff;
mod frames;
mod overlay;
mod state;
mod version;

pub use diff::{ChangeKind, Delta, KnownMap, KnownNode, Modified, confidence, diff, is_reliable, known_map, known_map_of};
pub use frames::{FrameObservation, FrameTracker};
pub use overlay::{
    DetectedOverlay, OverlayState, OverlayTransition, OverlayType, build_overlay_state,
    detect_node_overlay, detect_overlays, diff_against_stack, non_overlay_slice, overlay_slice,
    slice_content_hash,
};
pub use state::{DeltaContext, Mode, PageSnapshotState, TurnResponse};
pub use version::VersionManager;
