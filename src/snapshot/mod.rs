//! Snapshot capture: the semantic page model, element identity, the
//! compiler contract with the bundled AX-tree compiler, and the health and
//! recovery envelope around capture.

mod compiler;
mod elements;
mod health;
mod model;

pub use compiler::{
    AxTreeCompiler, CompiledSnapshot, FrameInfo, MAX_NODES, SnapshotCompiler, WARN_AX_EMPTY,
    WARN_DOM_EMPTY, collect_frames,
};
pub use elements::{ElementEntry, ElementRegistry};
pub use health::{
    CaptureOptions, CaptureReport, CdpRuntimeHealth, HealthCode, RuntimeHealth,
    SnapshotRuntimeHealth, capture, capture_with_recovery, classify_capture_error,
    classify_compiled,
};
pub use model::{
    BBox, CompositeKey, FindLocators, Layout, NodeKind, NodeState, Placement, ReadableNode,
    Region, ScopedRef, ScreenZone, Snapshot,
};

#[cfg(test)]
pub(crate) use model::test_support;
