use std::collections::{HashMap, HashSet};

use crate::snapshot::ScopedRef;

/// A frame's identity at one observation: its loader id names the document
/// currently inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameObservation {
    pub frame_id: String,
    pub loader_id: String,
}

/// Tracks frames, loader identity, and the scoped refs handed out against
/// each frame's current document.
///
/// When a frame's loader changes, every ref registered against that frame
/// belongs to a navigated-away document; those refs move into the pending
/// invalidation set, drained at the top of each turn.
#[derive(Debug, Default)]
pub struct FrameTracker {
    loaders: HashMap<String, String>,
    main_frame: Option<String>,
    refs_by_frame: HashMap<String, HashSet<ScopedRef>>,
    pending_invalidations: Vec<ScopedRef>,
    ready: bool,
}

impl FrameTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the tracker has observed at least one frame set.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Record the frames of a fresh capture (main frame first). Frames whose
    /// loader changed get their registered refs invalidated; vanished frames
    /// are invalidated too.
    pub fn observe(&mut self, frames: &[FrameObservation]) {
        let seen: HashSet<&str> = frames.iter().map(|f| f.frame_id.as_str()).collect();

        // Frames that disappeared entirely.
        let vanished: Vec<String> = self
            .loaders
            .keys()
            .filter(|known| !seen.contains(known.as_str()))
            .cloned()
            .collect();
        for frame_id in vanished {
            self.loaders.remove(&frame_id);
            if let Some(refs) = self.refs_by_frame.remove(&frame_id) {
                self.pending_invalidations.extend(refs);
            }
        }

        for frame in frames {
            match self.loaders.get(&frame.frame_id) {
                Some(known_loader) if *known_loader != frame.loader_id => {
                    if let Some(refs) = self.refs_by_frame.remove(&frame.frame_id) {
                        self.pending_invalidations.extend(refs);
                    }
                    self.loaders
                        .insert(frame.frame_id.clone(), frame.loader_id.clone());
                }
                Some(_) => {}
                None => {
                    self.loaders
                        .insert(frame.frame_id.clone(), frame.loader_id.clone());
                }
            }
        }

        self.main_frame = frames.first().map(|f| f.frame_id.clone());
        self.ready = true;
    }

    /// The main frame's current loader id.
    #[must_use]
    pub fn main_loader(&self) -> Option<&str> {
        self.main_frame
            .as_ref()
            .and_then(|id| self.loaders.get(id))
            .map(String::as_str)
    }

    /// Register a handed-out ref against its frame.
    pub fn register_ref(&mut self, scoped: ScopedRef) {
        self.refs_by_frame
            .entry(scoped.frame_id.clone())
            .or_default()
            .insert(scoped);
    }

    /// Drop refs that a delta reported removed.
    pub fn prune_refs(&mut self, removed: &[ScopedRef]) {
        for scoped in removed {
            if let Some(refs) = self.refs_by_frame.get_mut(&scoped.frame_id) {
                refs.remove(scoped);
                if refs.is_empty() {
                    self.refs_by_frame.remove(&scoped.frame_id);
                }
            }
        }
    }

    /// Take the refs invalidated by frame navigations since the last drain.
    pub fn drain_invalidations(&mut self) -> Vec<ScopedRef> {
        std::mem::take(&mut self.pending_invalidations)
    }

    /// Number of refs currently registered (diagnostics).
    #[must_use]
    pub fn registered_ref_count(&self) -> usize {
        self.refs_by_frame.values().map(HashSet::len).sum()
    }

    /// Forget everything (full navigation).
    pub fn reset(&mut self) {
        self.loaders.clear();
        self.main_frame = None;
        self.refs_by_frame.clear();
        self.pending_invalidations.clear();
        self.ready = false;
    }
}
