//! Agent-facing verb surface: typed inputs, the per-turn state response,
//! and the CDP action executor.

mod actions;

pub use actions::{
    ActionOutcome, click_with_navigation_awareness, current_loader_id, current_url, go_back,
    go_forward, hover_node, press_key, reload_page, scroll_into_view, scroll_page, select_value,
    type_text,
};

use serde::{Deserialize, Serialize};

use crate::delta::{Mode, PageSnapshotState, TurnResponse};
use crate::error::BridgeError;
use crate::snapshot::{NodeKind, ReadableNode, Region, Snapshot};

/// Ceiling on actionable elements per state response.
pub const MAX_ACTIONABLES: usize = 40;

/// Scroll directions for `scroll_page`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

/// The recognized verbs, tagged the way they arrive on the wire.
///
/// Deserialization failure is an input-validation error, distinct from any
/// runtime failure. `page_id` is optional on most verbs: when omitted, the
/// most-recently-used page applies; verbs that can create a page do so.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "verb", rename_all = "snake_case")]
pub enum ToolRequest {
    LaunchBrowser {
        headless: Option<bool>,
    },
    ConnectBrowser {
        endpoint_url: Option<String>,
    },
    ClosePage {
        page_id: String,
    },
    CloseSession,
    Navigate {
        url: String,
        page_id: Option<String>,
    },
    GoBack {
        page_id: Option<String>,
    },
    GoForward {
        page_id: Option<String>,
    },
    Reload {
        page_id: Option<String>,
    },
    CaptureSnapshot {
        page_id: Option<String>,
    },
    FindElements {
        filters: FindFilters,
        page_id: Option<String>,
    },
    GetNodeDetails {
        eid: String,
        page_id: Option<String>,
    },
    ScrollElementIntoView {
        eid: String,
        page_id: Option<String>,
    },
    ScrollPage {
        direction: ScrollDirection,
        amount: f64,
        page_id: Option<String>,
    },
    Click {
        eid: String,
        page_id: Option<String>,
    },
    #[serde(rename = "type")]
    Type {
        eid: String,
        text: String,
        page_id: Option<String>,
    },
    Press {
        key: String,
        page_id: Option<String>,
    },
    Select {
        eid: String,
        value: String,
        page_id: Option<String>,
    },
    Hover {
        eid: String,
        page_id: Option<String>,
    },
}

impl ToolRequest {
    /// Parse a wire request.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for unknown verbs or malformed inputs,
    /// before any I/O.
    pub fn parse(raw: &str) -> Result<Self, BridgeError> {
        serde_json::from_str(raw).map_err(|e| BridgeError::InvalidArgument {
            field: "verb".into(),
            message: e.to_string(),
        })
    }
}

/// Semantic filters for `find_elements`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FindFilters {
    pub kind: Option<NodeKind>,
    /// Case-insensitive substring over the label.
    pub label: Option<String>,
    pub region: Option<Region>,
}

impl FindFilters {
    /// Whether a node passes every present filter.
    #[must_use]
    pub fn matches(&self, node: &ReadableNode) -> bool {
        if let Some(kind) = self.kind {
            if node.kind != kind {
                return false;
            }
        }
        if let Some(label) = &self.label {
            if !node.label.to_lowercase().contains(&label.to_lowercase()) {
                return false;
            }
        }
        if let Some(region) = self.region {
            if node.placement.region != region {
                return false;
            }
        }
        true
    }
}

/// One actionable element in a state response.
#[derive(Debug, Clone, Serialize)]
pub struct Actionable {
    pub eid: String,
    pub kind: NodeKind,
    pub label: String,
    pub region: Region,
}

/// Always-present facts about the page.
#[derive(Debug, Clone, Serialize)]
pub struct UniversalAtoms {
    pub url: String,
    pub title: String,
    pub mode: &'static str,
    pub overlay_depth: usize,
    pub version: u64,
}

/// Token accounting attached to every response.
#[derive(Debug, Clone, Serialize)]
pub struct TokenAccounting {
    pub estimate: usize,
}

/// The change portion of a state response.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeSummary {
    Baseline {
        reason: String,
        node_count: usize,
    },
    NoChange,
    Delta {
        context: crate::delta::DeltaContext,
        added: usize,
        removed: usize,
        modified: usize,
        confidence: f64,
    },
    OverlayOpened {
        overlay_type: crate::delta::OverlayType,
        confidence: f64,
        listing_count: usize,
    },
    OverlayClosed {
        invalidated: usize,
        base_changes: usize,
    },
    OverlayReplaced {
        overlay_type: crate::delta::OverlayType,
        invalidated: usize,
    },
}

impl ChangeSummary {
    #[must_use]
    pub fn from_turn(response: &TurnResponse) -> Self {
        match response {
            TurnResponse::FullSnapshot { snapshot, reason } => Self::Baseline {
                reason: reason.clone(),
                node_count: snapshot.node_count(),
            },
            TurnResponse::NoChange => Self::NoChange,
            TurnResponse::Delta { delta, context, .. } => Self::Delta {
                context: *context,
                added: delta.added.len(),
                removed: delta.removed.len(),
                modified: delta.modified.len(),
                confidence: delta.confidence,
            },
            TurnResponse::OverlayOpened {
                overlay_type,
                confidence,
                listing,
                ..
            } => Self::OverlayOpened {
                overlay_type: *overlay_type,
                confidence: *confidence,
                listing_count: listing.len(),
            },
            TurnResponse::OverlayClosed {
                invalidated,
                base_delta,
                ..
            } => Self::OverlayClosed {
                invalidated: invalidated.len(),
                base_changes: base_delta.as_ref().map_or(0, crate::delta::Delta::change_count),
            },
            TurnResponse::OverlayReplaced {
                overlay_type,
                invalidated,
                ..
            } => Self::OverlayReplaced {
                overlay_type: *overlay_type,
                invalidated: invalidated.len(),
            },
        }
    }
}

/// The envelope every action returns: the state handle, the change since
/// the previous response, the active layer's actionables (capped), the
/// universal atoms, and token accounting.
#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub sid: String,
    pub change: ChangeSummary,
    pub actionables: Vec<Actionable>,
    pub atoms: UniversalAtoms,
    pub tokens: TokenAccounting,
}

/// Build the state response for a turn.
#[must_use]
pub fn build_state_response(
    state: &PageSnapshotState,
    response: &TurnResponse,
    fresh: &Snapshot,
) -> StateResponse {
    let change = ChangeSummary::from_turn(response);

    let mut actionables = Vec::new();
    for node in state.context_nodes() {
        if actionables.len() >= MAX_ACTIONABLES {
            break;
        }
        if !node.kind.is_interactive() {
            continue;
        }
        if let Some(eid) = state.elements().eid_for_key(&node.key()) {
            actionables.push(Actionable {
                eid: eid.to_owned(),
                kind: node.kind,
                label: node.label.clone(),
                region: node.placement.region,
            });
        }
    }

    let atoms = UniversalAtoms {
        url: fresh.url.clone(),
        title: fresh.title.clone(),
        mode: match state.mode() {
            Mode::Uninitialized => "uninitialized",
            Mode::Base => "base",
            Mode::Overlay => "overlay",
        },
        overlay_depth: state.overlay_depth(),
        version: fresh.version,
    };

    let mut out = StateResponse {
        sid: fresh.snapshot_id.clone(),
        change,
        actionables,
        atoms,
        tokens: TokenAccounting { estimate: 0 },
    };
    // Rough 4-bytes-per-token accounting over the rendered payload.
    out.tokens.estimate = serde_json::to_string(&out).map_or(0, |s| s.len() / 4);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::test_support::{node, snapshot};

    #[test]
    fn parse_known_verbs() {
        let req = ToolRequest::parse(r#"{"verb": "navigate", "url": "https://example.com"}"#)
            .unwrap();
        assert!(matches!(req, ToolRequest::Navigate { .. }));

        let req = ToolRequest::parse(r#"{"verb": "click", "eid": "e3"}"#).unwrap();
        assert!(matches!(req, ToolRequest::Click { .. }));

        let req =
            ToolRequest::parse(r#"{"verb": "type", "eid": "e1", "text": "hello"}"#).unwrap();
        assert!(matches!(req, ToolRequest::Type { .. }));
    }

    #[test]
    fn unknown_verb_is_invalid_argument() {
        let err = ToolRequest::parse(r#"{"verb": "teleport"}"#).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn missing_required_input_is_invalid_argument() {
        let err = ToolRequest::parse(r#"{"verb": "navigate"}"#).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn find_filters_compose() {
        let mut n = node(1, "Sign in", NodeKind::Button);
        n.placement.region = Region::Form;

        let all = FindFilters::default();
        assert!(all.matches(&n));

        let by_kind = FindFilters {
            kind: Some(NodeKind::Button),
            ..FindFilters::default()
        };
        assert!(by_kind.matches(&n));

        let by_label = FindFilters {
            label: Some("sign".into()),
            ..FindFilters::default()
        };
        assert!(by_label.matches(&n), "label match is case-insensitive");

        let wrong_region = FindFilters {
            region: Some(Region::Footer),
            ..FindFilters::default()
        };
        assert!(!wrong_region.matches(&n));
    }

    #[test]
    fn state_response_caps_actionables_and_counts_tokens() {
        let mut state = PageSnapshotState::new(3);
        let nodes: Vec<_> = (1..=60)
            .map(|i| node(i, &format!("Button {i}"), NodeKind::Button))
            .collect();
        let fresh = snapshot(0, nodes);
        let response = state.compute_response(fresh.clone());
        let rendered = build_state_response(&state, &response, state.baseline().unwrap());

        assert_eq!(rendered.actionables.len(), MAX_ACTIONABLES);
        assert!(rendered.tokens.estimate > 0);
        assert_eq!(rendered.atoms.mode, "base");
        assert!(matches!(rendered.change, ChangeSummary::Baseline { .. }));
    }
}
