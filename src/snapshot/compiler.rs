use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::cdp::CdpSession;
use crate::error::BridgeError;
use crate::snapshot::model::{
    BBox, FindLocators, Layout, NodeKind, NodeState, Placement, ReadableNode, Region, ScreenZone,
};

/// Hard ceiling on nodes per compiled snapshot.
pub const MAX_NODES: usize = 10_000;

/// How many interactive nodes get a box-model lookup per capture. Layout is
/// best-effort; unbounded per-node CDP calls would dominate capture time.
const MAX_BOX_LOOKUPS: usize = 40;

/// Warning emitted when the accessibility tree came back empty.
pub const WARN_AX_EMPTY: &str = "ax_tree_empty";
/// Warning emitted when the frame tree could not be read.
pub const WARN_DOM_EMPTY: &str = "dom_tree_empty";

/// Raw compiler output, before snapshot identity is attached.
#[derive(Debug, Clone, Default)]
pub struct CompiledSnapshot {
    pub nodes: Vec<ReadableNode>,
    pub warnings: Vec<String>,
    pub partial: bool,
    pub url: String,
    pub title: String,
    pub viewport: Option<(u32, u32)>,
}

/// The snapshot compiler contract. The health layer (and everything above
/// it) depends only on this.
pub trait SnapshotCompiler: Send + Sync {
    /// Produce a semantic page model from a live page session.
    fn compile(
        &self,
        session: &CdpSession,
    ) -> impl std::future::Future<Output = Result<CompiledSnapshot, BridgeError>> + Send;
}

/// The bundled compiler: accessibility tree for semantics, frame tree for
/// frame/loader identity, best-effort box models for layout.
#[derive(Debug, Clone)]
pub struct AxTreeCompiler {
    pub max_nodes: usize,
}

impl Default for AxTreeCompiler {
    fn default() -> Self {
        Self {
            max_nodes: MAX_NODES,
        }
    }
}

/// One frame of the page, from `Page.getFrameTree`.
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub frame_id: String,
    pub loader_id: String,
    pub url: String,
}

impl SnapshotCompiler for AxTreeCompiler {
    async fn compile(&self, session: &CdpSession) -> Result<CompiledSnapshot, BridgeError> {
        let mut warnings = Vec::new();

        let frames = match fetch_frame_tree(session).await {
            Ok(frames) if !frames.is_empty() => frames,
            Ok(_) | Err(_) => {
                warnings.push(WARN_DOM_EMPTY.to_owned());
                Vec::new()
            }
        };
        let Some(main_frame) = frames.first().cloned() else {
            return Ok(CompiledSnapshot {
                warnings,
                ..CompiledSnapshot::default()
            });
        };

        let viewport = fetch_viewport(session).await;
        let title = fetch_title(session).await.unwrap_or_default();

        // Accessibility domain must be enabled before the tree is readable.
        if let Err(e) = session.send("Accessibility.enable", None).await {
            debug!(error = %e, "Accessibility.enable failed");
        }

        let mut nodes = Vec::new();
        let mut truncated = false;
        for (index, frame) in frames.iter().enumerate() {
            let cap = self.max_nodes.saturating_sub(nodes.len());
            if cap == 0 {
                truncated = true;
                break;
            }
            match fetch_ax_tree(session, if index == 0 { None } else { Some(&frame.frame_id) })
                .await
            {
                Ok(payload) => {
                    let ax = parse_ax_payload(&payload);
                    let (mut frame_nodes, frame_truncated) =
                        build_frame_nodes(&ax, frame, viewport, cap);
                    truncated = truncated || frame_truncated;
                    nodes.append(&mut frame_nodes);
                }
                Err(e) if index == 0 => return Err(e.into()),
                Err(e) => {
                    debug!(frame_id = %frame.frame_id, error = %e, "child-frame AX read failed");
                }
            }
        }

        if nodes.is_empty() && !warnings.iter().any(|w| w == WARN_DOM_EMPTY) {
            warnings.push(WARN_AX_EMPTY.to_owned());
        }

        attach_box_models(session, &mut nodes, viewport).await;

        Ok(CompiledSnapshot {
            nodes,
            warnings,
            partial: truncated,
            url: main_frame.url,
            title,
            viewport,
        })
    }
}

// ---------------------------------------------------------------------------
// CDP fetches
// ---------------------------------------------------------------------------

async fn fetch_frame_tree(session: &CdpSession) -> Result<Vec<FrameInfo>, crate::cdp::CdpError> {
    let result = session.send("Page.getFrameTree", None).await?;
    let mut frames = Vec::new();
    collect_frames(&result["frameTree"], &mut frames);
    Ok(frames)
}

/// Depth-first frame collection; the main frame lands first.
pub fn collect_frames(tree: &Value, out: &mut Vec<FrameInfo>) {
    let frame = &tree["frame"];
    if let Some(frame_id) = frame["id"].as_str() {
        out.push(FrameInfo {
            frame_id: frame_id.to_owned(),
            loader_id: frame["loaderId"].as_str().unwrap_or_default().to_owned(),
            url: frame["url"].as_str().unwrap_or_default().to_owned(),
        });
    }
    if let Some(children) = tree["childFrames"].as_array() {
        for child in children {
            collect_frames(child, out);
        }
    }
}

async fn fetch_ax_tree(
    session: &CdpSession,
    frame_id: Option<&str>,
) -> Result<Vec<Value>, crate::cdp::CdpError> {
    let params = frame_id.map(|id| serde_json::json!({ "frameId": id }));
    let result = session.send("Accessibility.getFullAXTree", params).await?;
    Ok(result["nodes"].as_array().cloned().unwrap_or_default())
}

async fn fetch_viewport(session: &CdpSession) -> Option<(u32, u32)> {
    let metrics = session.send("Page.getLayoutMetrics", None).await.ok()?;
    let layout = &metrics["cssLayoutViewport"];
    let width = layout["clientWidth"].as_u64()?;
    let height = layout["clientHeight"].as_u64()?;
    Some((u32::try_from(width).ok()?, u32::try_from(height).ok()?))
}

async fn fetch_title(session: &CdpSession) -> Option<String> {
    let result = session
        .send(
            "Runtime.evaluate",
            Some(serde_json::json!({ "expression": "document.title", "returnByValue": true })),
        )
        .await
        .ok()?;
    result["result"]["value"].as_str().map(str::to_owned)
}

/// Fill in bounding boxes for the first interactive nodes, best-effort.
async fn attach_box_models(
    session: &CdpSession,
    nodes: &mut [ReadableNode],
    viewport: Option<(u32, u32)>,
) {
    let mut looked_up = 0usize;
    for node in nodes.iter_mut() {
        if !node.kind.is_interactive() {
            continue;
        }
        if looked_up >= MAX_BOX_LOOKUPS {
            break;
        }
        looked_up += 1;

        let Ok(result) = session
            .send(
                "DOM.getBoxModel",
                Some(serde_json::json!({ "backendNodeId": node.backend_node_id })),
            )
            .await
        else {
            continue;
        };
        if let Some(bbox) = bbox_from_quad(&result["model"]["border"]) {
            if let Some((_w, h)) = viewport {
                node.layout.screen_zone = Some(ScreenZone::classify(&bbox, f64::from(h)));
            }
            node.layout.bbox = Some(bbox);
        }
    }
}

/// A CDP quad is 8 numbers: x1,y1,…,x4,y4 clockwise from top-left.
pub fn bbox_from_quad(quad: &Value) -> Option<BBox> {
    let values: Vec<f64> = quad.as_array()?.iter().filter_map(Value::as_f64).collect();
    if values.len() != 8 {
        return None;
    }
    let xs = [values[0], values[2], values[4], values[6]];
    let ys = [values[1], values[3], values[5], values[7]];
    let min_x = xs.iter().copied().fold(f64::INFINITY, f64::min);
    let max_x = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min_y = ys.iter().copied().fold(f64::INFINITY, f64::min);
    let max_y = ys.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(BBox {
        x: min_x,
        y: min_y,
        width: max_x - min_x,
        height: max_y - min_y,
    })
}

// ---------------------------------------------------------------------------
// AX tree parsing
// ---------------------------------------------------------------------------

/// Flat accessibility node, parsed from the debugger payload.
struct AxNode {
    node_id: String,
    parent_id: Option<String>,
    ignored: bool,
    role: String,
    name: String,
    properties: Vec<(String, Value)>,
    child_ids: Vec<String>,
    backend_node_id: Option<i64>,
}

fn parse_ax_payload(nodes: &[Value]) -> Vec<AxNode> {
    nodes
        .iter()
        .map(|n| {
            let child_ids = n["childIds"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();

            let properties = n["properties"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|p| {
                            let name = p["name"].as_str()?.to_owned();
                            let value = p["value"]["value"].clone();
                            Some((name, value))
                        })
                        .collect()
                })
                .unwrap_or_default();

            AxNode {
                node_id: n["nodeId"].as_str().unwrap_or_default().to_owned(),
                parent_id: n["parentId"].as_str().map(String::from),
                ignored: n["ignored"].as_bool().unwrap_or(false),
                role: n["role"]["value"].as_str().unwrap_or_default().to_owned(),
                name: n["name"]["value"].as_str().unwrap_or_default().to_owned(),
                properties,
                child_ids,
                backend_node_id: n["backendDOMNodeId"].as_i64(),
            }
        })
        .collect()
}

/// Walk context carried down the tree during node building.
#[derive(Clone)]
struct WalkContext {
    region: Region,
    group_path: Vec<String>,
    group_id: Option<String>,
    heading: Option<String>,
}

fn build_frame_nodes(
    ax: &[AxNode],
    frame: &FrameInfo,
    viewport: Option<(u32, u32)>,
    cap: usize,
) -> (Vec<ReadableNode>, bool) {
    let by_id: HashMap<&str, &AxNode> = ax.iter().map(|n| (n.node_id.as_str(), n)).collect();

    let Some(root) = ax.iter().find(|n| !n.ignored) else {
        return (Vec::new(), false);
    };

    // Some builds return nodes whose childIds are empty but whose parentId
    // links are intact; reconstruct children from parents in that case.
    let children_of: HashMap<&str, Vec<&str>> = if root.child_ids.is_empty() && ax.len() > 1 {
        let mut map: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in ax {
            if let Some(parent) = node.parent_id.as_deref() {
                map.entry(parent).or_default().push(node.node_id.as_str());
            }
        }
        map
    } else {
        ax.iter()
            .map(|n| {
                (
                    n.node_id.as_str(),
                    n.child_ids.iter().map(String::as_str).collect(),
                )
            })
            .collect()
    };

    let mut out = Vec::new();
    let mut truncated = false;
    let context = WalkContext {
        region: Region::Main,
        group_path: Vec::new(),
        group_id: None,
        heading: None,
    };
    walk(
        root,
        &by_id,
        &children_of,
        &context,
        frame,
        viewport,
        cap,
        &mut out,
        &mut truncated,
    );
    (out, truncated)
}

#[allow(clippy::too_many_arguments)]
fn walk(
    ax: &AxNode,
    by_id: &HashMap<&str, &AxNode>,
    children_of: &HashMap<&str, Vec<&str>>,
    context: &WalkContext,
    frame: &FrameInfo,
    viewport: Option<(u32, u32)>,
    cap: usize,
    out: &mut Vec<ReadableNode>,
    truncated: &mut bool,
) {
    if out.len() >= cap {
        *truncated = true;
        return;
    }

    let mut child_context = context.clone();

    if let Some(region) = region_for_role(&ax.role) {
        child_context.region = region;
    }
    if matches!(ax.role.as_str(), "group" | "region" | "form" | "dialog") && !ax.name.is_empty() {
        child_context.group_path.push(ax.name.clone());
        child_context.group_id = Some(ax.name.clone());
    }

    if !ax.ignored {
        if let Some(kind) = NodeKind::from_ax_role(&ax.role) {
            if let Some(backend_node_id) = ax.backend_node_id {
                if !(kind == NodeKind::Text && ax.name.trim().is_empty()) {
                    out.push(readable_node(
                        ax,
                        kind,
                        backend_node_id,
                        frame,
                        &child_context,
                        viewport,
                    ));
                }
            }
        }
    }

    // A heading contextualizes its following siblings, not itself.
    if let Some(children) = children_of.get(ax.node_id.as_str()) {
        let mut running = child_context;
        for child_id in children {
            if let Some(child) = by_id.get(child_id) {
                walk(
                    child,
                    by_id,
                    children_of,
                    &running,
                    frame,
                    viewport,
                    cap,
                    out,
                    truncated,
                );
                if child.role == "heading" && !child.name.is_empty() {
                    running.heading = Some(child.name.clone());
                }
            }
        }
    }
}

fn region_for_role(role: &str) -> Option<Region> {
    Some(match role {
        "banner" => Region::Header,
        "navigation" => Region::Navigation,
        "contentinfo" => Region::Footer,
        "complementary" => Region::Aside,
        "form" => Region::Form,
        "dialog" | "alertdialog" => Region::Dialog,
        "main" => Region::Main,
        _ => return None,
    })
}

fn readable_node(
    ax: &AxNode,
    kind: NodeKind,
    backend_node_id: i64,
    frame: &FrameInfo,
    context: &WalkContext,
    _viewport: Option<(u32, u32)>,
) -> ReadableNode {
    let state = state_from_properties(&ax.properties);
    let attributes = attributes_from_properties(&ax.role, &ax.properties);
    let find = if kind.is_interactive() {
        Some(FindLocators {
            primary: format!("role={} name={}", ax.role, ax.name),
            alternates: if ax.name.is_empty() {
                Vec::new()
            } else {
                vec![format!("text={}", ax.name)]
            },
        })
    } else {
        None
    };

    ReadableNode {
        backend_node_id,
        frame_id: frame.frame_id.clone(),
        loader_id: frame.loader_id.clone(),
        kind,
        label: ax.name.clone(),
        placement: Placement {
            region: context.region,
            group_id: context.group_id.clone(),
            group_path: context.group_path.clone(),
            heading_context: context.heading.clone(),
        },
        layout: Layout::default(),
        state,
        attributes,
        find,
    }
}

fn state_from_properties(properties: &[(String, Value)]) -> Option<NodeState> {
    let mut state = NodeState::default();
    let mut any = false;
    for (name, value) in properties {
        match name.as_str() {
            "disabled" => {
                state.enabled = Some(!value.as_bool().unwrap_or(false));
                any = true;
            }
            "checked" => {
                // AX checked is a tristate string ("true"/"false"/"mixed").
                state.checked = Some(matches!(value.as_str(), Some("true")) || value.as_bool() == Some(true));
                any = true;
            }
            "expanded" => {
                state.expanded = value.as_bool();
                any = true;
            }
            "focused" => {
                state.focused = value.as_bool();
                any = true;
            }
            "required" => {
                state.required = value.as_bool();
                any = true;
            }
            "invalid" => {
                state.invalid = Some(!matches!(value.as_str(), Some("false") | None));
                any = true;
            }
            "readonly" => {
                state.readonly = value.as_bool();
                any = true;
            }
            "hidden" => {
                state.visible = Some(!value.as_bool().unwrap_or(false));
                any = true;
            }
            _ => {}
        }
    }
    any.then_some(state)
}

/// Attributes the overlay detector reads. `aria-modal` is the load-bearing
/// one: rule 1 fires only when it is literally "true".
fn attributes_from_properties(
    role: &str,
    properties: &[(String, Value)],
) -> Option<HashMap<String, String>> {
    let mut attributes = HashMap::new();
    for (name, value) in properties {
        if name == "modal" && value.as_bool() == Some(true) {
            attributes.insert("aria-modal".to_owned(), "true".to_owned());
        }
        if name == "url" {
            if let Some(url) = value.as_str() {
                attributes.insert("href".to_owned(), url.to_owned());
            }
        }
    }
    if matches!(role, "dialog" | "alertdialog") {
        attributes.insert("role".to_owned(), role.to_owned());
    }
    (!attributes.is_empty()).then_some(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame() -> FrameInfo {
        FrameInfo {
            frame_id: "frame-main".into(),
            loader_id: "loader-1".into(),
            url: "https://example.com".into(),
        }
    }

    fn ax_fixture() -> Vec<Value> {
        vec![
            json!({
                "nodeId": "1", "ignored": false,
                "role": {"value": "RootWebArea"}, "name": {"value": "Example"},
                "childIds": ["2", "3", "6"], "backendDOMNodeId": 1
            }),
            json!({
                "nodeId": "2", "parentId": "1", "ignored": false,
                "role": {"value": "heading"}, "name": {"value": "Welcome"},
                "childIds": [], "backendDOMNodeId": 2
            }),
            json!({
                "nodeId": "3", "parentId": "1", "ignored": false,
                "role": {"value": "form"}, "name": {"value": "Login"},
                "childIds": ["4", "5"], "backendDOMNodeId": 3
            }),
            json!({
                "nodeId": "4", "parentId": "3", "ignored": false,
                "role": {"value": "textbox"}, "name": {"value": "Email"},
                "properties": [{"name": "required", "value": {"value": true}}],
                "childIds": [], "backendDOMNodeId": 4
            }),
            json!({
                "nodeId": "5", "parentId": "3", "ignored": false,
                "role": {"value": "button"}, "name": {"value": "Sign in"},
                "childIds": [], "backendDOMNodeId": 5
            }),
            json!({
                "nodeId": "6", "parentId": "1", "ignored": true,
                "role": {"value": "generic"}, "name": {"value": ""},
                "childIds": [], "backendDOMNodeId": 6
            }),
        ]
    }

    #[test]
    fn builds_nodes_with_frame_identity() {
        let ax = parse_ax_payload(&ax_fixture());
        let (nodes, truncated) = build_frame_nodes(&ax, &frame(), Some((1280, 720)), MAX_NODES);
        assert!(!truncated);
        assert_eq!(nodes.len(), 3, "heading, textbox, button");
        assert!(nodes.iter().all(|n| n.frame_id == "frame-main"));
        assert!(nodes.iter().all(|n| n.loader_id == "loader-1"));
    }

    #[test]
    fn form_context_flows_to_descendants() {
        let ax = parse_ax_payload(&ax_fixture());
        let (nodes, _) = build_frame_nodes(&ax, &frame(), None, MAX_NODES);
        let email = nodes.iter().find(|n| n.label == "Email").unwrap();
        assert_eq!(email.placement.region, Region::Form);
        assert_eq!(email.placement.group_path, vec!["Login".to_owned()]);
        assert_eq!(email.state.unwrap().required, Some(true));
    }

    #[test]
    fn dialog_subtree_gets_dialog_region() {
        let ax = parse_ax_payload(&[
            json!({
                "nodeId": "1", "ignored": false,
                "role": {"value": "RootWebArea"}, "name": {"value": ""},
                "childIds": ["2"], "backendDOMNodeId": 1
            }),
            json!({
                "nodeId": "2", "parentId": "1", "ignored": false,
                "role": {"value": "dialog"}, "name": {"value": "Confirm"},
                "properties": [{"name": "modal", "value": {"value": true}}],
                "childIds": ["3"], "backendDOMNodeId": 2
            }),
            json!({
                "nodeId": "3", "parentId": "2", "ignored": false,
                "role": {"value": "button"}, "name": {"value": "OK"},
                "childIds": [], "backendDOMNodeId": 3
            }),
        ]);
        let (nodes, _) = build_frame_nodes(&ax, &frame(), None, MAX_NODES);

        let dialog = nodes.iter().find(|n| n.kind == NodeKind::Dialog).unwrap();
        assert_eq!(
            dialog.attributes.as_ref().unwrap().get("aria-modal"),
            Some(&"true".to_owned())
        );

        let ok = nodes.iter().find(|n| n.label == "OK").unwrap();
        assert_eq!(ok.placement.region, Region::Dialog);
        assert!(ok.is_dialog_layer());
    }

    #[test]
    fn heading_context_reaches_following_siblings() {
        let ax = parse_ax_payload(&ax_fixture());
        let (nodes, _) = build_frame_nodes(&ax, &frame(), None, MAX_NODES);

        // The heading itself carries no heading context.
        let heading = nodes.iter().find(|n| n.kind == NodeKind::Heading).unwrap();
        assert_eq!(heading.placement.heading_context, None);

        // Siblings after the heading sit under it.
        let email = nodes.iter().find(|n| n.label == "Email").unwrap();
        assert_eq!(email.placement.heading_context.as_deref(), Some("Welcome"));
    }

    #[test]
    fn budget_truncation_sets_partial() {
        let ax = parse_ax_payload(&ax_fixture());
        let (nodes, truncated) = build_frame_nodes(&ax, &frame(), None, 1);
        assert_eq!(nodes.len(), 1);
        assert!(truncated);
    }

    #[test]
    fn empty_tree_yields_no_nodes() {
        let (nodes, truncated) = build_frame_nodes(&[], &frame(), None, MAX_NODES);
        assert!(nodes.is_empty());
        assert!(!truncated);
    }

    #[test]
    fn orphan_children_recovered_via_parent_links() {
        // Root with empty childIds; children reachable only through parentId.
        let ax = parse_ax_payload(&[
            json!({
                "nodeId": "1", "ignored": false,
                "role": {"value": "RootWebArea"}, "name": {"value": ""},
                "childIds": [], "backendDOMNodeId": 1
            }),
            json!({
                "nodeId": "2", "parentId": "1", "ignored": false,
                "role": {"value": "button"}, "name": {"value": "Go"},
                "childIds": [], "backendDOMNodeId": 2
            }),
        ]);
        let (nodes, _) = build_frame_nodes(&ax, &frame(), None, MAX_NODES);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].label, "Go");
    }

    #[test]
    fn frame_collection_is_depth_first_main_first() {
        let tree = json!({
            "frame": {"id": "F0", "loaderId": "L0", "url": "https://a.com"},
            "childFrames": [
                {"frame": {"id": "F1", "loaderId": "L1", "url": "https://a.com/inner"}}
            ]
        });
        let mut frames = Vec::new();
        collect_frames(&tree, &mut frames);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame_id, "F0");
        assert_eq!(frames[1].loader_id, "L1");
    }

    #[test]
    fn quad_to_bbox() {
        let quad = json!([10.0, 20.0, 110.0, 20.0, 110.0, 60.0, 10.0, 60.0]);
        let bbox = bbox_from_quad(&quad).unwrap();
        assert!((bbox.x - 10.0).abs() < f64::EPSILON);
        assert!((bbox.width - 100.0).abs() < f64::EPSILON);
        assert!((bbox.height - 40.0).abs() < f64::EPSILON);
        assert!(bbox_from_quad(&json!([1, 2, 3])).is_none());
    }

    #[test]
    fn interactive_nodes_carry_find_locators() {
        let ax = parse_ax_payload(&ax_fixture());
        let (nodes, _) = build_frame_nodes(&ax, &frame(), None, MAX_NODES);
        let button = nodes.iter().find(|n| n.kind == NodeKind::Button).unwrap();
        let find = button.find.as_ref().unwrap();
        assert_eq!(find.primary, "role=button name=Sign in");
        assert_eq!(find.alternates, vec!["text=Sign in".to_owned()]);

        let heading = nodes.iter().find(|n| n.kind == NodeKind::Heading).unwrap();
        assert!(heading.find.is_none());
    }

    #[test]
    fn tristate_checked_parses() {
        let state = state_from_properties(&[(
            "checked".to_owned(),
            Value::String("true".to_owned()),
        )])
        .unwrap();
        assert_eq!(state.checked, Some(true));

        let state = state_from_properties(&[(
            "checked".to_owned(),
            Value::String("mixed".to_owned()),
        )])
        .unwrap();
        assert_eq!(state.checked, Some(false));
    }
}
