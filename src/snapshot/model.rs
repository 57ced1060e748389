use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Semantic kind of a readable node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Button,
    Link,
    Input,
    Checkbox,
    Radio,
    Select,
    Combobox,
    Slider,
    Switch,
    Searchbox,
    Tab,
    MenuItem,
    Heading,
    Dialog,
    Image,
    List,
    ListItem,
    Text,
    Other,
}

impl NodeKind {
    /// Map a debugger accessibility role to a node kind. Roles with no
    /// readable meaning return `None` and the node is dropped.
    #[must_use]
    pub fn from_ax_role(role: &str) -> Option<Self> {
        Some(match role {
            "button" => Self::Button,
            "link" => Self::Link,
            "textbox" | "textfield" | "spinbutton" => Self::Input,
            "checkbox" => Self::Checkbox,
            "radio" => Self::Radio,
            "listbox" => Self::Select,
            "combobox" => Self::Combobox,
            "slider" => Self::Slider,
            "switch" => Self::Switch,
            "searchbox" => Self::Searchbox,
            "tab" => Self::Tab,
            "menuitem" | "menuitemcheckbox" | "menuitemradio" => Self::MenuItem,
            "heading" => Self::Heading,
            "dialog" | "alertdialog" => Self::Dialog,
            "image" | "img" => Self::Image,
            "list" => Self::List,
            "listitem" => Self::ListItem,
            "StaticText" | "text" | "paragraph" => Self::Text,
            // Structural containers carry placement context, not content.
            "generic" | "none" | "presentation" | "InlineTextBox" | "LineBreak"
            | "RootWebArea" | "WebArea" | "group" | "region" | "form" | "main" | "banner"
            | "navigation" | "contentinfo" | "complementary" => return None,
            _ => Self::Other,
        })
    }

    /// Whether this kind receives a short stable eid for interaction.
    #[must_use]
    pub fn is_interactive(self) -> bool {
        matches!(
            self,
            Self::Button
                | Self::Link
                | Self::Input
                | Self::Checkbox
                | Self::Radio
                | Self::Select
                | Self::Combobox
                | Self::Slider
                | Self::Switch
                | Self::Searchbox
                | Self::Tab
                | Self::MenuItem
        )
    }
}

/// Page region a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Main,
    Header,
    Navigation,
    Footer,
    Aside,
    Form,
    Dialog,
}

/// Vertical screen zone, from viewport thirds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreenZone {
    Top,
    Middle,
    Bottom,
    Offscreen,
}

impl ScreenZone {
    /// Classify a bounding box's vertical center against a viewport height.
    #[must_use]
    pub fn classify(bbox: &BBox, viewport_height: f64) -> Self {
        let center = bbox.y + bbox.height / 2.0;
        if center < 0.0 || center > viewport_height {
            return Self::Offscreen;
        }
        let third = viewport_height / 3.0;
        if center < third {
            Self::Top
        } else if center < 2.0 * third {
            Self::Middle
        } else {
            Self::Bottom
        }
    }
}

/// Axis-aligned bounding box in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Geometric facts about a node. Every field is best-effort; an unknown
/// z-index stays `None` and is *not* defaulted, which keeps class-based
/// overlay detection from firing on nodes whose stacking is unknown.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Layout {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_zone: Option<ScreenZone>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i32>,
}

/// Interaction-relevant state flags, present only when known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expanded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focused: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
}

/// Where a node sits in the page's semantic structure.
#[derive(Debug, Clone, Serialize)]
pub struct Placement {
    pub region: Region,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub group_path: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading_context: Option<String>,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            region: Region::Main,
            group_id: None,
            group_path: Vec::new(),
            heading_context: None,
        }
    }
}

/// Locator strings for re-finding the element outside snapshot identity.
#[derive(Debug, Clone, Serialize)]
pub struct FindLocators {
    pub primary: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alternates: Vec<String>,
}

/// The composite key uniquely identifying a node within one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CompositeKey {
    pub frame_id: String,
    pub loader_id: String,
    pub backend_node_id: i64,
}

/// A reference to an element that stays meaningful across turns: the
/// composite key plus the snapshot it was captured in. A bare backend node
/// id is not portable across loader changes; this is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ScopedRef {
    pub snapshot_id: String,
    pub frame_id: String,
    pub loader_id: String,
    pub backend_node_id: i64,
}

impl ScopedRef {
    /// The composite-key portion of this reference.
    #[must_use]
    pub fn key(&self) -> CompositeKey {
        CompositeKey {
            frame_id: self.frame_id.clone(),
            loader_id: self.loader_id.clone(),
            backend_node_id: self.backend_node_id,
        }
    }
}

/// One node of the semantic page model.
#[derive(Debug, Clone, Serialize)]
pub struct ReadableNode {
    pub backend_node_id: i64,
    pub frame_id: String,
    pub loader_id: String,
    pub kind: NodeKind,
    pub label: String,
    #[serde(rename = "where")]
    pub placement: Placement,
    pub layout: Layout,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<NodeState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub find: Option<FindLocators>,
}

impl ReadableNode {
    /// The node's composite key.
    #[must_use]
    pub fn key(&self) -> CompositeKey {
        CompositeKey {
            frame_id: self.frame_id.clone(),
            loader_id: self.loader_id.clone(),
            backend_node_id: self.backend_node_id,
        }
    }

    /// A scoped reference to this node within `snapshot_id`.
    #[must_use]
    pub fn scoped_ref(&self, snapshot_id: &str) -> ScopedRef {
        ScopedRef {
            snapshot_id: snapshot_id.to_owned(),
            frame_id: self.frame_id.clone(),
            loader_id: self.loader_id.clone(),
            backend_node_id: self.backend_node_id,
        }
    }

    /// Content hash over the node's observable content: kind, label, state
    /// flags, and attributes. Used for modified-detection and `rd-` eids.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{:?}", self.kind).as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.label.as_bytes());
        hasher.update([0x1f]);
        if let Some(state) = &self.state {
            hasher.update(format!("{state:?}").as_bytes());
        }
        hasher.update([0x1f]);
        if let Some(attributes) = &self.attributes {
            let mut entries: Vec<_> = attributes.iter().collect();
            entries.sort();
            for (k, v) in entries {
                hasher.update(k.as_bytes());
                hasher.update([0x1e]);
                hasher.update(v.as_bytes());
            }
        }
        short_hex(&hasher.finalize())
    }

    /// Whether this node belongs to a dialog layer: dialog region or dialog
    /// kind. The overlay extractor treats region and kind as one membership
    /// test; see DESIGN.md before narrowing this.
    #[must_use]
    pub fn is_dialog_layer(&self) -> bool {
        self.placement.region == Region::Dialog || self.kind == NodeKind::Dialog
    }
}

/// An immutable semantic page model.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub version: u64,
    pub url: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport: Option<(u32, u32)>,
    #[serde(skip)]
    pub captured_at: SystemTime,
    pub nodes: Vec<ReadableNode>,
}

impl Snapshot {
    /// Mint a fresh snapshot id.
    #[must_use]
    pub fn generate_id() -> String {
        format!("snap-{}", uuid::Uuid::new_v4().simple())
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn interactive_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.kind.is_interactive()).count()
    }

    /// Look up a node by composite key.
    #[must_use]
    pub fn find_by_key(&self, key: &CompositeKey) -> Option<&ReadableNode> {
        self.nodes.iter().find(|n| {
            n.backend_node_id == key.backend_node_id
                && n.frame_id == key.frame_id
                && n.loader_id == key.loader_id
        })
    }

    /// Content fingerprint over the ordered node list: composite keys plus
    /// content hashes. Two captures of a logically unchanged page produce
    /// the same fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for node in &self.nodes {
            hasher.update(node.frame_id.as_bytes());
            hasher.update([0x1f]);
            hasher.update(node.loader_id.as_bytes());
            hasher.update([0x1f]);
            hasher.update(node.backend_node_id.to_le_bytes());
            hasher.update([0x1f]);
            hasher.update(node.content_hash().as_bytes());
            hasher.update([0x1e]);
        }
        short_hex(&hasher.finalize())
    }

    /// The main-frame loader id, taken from the first node (every snapshot
    /// lists main-frame nodes first). `None` for an empty snapshot.
    #[must_use]
    pub fn main_loader_id(&self) -> Option<&str> {
        self.nodes.first().map(|n| n.loader_id.as_str())
    }
}

/// First 16 hex chars of a digest; enough to key maps, short enough to ship.
fn short_hex(digest: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(16);
    for b in digest.iter().take(8) {
        let _ = write!(s, "{b:02x}");
    }
    s
}
