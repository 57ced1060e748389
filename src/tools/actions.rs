use serde::Serialize;
use tracing::debug;

use crate::cdp::{CdpError, CdpSession};
use crate::error::{BridgeError, FailureClass, classify_cdp_failure};
use crate::tools::ScrollDirection;

/// Outcome of a mutating action.
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub status: &'static str,
    pub navigated: bool,
    /// Non-fatal note, e.g. a stale retry that recovered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ActionOutcome {
    #[must_use]
    pub fn success() -> Self {
        Self {
            status: "success",
            navigated: false,
            note: None,
        }
    }

    #[must_use]
    pub fn navigated() -> Self {
        Self {
            status: "success",
            navigated: true,
            note: None,
        }
    }

    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Convert a CDP failure during an element action into a bridge error,
/// classifying stale-node signatures.
fn action_error(e: &CdpError, eid: &str) -> BridgeError {
    let text = e.classifier_text();
    match classify_cdp_failure(&text) {
        FailureClass::StaleElement => BridgeError::StaleElement {
            eid: eid.to_owned(),
            detail: text,
        },
        _ => BridgeError::Cdp(CdpError::Internal(text)),
    }
}

/// The page's current URL, best-effort.
pub async fn current_url(session: &CdpSession) -> Option<String> {
    let result = session
        .send(
            "Runtime.evaluate",
            Some(serde_json::json!({ "expression": "location.href", "returnByValue": true })),
        )
        .await
        .ok()?;
    result["result"]["value"].as_str().map(str::to_owned)
}

/// The main frame's current loader id, best-effort.
pub async fn current_loader_id(session: &CdpSession) -> Option<String> {
    let result = session.send("Page.getFrameTree", None).await.ok()?;
    result["frameTree"]["frame"]["loaderId"]
        .as_str()
        .map(str::to_owned)
}

/// Scroll an element into view.
///
/// # Errors
///
/// `StaleElement` when the backend node is gone.
pub async fn scroll_into_view(
    session: &CdpSession,
    backend_node_id: i64,
    eid: &str,
) -> Result<(), BridgeError> {
    session
        .send(
            "DOM.scrollIntoViewIfNeeded",
            Some(serde_json::json!({ "backendNodeId": backend_node_id })),
        )
        .await
        .map(|_| ())
        .map_err(|e| action_error(&e, eid))
}

/// Center of an element's border box.
async fn element_center(
    session: &CdpSession,
    backend_node_id: i64,
    eid: &str,
) -> Result<(f64, f64), BridgeError> {
    let result = session
        .send(
            "DOM.getBoxModel",
            Some(serde_json::json!({ "backendNodeId": backend_node_id })),
        )
        .await
        .map_err(|e| action_error(&e, eid))?;
    let quad = result["model"]["border"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    let values: Vec<f64> = quad.iter().filter_map(serde_json::Value::as_f64).collect();
    if values.len() != 8 {
        return Err(BridgeError::StaleElement {
            eid: eid.to_owned(),
            detail: "box model unavailable".into(),
        });
    }
    let cx = (values[0] + values[2] + values[4] + values[6]) / 4.0;
    let cy = (values[1] + values[3] + values[5] + values[7]) / 4.0;
    Ok((cx, cy))
}

async fn dispatch_mouse(
    session: &CdpSession,
    kind: &str,
    x: f64,
    y: f64,
    button: &str,
    click_count: u32,
) -> Result<(), CdpError> {
    session
        .send(
            "Input.dispatchMouseEvent",
            Some(serde_json::json!({
                "type": kind,
                "x": x,
                "y": y,
                "button": button,
                "clickCount": click_count,
            })),
        )
        .await
        .map(|_| ())
}

/// Raw click sequence at an element's center: scroll into view, find the
/// center, press and release.
async fn click_node(
    session: &CdpSession,
    backend_node_id: i64,
    eid: &str,
) -> Result<(), BridgeError> {
    scroll_into_view(session, backend_node_id, eid).await?;
    let (x, y) = element_center(session, backend_node_id, eid).await?;
    dispatch_mouse(session, "mousePressed", x, y, "left", 1)
        .await
        .map_err(|e| action_error(&e, eid))?;
    dispatch_mouse(session, "mouseReleased", x, y, "left", 1)
        .await
        .map_err(|e| action_error(&e, eid))?;
    Ok(())
}

/// Click with navigation awareness: when the element goes stale mid-click
/// but the page's URL or main-frame loader changed across the action, the
/// click caused a navigation and the outcome is success, not an error and
/// not a retry.
///
/// # Errors
///
/// `StaleElement` when the element is gone and nothing navigated.
pub async fn click_with_navigation_awareness(
    session: &CdpSession,
    backend_node_id: i64,
    eid: &str,
) -> Result<ActionOutcome, BridgeError> {
    let pre_url = current_url(session).await;
    let pre_loader = current_loader_id(session).await;

    match click_node(session, backend_node_id, eid).await {
        Ok(()) => Ok(ActionOutcome::success()),
        Err(BridgeError::StaleElement { eid, detail }) => {
            let post_url = current_url(session).await;
            let post_loader = current_loader_id(session).await;
            let navigated = (pre_url.is_some() && post_url != pre_url)
                || (pre_loader.is_some() && post_loader != pre_loader);
            if navigated {
                debug!(eid, "stale during click but page navigated; treating as success");
                Ok(ActionOutcome::navigated())
            } else {
                Err(BridgeError::StaleElement { eid, detail })
            }
        }
        Err(other) => Err(other),
    }
}

/// Focus an element and insert text as the user would.
///
/// # Errors
///
/// `StaleElement` when the backend node is gone.
pub async fn type_text(
    session: &CdpSession,
    backend_node_id: i64,
    text: &str,
    eid: &str,
) -> Result<ActionOutcome, BridgeError> {
    session
        .send(
            "DOM.focus",
            Some(serde_json::json!({ "backendNodeId": backend_node_id })),
        )
        .await
        .map_err(|e| action_error(&e, eid))?;
    session
        .send(
            "Input.insertText",
            Some(serde_json::json!({ "text": text })),
        )
        .await
        .map_err(|e| action_error(&e, eid))?;
    Ok(ActionOutcome::success())
}

/// Windows virtual-key codes for the keys agents actually press.
fn key_code(key: &str) -> Option<i64> {
    Some(match key {
        "Enter" => 13,
        "Tab" => 9,
        "Escape" => 27,
        "Backspace" => 8,
        "Delete" => 46,
        "ArrowUp" => 38,
        "ArrowDown" => 40,
        "ArrowLeft" => 37,
        "ArrowRight" => 39,
        "PageUp" => 33,
        "PageDown" => 34,
        "Home" => 36,
        "End" => 35,
        " " | "Space" => 32,
        _ => return None,
    })
}

/// Press a named key (down then up) on the focused element.
///
/// # Errors
///
/// `InvalidArgument` for a key outside the recognized set.
pub async fn press_key(session: &CdpSession, key: &str) -> Result<ActionOutcome, BridgeError> {
    let code = key_code(key).ok_or_else(|| BridgeError::InvalidArgument {
        field: "key".into(),
        message: format!("unrecognized key `{key}`"),
    })?;
    for kind in ["rawKeyDown", "keyUp"] {
        session
            .send(
                "Input.dispatchKeyEvent",
                Some(serde_json::json!({
                    "type": kind,
                    "key": key,
                    "windowsVirtualKeyCode": code,
                    "nativeVirtualKeyCode": code,
                })),
            )
            .await?;
    }
    Ok(ActionOutcome::success())
}

/// Set a `<select>`'s value and fire its change event.
///
/// # Errors
///
/// `StaleElement` when the backend node is gone.
pub async fn select_value(
    session: &CdpSession,
    backend_node_id: i64,
    value: &str,
    eid: &str,
) -> Result<ActionOutcome, BridgeError> {
    let resolved = session
        .send(
            "DOM.resolveNode",
            Some(serde_json::json!({ "backendNodeId": backend_node_id })),
        )
        .await
        .map_err(|e| action_error(&e, eid))?;
    let object_id = resolved["object"]["objectId"]
        .as_str()
        .ok_or_else(|| BridgeError::StaleElement {
            eid: eid.to_owned(),
            detail: "node did not resolve to an object".into(),
        })?
        .to_owned();

    session
        .send(
            "Runtime.callFunctionOn",
            Some(serde_json::json!({
                "objectId": object_id,
                "functionDeclaration":
                    "function(v){this.value=v;this.dispatchEvent(new Event('change',{bubbles:true}));}",
                "arguments": [{ "value": value }],
            })),
        )
        .await
        .map_err(|e| action_error(&e, eid))?;
    Ok(ActionOutcome::success())
}

/// Move the pointer over an element.
///
/// # Errors
///
/// `StaleElement` when the backend node is gone.
pub async fn hover_node(
    session: &CdpSession,
    backend_node_id: i64,
    eid: &str,
) -> Result<ActionOutcome, BridgeError> {
    scroll_into_view(session, backend_node_id, eid).await?;
    let (x, y) = element_center(session, backend_node_id, eid).await?;
    dispatch_mouse(session, "mouseMoved", x, y, "none", 0)
        .await
        .map_err(|e| action_error(&e, eid))?;
    Ok(ActionOutcome::success())
}

/// Scroll the page by `amount` CSS pixels in `direction`.
///
/// # Errors
///
/// Propagates CDP failures.
pub async fn scroll_page(
    session: &CdpSession,
    direction: ScrollDirection,
    amount: f64,
) -> Result<ActionOutcome, BridgeError> {
    let (dx, dy) = match direction {
        ScrollDirection::Up => (0.0, -amount),
        ScrollDirection::Down => (0.0, amount),
        ScrollDirection::Left => (-amount, 0.0),
        ScrollDirection::Right => (amount, 0.0),
    };
    session
        .send(
            "Runtime.evaluate",
            Some(serde_json::json!({ "expression": format!("window.scrollBy({dx}, {dy})") })),
        )
        .await?;
    Ok(ActionOutcome::success())
}

/// History back.
///
/// # Errors
///
/// Propagates CDP failures; at the start of history this is a no-op.
pub async fn go_back(session: &CdpSession) -> Result<ActionOutcome, BridgeError> {
    navigate_history(session, -1).await
}

/// History forward.
///
/// # Errors
///
/// Propagates CDP failures; at the end of history this is a no-op.
pub async fn go_forward(session: &CdpSession) -> Result<ActionOutcome, BridgeError> {
    navigate_history(session, 1).await
}

async fn navigate_history(
    session: &CdpSession,
    offset: i64,
) -> Result<ActionOutcome, BridgeError> {
    let history = session.send("Page.getNavigationHistory", None).await?;
    let current = history["currentIndex"].as_i64().unwrap_or(0);
    let entries = history["entries"].as_array().cloned().unwrap_or_default();
    let target = current + offset;
    let Some(entry) = usize::try_from(target).ok().and_then(|i| entries.get(i)) else {
        return Ok(ActionOutcome::success().with_note("history boundary; nothing to do"));
    };
    let entry_id = entry["id"].as_i64().unwrap_or_default();
    session
        .send(
            "Page.navigateToHistoryEntry",
            Some(serde_json::json!({ "entryId": entry_id })),
        )
        .await?;
    Ok(ActionOutcome::navigated())
}

/// Reload the current document.
///
/// # Errors
///
/// Propagates CDP failures.
pub async fn reload_page(session: &CdpSession) -> Result<ActionOutcome, BridgeError> {
    session.send("Page.reload", None).await?;
    Ok(ActionOutcome::navigated())
}
