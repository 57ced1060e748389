use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{BridgeConfig, ConnectSpec, LaunchOptions};
use crate::delta::{PageSnapshotState, TurnResponse};
use crate::error::BridgeError;
use crate::page::stabilize_after_action;
use crate::session::{PageId, SessionManager};
use crate::snapshot::{
    AxTreeCompiler, CaptureOptions, ElementEntry, RuntimeHealth, Snapshot, capture_with_recovery,
};
use crate::tools::{
    ActionOutcome, FindFilters, ScrollDirection, ToolRequest, build_state_response,
    click_with_navigation_awareness, go_back, go_forward, hover_node, press_key, reload_page,
    scroll_into_view, scroll_page, select_value, type_text,
};

/// An element-targeted verb, ready to run against a resolved backend node.
/// Every variant goes through the same stale recovery ladder.
enum ElementAction<'a> {
    Click,
    Type(&'a str),
    Select(&'a str),
    Hover,
    ScrollIntoView,
}

/// The application context handed to tool handlers: one session manager,
/// one compiler, and one delta state machine per page. Constructed in
/// `main` and torn down with `close_session`; nothing here is global.
pub struct Bridge {
    config: BridgeConfig,
    session: SessionManager,
    compiler: AxTreeCompiler,
    states: Mutex<HashMap<PageId, PageSnapshotState>>,
}

impl Bridge {
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            session: SessionManager::new(config.clone()),
            compiler: AxTreeCompiler::default(),
            states: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// The session manager (operator surface and tests).
    #[must_use]
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Handle one verb and render its JSON result.
    ///
    /// # Errors
    ///
    /// Input-validation failures and runtime failures, per the verb.
    pub async fn handle(&self, request: ToolRequest) -> Result<Value, BridgeError> {
        match request {
            ToolRequest::LaunchBrowser { headless } => {
                let opts = LaunchOptions {
                    headless: headless.unwrap_or(true),
                    ..LaunchOptions::default()
                };
                self.session.launch(&opts).await?;
                let page = self.session.create_page(None).await?;
                self.state_reply(&page, None).await
            }
            ToolRequest::ConnectBrowser { endpoint_url } => {
                let spec = match endpoint_url.as_deref() {
                    Some(endpoint) => ConnectSpec::classify(endpoint)?,
                    None => ConnectSpec::default_from_env(),
                };
                self.session.connect(&spec).await?;
                let page = self.session.adopt_page(0).await?;
                self.state_reply(&page, None).await
            }
            ToolRequest::ClosePage { page_id } => {
                let page = PageId::from_raw(&page_id);
                self.session.close_page(&page).await?;
                self.states.lock().await.remove(&page);
                Ok(serde_json::json!({ "closed": page_id }))
            }
            ToolRequest::CloseSession => {
                self.session.shutdown().await?;
                self.states.lock().await.clear();
                Ok(serde_json::json!({ "closed": "session" }))
            }
            ToolRequest::Navigate { url, page_id } => {
                let page = self.resolve_or_create(page_id.as_deref()).await?;
                self.session.navigate_to(&page, &url).await?;
                self.state_reply(&page, None).await
            }
            ToolRequest::GoBack { page_id } => {
                let page = self.resolve(page_id.as_deref()).await?;
                let session = self.session.session_for(&page).await?;
                let outcome = go_back(&session).await?;
                self.settled_state_reply(&page, outcome).await
            }
            ToolRequest::GoForward { page_id } => {
                let page = self.resolve(page_id.as_deref()).await?;
                let session = self.session.session_for(&page).await?;
                let outcome = go_forward(&session).await?;
                self.settled_state_reply(&page, outcome).await
            }
            ToolRequest::Reload { page_id } => {
                let page = self.resolve(page_id.as_deref()).await?;
                let session = self.session.session_for(&page).await?;
                let outcome = reload_page(&session).await?;
                self.settled_state_reply(&page, outcome).await
            }
            ToolRequest::CaptureSnapshot { page_id } => {
                let page = self.resolve(page_id.as_deref()).await?;
                self.state_reply(&page, None).await
            }
            ToolRequest::FindElements { filters, page_id } => {
                let page = self.resolve(page_id.as_deref()).await?;
                self.find_elements(&page, &filters).await
            }
            ToolRequest::GetNodeDetails { eid, page_id } => {
                let page = self.resolve(page_id.as_deref()).await?;
                self.node_details(&page, &eid).await
            }
            ToolRequest::ScrollElementIntoView { eid, page_id } => {
                let page = self.resolve(page_id.as_deref()).await?;
                let outcome = self
                    .run_element_action(&page, &eid, ElementAction::ScrollIntoView)
                    .await?;
                Ok(serde_json::json!({ "scrolled": eid, "outcome": outcome }))
            }
            ToolRequest::ScrollPage {
                direction,
                amount,
                page_id,
            } => {
                let page = self.resolve(page_id.as_deref()).await?;
                self.do_scroll_page(&page, direction, amount).await
            }
            ToolRequest::Click { eid, page_id } => {
                let page = self.resolve(page_id.as_deref()).await?;
                self.do_click(&page, &eid).await
            }
            ToolRequest::Type { eid, text, page_id } => {
                let page = self.resolve(page_id.as_deref()).await?;
                let outcome = self
                    .run_element_action(&page, &eid, ElementAction::Type(&text))
                    .await?;
                self.settled_state_reply(&page, outcome).await
            }
            ToolRequest::Press { key, page_id } => {
                let page = self.resolve(page_id.as_deref()).await?;
                let session = self.session.session_for(&page).await?;
                let outcome = press_key(&session, &key).await?;
                self.settled_state_reply(&page, outcome).await
            }
            ToolRequest::Select {
                eid,
                value,
                page_id,
            } => {
                let page = self.resolve(page_id.as_deref()).await?;
                let outcome = self
                    .run_element_action(&page, &eid, ElementAction::Select(&value))
                    .await?;
                self.settled_state_reply(&page, outcome).await
            }
            ToolRequest::Hover { eid, page_id } => {
                let page = self.resolve(page_id.as_deref()).await?;
                let outcome = self
                    .run_element_action(&page, &eid, ElementAction::Hover)
                    .await?;
                self.settled_state_reply(&page, outcome).await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Verb plumbing
    // -----------------------------------------------------------------------

    async fn resolve(&self, page_id: Option<&str>) -> Result<PageId, BridgeError> {
        let id = page_id.map(PageId::from_raw);
        self.session.resolve_page(id.as_ref()).await
    }

    async fn resolve_or_create(&self, page_id: Option<&str>) -> Result<PageId, BridgeError> {
        let id = page_id.map(PageId::from_raw);
        self.session.resolve_page_or_create(id.as_ref()).await
    }

    async fn entry_for(&self, page: &PageId, eid: &str) -> Result<ElementEntry, BridgeError> {
        let states = self.states.lock().await;
        let state = states.get(page).ok_or_else(|| BridgeError::SnapshotRequired {
            page_id: page.to_string(),
        })?;
        Ok(state.elements().resolve(eid)?.clone())
    }

    /// One attempt of an element-targeted action.
    ///
    /// The eid resolves and the session is fetched fresh on every attempt:
    /// a recovery capture between attempts may have rebound the page's CDP
    /// session, and the pre-retry clone would point at the detached one.
    async fn try_element_action(
        &self,
        page: &PageId,
        eid: &str,
        action: &ElementAction<'_>,
    ) -> Result<ActionOutcome, BridgeError> {
        let entry = self.entry_for(page, eid).await?;
        let session = self.session.session_for(page).await?;
        let backend_node_id = entry.scoped.backend_node_id;
        match action {
            ElementAction::Click => {
                click_with_navigation_awareness(&session, backend_node_id, eid).await
            }
            ElementAction::Type(text) => type_text(&session, backend_node_id, text, eid).await,
            ElementAction::Select(value) => {
                select_value(&session, backend_node_id, value, eid).await
            }
            ElementAction::Hover => hover_node(&session, backend_node_id, eid).await,
            ElementAction::ScrollIntoView => {
                scroll_into_view(&session, backend_node_id, eid).await?;
                Ok(ActionOutcome::success())
            }
        }
    }

    /// Run an element-targeted action with the stale recovery ladder: a
    /// stale-element failure triggers one re-capture, re-resolve, and
    /// retry. A retry that recovers carries a non-fatal note rather than
    /// surfacing as an error.
    async fn run_element_action(
        &self,
        page: &PageId,
        eid: &str,
        action: ElementAction<'_>,
    ) -> Result<ActionOutcome, BridgeError> {
        match self.try_element_action(page, eid, &action).await {
            Ok(outcome) => Ok(outcome),
            Err(BridgeError::StaleElement { .. }) => {
                debug!(eid, "stale element; re-capturing and retrying once");
                let _ = self.capture_turn(page).await?;
                let outcome = self.try_element_action(page, eid, &action).await?;
                Ok(outcome.with_note("recovered after stale retry"))
            }
            Err(other) => Err(other),
        }
    }

    /// Click, settle, and reply. A click that navigated settles in the next
    /// turn's full capture; a local mutation stabilizes here.
    async fn do_click(&self, page: &PageId, eid: &str) -> Result<Value, BridgeError> {
        let outcome = self
            .run_element_action(page, eid, ElementAction::Click)
            .await?;

        if !outcome.navigated {
            let session = self.session.session_for(page).await?;
            let _ = stabilize_after_action(
                &session,
                self.config.quiet_window,
                std::time::Duration::from_secs(3),
            )
            .await;
        }
        self.state_reply(page, Some(outcome)).await
    }

    async fn do_scroll_page(
        &self,
        page: &PageId,
        direction: ScrollDirection,
        amount: f64,
    ) -> Result<Value, BridgeError> {
        let session = self.session.session_for(page).await?;
        let outcome = scroll_page(&session, direction, amount).await?;
        self.settled_state_reply(page, outcome).await
    }

    async fn find_elements(
        &self,
        page: &PageId,
        filters: &FindFilters,
    ) -> Result<Value, BridgeError> {
        let states = self.states.lock().await;
        let state = states.get(page).ok_or_else(|| BridgeError::SnapshotRequired {
            page_id: page.to_string(),
        })?;
        let matches: Vec<Value> = state
            .context_nodes()
            .into_iter()
            .filter(|node| filters.matches(node))
            .map(|node| {
                let eid = state.elements().eid_for_key(&node.key());
                serde_json::json!({
                    "eid": eid,
                    "kind": node.kind,
                    "label": node.label,
                    "region": node.placement.region,
                })
            })
            .collect();
        Ok(serde_json::json!({ "matches": matches }))
    }

    async fn node_details(&self, page: &PageId, eid: &str) -> Result<Value, BridgeError> {
        let states = self.states.lock().await;
        let state = states.get(page).ok_or_else(|| BridgeError::SnapshotRequired {
            page_id: page.to_string(),
        })?;
        let entry = state.elements().resolve(eid)?;
        let key = entry.scoped.key();
        let node = state
            .context_nodes()
            .into_iter()
            .find(|n| n.key() == key)
            .cloned()
            .ok_or_else(|| BridgeError::StaleElement {
                eid: eid.to_owned(),
                detail: "absent from the current snapshot".into(),
            })?;
        Ok(serde_json::json!({ "eid": eid, "node": node }))
    }

    // -----------------------------------------------------------------------
    // Capture pipeline
    // -----------------------------------------------------------------------

    /// Capture with recovery and run the delta state machine. An invalid
    /// capture that could not be recovered is not an error here: the health
    /// record describes it and the turn simply has no state payload. A dead
    /// session that resisted rebinding is an error.
    async fn capture_turn(
        &self,
        page: &PageId,
    ) -> Result<(Option<(TurnResponse, Snapshot)>, RuntimeHealth), BridgeError> {
        let opts = CaptureOptions {
            max_retries: self.config.max_capture_retries,
            quiet_window: self.config.quiet_window,
            ..CaptureOptions::default()
        };
        let (report, health) =
            capture_with_recovery(&self.compiler, &self.session, page, &opts, 0).await?;
        let Some(snapshot) = report.snapshot else {
            if report.code == crate::snapshot::HealthCode::CdpSessionDead {
                return Err(BridgeError::CdpSessionDead {
                    page_id: page.to_string(),
                });
            }
            return Ok((None, health));
        };

        let mut states = self.states.lock().await;
        let state = states
            .entry(page.clone())
            .or_insert_with(|| PageSnapshotState::new(self.config.eid_stale_turns));
        let response = state.compute_response(snapshot.clone());
        let mut snapshot = snapshot;
        snapshot.version = version_of(&response).unwrap_or(snapshot.version);
        Ok((Some((response, snapshot)), health))
    }

    /// Capture a turn and render the full JSON reply.
    async fn state_reply(
        &self,
        page: &PageId,
        outcome: Option<ActionOutcome>,
    ) -> Result<Value, BridgeError> {
        let (turn, health) = self.capture_turn(page).await?;

        let mut reply = serde_json::json!({
            "page_id": page.as_str(),
            "health": health,
        });
        match turn {
            Some((response, snapshot)) => {
                let states = self.states.lock().await;
                let state = states
                    .get(page)
                    .ok_or_else(|| BridgeError::Internal("state vanished mid-turn".into()))?;
                let rendered = build_state_response(state, &response, &snapshot);
                reply["state"] = serde_json::to_value(rendered)
                    .map_err(|e| BridgeError::Internal(e.to_string()))?;
            }
            None => {
                reply["state"] = Value::Null;
            }
        }
        if let Some(outcome) = outcome {
            reply["outcome"] = serde_json::to_value(outcome)
                .map_err(|e| BridgeError::Internal(e.to_string()))?;
        }
        Ok(reply)
    }

    /// Stabilize after a mutating action, then capture and reply.
    async fn settled_state_reply(
        &self,
        page: &PageId,
        outcome: ActionOutcome,
    ) -> Result<Value, BridgeError> {
        let session = self.session.session_for(page).await?;
        let _ = stabilize_after_action(
            &session,
            self.config.quiet_window,
            std::time::Duration::from_secs(3),
        )
        .await;
        self.state_reply(page, Some(outcome)).await
    }
}

/// The version a turn response carries, when it carries one.
fn version_of(response: &TurnResponse) -> Option<u64> {
    match response {
        TurnResponse::FullSnapshot { snapshot, .. } => Some(snapshot.version),
        TurnResponse::NoChange => None,
        TurnResponse::Delta { version, .. }
        | TurnResponse::OverlayOpened { version, .. }
        | TurnResponse::OverlayClosed { version, .. }
        | TurnResponse::OverlayReplaced { version, .. } => Some(*version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn action_verbs_require_a_page() {
        let bridge = Bridge::new(BridgeConfig::default());
        let err = bridge
            .handle(ToolRequest::Click {
                eid: "e1".into(),
                page_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::PageNotFound(_)));
    }

    #[tokio::test]
    async fn close_session_from_idle_succeeds() {
        let bridge = Bridge::new(BridgeConfig::default());
        let reply = bridge.handle(ToolRequest::CloseSession).await.unwrap();
        assert_eq!(reply["closed"], "session");
    }

    #[tokio::test]
    async fn launch_in_wrong_state_surfaces_invalid_state() {
        let bridge = Bridge::new(BridgeConfig::default());
        // Force the manager out of idle by failing a connect to a dead port.
        let _ = bridge
            .handle(ToolRequest::ConnectBrowser {
                endpoint_url: Some("http://127.0.0.1:1".into()),
            })
            .await;
        // From failed, a fresh launch/connect is allowed; from idle it was
        // too. Either way the state machine accepted re-entry, so this
        // request fails on connection, not state.
        let err = bridge
            .handle(ToolRequest::ConnectBrowser {
                endpoint_url: Some("http://127.0.0.1:1".into()),
            })
            .await
            .unwrap_err();
        assert!(!matches!(err, BridgeError::InvalidState { .. }));
    }
}
