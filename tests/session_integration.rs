//! Integration tests for the session manager against a stateful mock
//! debugger: target lifecycle, adoption, rebind, health, disconnects, and
//! the stale-click navigation rule.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cef_bridge::bridge::Bridge;
use cef_bridge::config::{BridgeConfig, ConnectSpec};
use cef_bridge::error::BridgeError;
use cef_bridge::session::{ConnectionState, HealthStatus, SessionManager};
use cef_bridge::tools::{ToolRequest, click_with_navigation_awareness};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

// =============================================================================
// Mock browser
// =============================================================================

#[derive(Default)]
struct MockBrowser {
    targets: Vec<MockTarget>,
    next_target: usize,
    next_session: usize,
    attach_count: usize,
    detach_count: usize,
    methods: Vec<String>,
    loader_id: String,
    /// When set, DOM-level element operations fail with a stale-node error
    /// and the main frame's loader advances (simulating a click that
    /// triggered a navigation).
    stale_backend_ops: bool,
    /// Fail this many DOM-level element operations with a stale-node error
    /// *without* touching the loader (a transient stale, recoverable by
    /// re-capture).
    stale_remaining: usize,
}

#[derive(Clone)]
struct MockTarget {
    target_id: String,
    kind: String,
    url: String,
    title: String,
}

fn respond(state: &Arc<Mutex<MockBrowser>>, cmd: &Value) -> Value {
    let method = cmd["method"].as_str().unwrap_or_default().to_owned();
    let mut guard = state.lock().unwrap();
    guard.methods.push(method.clone());

    let result = match method.as_str() {
        "Target.getBrowserContexts" => json!({"browserContextIds": ["ctx-1"]}),
        "Target.getTargets" => {
            let infos: Vec<Value> = guard
                .targets
                .iter()
                .map(|t| {
                    json!({
                        "targetId": t.target_id,
                        "type": t.kind,
                        "url": t.url,
                        "title": t.title,
                    })
                })
                .collect();
            json!({ "targetInfos": infos })
        }
        "Target.createTarget" => {
            guard.next_target += 1;
            let target_id = format!("t-{}", guard.next_target);
            guard.targets.push(MockTarget {
                target_id: target_id.clone(),
                kind: "page".into(),
                url: cmd["params"]["url"].as_str().unwrap_or("about:blank").into(),
                title: String::new(),
            });
            json!({ "targetId": target_id })
        }
        "Target.attachToTarget" => {
            guard.attach_count += 1;
            guard.next_session += 1;
            json!({ "sessionId": format!("sess-{}", guard.next_session) })
        }
        "Target.detachFromTarget" => {
            guard.detach_count += 1;
            json!({})
        }
        "Target.closeTarget" => {
            let target_id = cmd["params"]["targetId"].as_str().unwrap_or_default();
            guard.targets.retain(|t| t.target_id != target_id);
            json!({ "success": true })
        }
        "Page.getFrameTree" => json!({
            "frameTree": {
                "frame": {"id": "F0", "loaderId": guard.loader_id, "url": "https://example.com"}
            }
        }),
        "Page.navigate" => json!({ "frameId": "F0", "loaderId": guard.loader_id }),
        "Page.getLayoutMetrics" => json!({
            "cssLayoutViewport": {"clientWidth": 1280, "clientHeight": 720}
        }),
        "Accessibility.getFullAXTree" => json!({
            "nodes": [
                {
                    "nodeId": "1", "ignored": false,
                    "role": {"value": "RootWebArea"}, "name": {"value": "Mock"},
                    "childIds": ["2"], "backendDOMNodeId": 1
                },
                {
                    "nodeId": "2", "parentId": "1", "ignored": false,
                    "role": {"value": "button"}, "name": {"value": "Go"},
                    "childIds": [], "backendDOMNodeId": 2
                }
            ]
        }),
        "Runtime.evaluate" => {
            let expression = cmd["params"]["expression"].as_str().unwrap_or_default();
            let value = if expression.contains("__cefBridgeMutationTick") {
                json!(1_000_000_000.0)
            } else if expression.contains("readyState") {
                json!(true)
            } else if expression.contains("localStorage") {
                json!(
                    "{\"origin\":\"https://example.com\",\"items\":[{\"name\":\"theme\",\"value\":\"dark\"}]}"
                )
            } else if expression.contains("location.href") {
                json!(format!("https://example.com/{}", guard.loader_id))
            } else if expression.contains("document.title") {
                json!("Mock Page")
            } else {
                Value::Null
            };
            json!({ "result": {"value": value} })
        }
        "Network.getCookies" => json!({
            "cookies": [
                {"name": "sid", "value": "a", "domain": "example.com", "path": "/"},
                {"name": "sid", "value": "a", "domain": "example.com", "path": "/"},
                {"name": "theme", "value": "dark", "domain": "example.com", "path": "/"}
            ]
        }),
        "DOM.scrollIntoViewIfNeeded" | "DOM.getBoxModel" => {
            if guard.stale_backend_ops {
                // The "click navigated away" shape: the node is gone and the
                // document has moved on.
                guard.loader_id = "L2".into();
                return json!({
                    "id": cmd["id"],
                    "error": {"code": -32000, "message": "No node for given backend id"}
                });
            }
            if guard.stale_remaining > 0 {
                guard.stale_remaining -= 1;
                return json!({
                    "id": cmd["id"],
                    "error": {"code": -32000, "message": "Node is detached from document"}
                });
            }
            if method == "DOM.getBoxModel" {
                json!({ "model": {"border": [0.0, 0.0, 10.0, 0.0, 10.0, 10.0, 0.0, 10.0]} })
            } else {
                json!({})
            }
        }
        _ => json!({}),
    };

    let mut response = json!({ "id": cmd["id"], "result": result });
    if let Some(sid) = cmd.get("sessionId") {
        response["sessionId"] = sid.clone();
    }
    response
}

async fn start_mock_browser(state: Arc<Mutex<MockBrowser>>) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        // Connections are handled inline: aborting this task severs the
        // live browser socket, which is exactly what the disconnect tests
        // need to simulate.
        while let Ok((stream, _)) = listener.accept().await {
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut sink, mut source) = ws.split();
            while let Some(Ok(Message::Text(text))) = source.next().await {
                let cmd: Value = serde_json::from_str(&text).unwrap();
                let response = respond(&state, &cmd);
                if sink
                    .send(Message::Text(response.to_string().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    });
    (format!("ws://{addr}"), handle)
}

fn fast_config() -> BridgeConfig {
    BridgeConfig {
        connect_timeout: Duration::from_secs(2),
        quiet_window: Duration::from_millis(50),
        post_navigation_quiet_cap: Duration::from_millis(300),
        ..BridgeConfig::default()
    }
}

fn fresh_state() -> Arc<Mutex<MockBrowser>> {
    Arc::new(Mutex::new(MockBrowser {
        loader_id: "L1".into(),
        ..MockBrowser::default()
    }))
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn connect_create_navigate_shutdown_leaves_external_browser_alive() {
    let state = fresh_state();
    let (ws_url, server) = start_mock_browser(Arc::clone(&state)).await;

    let manager = SessionManager::new(fast_config());
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&transitions);
    let _listener = manager
        .subscribe_state(move |change| {
            seen.lock().unwrap().push((change.previous, change.current));
        })
        .await;

    manager.connect(&ConnectSpec::WsUrl(ws_url)).await.unwrap();
    assert_eq!(manager.state().await, ConnectionState::Connected);
    assert!(manager.is_external().await);

    let page = manager.create_page(None).await.unwrap();
    assert_eq!(manager.page_count().await, 1);

    manager
        .navigate_to(&page, "https://example.com/next")
        .await
        .unwrap();
    assert_eq!(manager.page_url(&page).await.unwrap(), "https://example.com/next");

    manager.shutdown().await.unwrap();
    assert_eq!(manager.state().await, ConnectionState::Idle);

    // External browser: detached, never closed.
    let methods = state.lock().unwrap().methods.clone();
    assert!(methods.iter().any(|m| m == "Target.detachFromTarget"));
    assert!(!methods.iter().any(|m| m == "Browser.close"));

    // Exactly one event per transition, no skipped states.
    let transitions = transitions.lock().unwrap().clone();
    assert_eq!(
        transitions,
        vec![
            (ConnectionState::Idle, ConnectionState::Connecting),
            (ConnectionState::Connecting, ConnectionState::Connected),
            (ConnectionState::Connected, ConnectionState::Disconnecting),
            (ConnectionState::Disconnecting, ConnectionState::Idle),
        ]
    );

    // Shutdown twice: idempotent, still idle.
    manager.shutdown().await.unwrap();
    assert_eq!(manager.state().await, ConnectionState::Idle);

    server.abort();
}

#[tokio::test]
async fn adopt_page_filters_targets_and_is_idempotent() {
    let state = fresh_state();
    state.lock().unwrap().targets = vec![
        MockTarget {
            target_id: "ext-1".into(),
            kind: "page".into(),
            url: "chrome-extension://abc/popup.html".into(),
            title: "Extension".into(),
        },
        MockTarget {
            target_id: "sw-1".into(),
            kind: "service_worker".into(),
            url: "https://example.com/sw.js".into(),
            title: String::new(),
        },
        MockTarget {
            target_id: "tab-1".into(),
            kind: "page".into(),
            url: "https://example.com/first".into(),
            title: "First".into(),
        },
        MockTarget {
            target_id: "tab-2".into(),
            kind: "page".into(),
            url: "https://example.com/second".into(),
            title: "Second".into(),
        },
    ];
    let (ws_url, server) = start_mock_browser(Arc::clone(&state)).await;

    let manager = SessionManager::new(fast_config());
    manager.connect(&ConnectSpec::WsUrl(ws_url)).await.unwrap();

    // Index 0 skips the extension page and the service worker.
    let page = manager.adopt_page(0).await.unwrap();
    assert_eq!(
        manager.page_url(&page).await.unwrap(),
        "https://example.com/first"
    );

    let attach_count_after_first = state.lock().unwrap().attach_count;
    let again = manager.adopt_page(0).await.unwrap();
    assert_eq!(page, again, "re-adoption returns the same handle");
    assert_eq!(
        state.lock().unwrap().attach_count,
        attach_count_after_first,
        "no second CDP session for a re-adopted page"
    );
    assert_eq!(manager.page_count().await, 1);

    let second = manager.adopt_page(1).await.unwrap();
    assert_ne!(page, second);
    assert_eq!(manager.page_count().await, 2);

    server.abort();
}

#[tokio::test]
async fn rebind_swaps_the_session_and_detaches_the_old_one() {
    let state = fresh_state();
    let (ws_url, server) = start_mock_browser(Arc::clone(&state)).await;

    let manager = SessionManager::new(fast_config());
    manager.connect(&ConnectSpec::WsUrl(ws_url)).await.unwrap();
    let page = manager.create_page(None).await.unwrap();

    let before = manager.session_for(&page).await.unwrap();
    let attaches_before = state.lock().unwrap().attach_count;

    manager.rebind_cdp(&page).await.unwrap();

    let after = manager.session_for(&page).await.unwrap();
    assert_ne!(before.session_id(), after.session_id());
    assert_eq!(after.target_id(), before.target_id());
    assert!(state.lock().unwrap().attach_count > attaches_before);
    assert!(state.lock().unwrap().detach_count >= 1);

    server.abort();
}

#[tokio::test]
async fn rebind_of_closed_target_reports_page_closed() {
    let state = fresh_state();
    let (ws_url, server) = start_mock_browser(Arc::clone(&state)).await;

    let manager = SessionManager::new(fast_config());
    manager.connect(&ConnectSpec::WsUrl(ws_url)).await.unwrap();
    let page = manager.create_page(None).await.unwrap();

    // The target vanishes behind the manager's back.
    state.lock().unwrap().targets.clear();

    let err = manager.rebind_cdp(&page).await.unwrap_err();
    assert!(matches!(err, BridgeError::PageClosed(_)));

    server.abort();
}

#[tokio::test]
async fn health_tracks_connection_and_pages() {
    let state = fresh_state();
    let (ws_url, server) = start_mock_browser(Arc::clone(&state)).await;

    let manager = SessionManager::new(fast_config());
    assert_eq!(manager.connection_health().await, HealthStatus::Failed);

    manager.connect(&ConnectSpec::WsUrl(ws_url)).await.unwrap();
    let _page = manager.create_page(None).await.unwrap();
    assert_eq!(manager.connection_health().await, HealthStatus::Healthy);

    manager.shutdown().await.unwrap();
    assert_eq!(manager.connection_health().await, HealthStatus::Failed);

    server.abort();
}

#[tokio::test]
async fn unexpected_disconnect_transitions_to_failed_and_clears_pages() {
    let state = fresh_state();
    let (ws_url, server) = start_mock_browser(Arc::clone(&state)).await;

    let manager = SessionManager::new(fast_config());
    manager.connect(&ConnectSpec::WsUrl(ws_url)).await.unwrap();
    let _page = manager.create_page(None).await.unwrap();
    assert_eq!(manager.page_count().await, 1);

    server.abort();

    // The disconnect watcher observes the dead transport.
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if manager.state().await == ConnectionState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("manager should reach failed after the browser dies");
    assert_eq!(manager.page_count().await, 0);

    // Failed is re-entrant: a new connect is allowed.
    let state2 = fresh_state();
    let (ws_url2, server2) = start_mock_browser(state2).await;
    manager.connect(&ConnectSpec::WsUrl(ws_url2)).await.unwrap();
    assert_eq!(manager.state().await, ConnectionState::Connected);

    server2.abort();
}

#[tokio::test]
async fn connect_timeout_races_the_attempt() {
    // A TCP listener that accepts but never completes the WS handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let mut sockets = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            sockets.push(stream);
        }
    });

    let config = BridgeConfig {
        connect_timeout: Duration::from_millis(300),
        ..fast_config()
    };
    let manager = SessionManager::new(config);
    let err = manager
        .connect(&ConnectSpec::WsUrl(format!("ws://{addr}")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::ConnectionTimeout { .. } | BridgeError::Connection { .. }
    ));
    assert_eq!(manager.state().await, ConnectionState::Failed);

    server.abort();
}

#[tokio::test]
async fn malformed_endpoint_fails_before_io() {
    let err = ConnectSpec::classify("definitely not an endpoint").unwrap_err();
    assert!(matches!(err, BridgeError::InvalidUrl(_)));
}

#[tokio::test]
async fn storage_state_dedups_cookies_and_collects_origins() {
    let state = fresh_state();
    let (ws_url, server) = start_mock_browser(Arc::clone(&state)).await;

    let manager = SessionManager::new(fast_config());
    manager.connect(&ConnectSpec::WsUrl(ws_url)).await.unwrap();
    let _page = manager
        .create_page(Some("https://example.com/app"))
        .await
        .unwrap();

    let storage = manager.save_storage_state().await.unwrap();
    // The mock serves a duplicated (sid, example.com, /) cookie.
    assert_eq!(storage.cookies.len(), 2);
    assert_eq!(storage.origins.len(), 1);
    assert_eq!(storage.origins[0].origin, "https://example.com");
    assert_eq!(storage.origins[0].local_storage[0].name, "theme");

    server.abort();
}

#[tokio::test]
async fn transient_stale_action_recovers_after_recapture() {
    let state = fresh_state();
    state.lock().unwrap().targets = vec![MockTarget {
        target_id: "tab-1".into(),
        kind: "page".into(),
        url: "https://example.com".into(),
        title: "Tab".into(),
    }];
    let (ws_url, server) = start_mock_browser(Arc::clone(&state)).await;

    // Drive the full verb surface: connect adopts the first tab and takes
    // the initial capture, which registers the mock's button as e1.
    let bridge = Bridge::new(fast_config());
    bridge
        .handle(ToolRequest::ConnectBrowser {
            endpoint_url: Some(ws_url),
        })
        .await
        .unwrap();

    // One transient stale failure; the loader stays put.
    state.lock().unwrap().stale_remaining = 1;

    let reply = bridge
        .handle(ToolRequest::Hover {
            eid: "e1".into(),
            page_id: None,
        })
        .await
        .unwrap();

    assert_eq!(reply["outcome"]["status"], "success");
    assert_eq!(reply["outcome"]["navigated"], false);
    assert!(
        reply["outcome"]["note"]
            .as_str()
            .unwrap()
            .contains("recovered"),
        "a stale retry that recovers is a note, not an error"
    );
    assert_eq!(state.lock().unwrap().stale_remaining, 0);

    server.abort();
}

#[tokio::test]
async fn stale_click_with_loader_change_is_a_navigated_success() {
    let state = fresh_state();
    let (ws_url, server) = start_mock_browser(Arc::clone(&state)).await;

    let manager = SessionManager::new(fast_config());
    manager.connect(&ConnectSpec::WsUrl(ws_url)).await.unwrap();
    let page = manager.create_page(None).await.unwrap();
    let session = manager.session_for(&page).await.unwrap();

    // Element ops fail stale and the loader advances mid-click.
    state.lock().unwrap().stale_backend_ops = true;

    let outcome = click_with_navigation_awareness(&session, 42, "e1")
        .await
        .unwrap();
    assert_eq!(outcome.status, "success");
    assert!(outcome.navigated);

    server.abort();
}
