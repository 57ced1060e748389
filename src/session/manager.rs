use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cdp::{CdpClient, CdpConfig, CdpSession, ConnectedWatch};
use crate::chrome::{
    ChromeProcess, SpawnConfig, find_available_port, is_attachable_target, launch_chrome,
    query_version, read_devtools_active_port, resolve_executable,
};
use crate::config::{BridgeConfig, ConnectSpec, LaunchOptions, Transport};
use crate::error::BridgeError;
use crate::events::ListenerHandle;
use crate::page::{NetworkTracker, install_observer_hooks, wait_for_dom_content_loaded};
use crate::session::registry::{PageHandle, PageId, PageMetadata, PageRegistry};
use crate::session::state::{ConnectionState, StateChange, StateMachine};
use crate::session::storage::{
    OriginState, StorageItem, StorageState, cookie_from_value, dedup_cookies, dedup_origins,
    has_web_origin,
};

/// Aggregate connection health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Connected and every page probe succeeded.
    Healthy,
    /// Connected but at least one page probe failed.
    Degraded,
    /// Not in the connected state.
    Failed,
}

/// Owns one browser connection: the state machine, the page registry, the
/// per-page network trackers, and the CDP-rebind operation.
///
/// All mutation happens behind one async lock, giving the single-plane
/// serialization the rest of the system assumes. Methods take `&self` so the
/// manager can be shared across tool handlers.
pub struct SessionManager {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    config: BridgeConfig,
    state: StateMachine,
    browser: Option<CdpClient>,
    /// Shared browser context for new pages (first pre-existing context on
    /// connect; default context on launch).
    context_id: Option<String>,
    /// External browsers are disconnected on shutdown, never closed.
    external: bool,
    /// The child process, when this manager launched the browser itself.
    launched: Option<ChromeProcess>,
    /// Transport actually in use (a `pipe` preference resolves to WebSocket).
    transport: Transport,
    registry: PageRegistry,
    trackers: HashMap<PageId, NetworkTracker>,
    disconnect_watch: Option<JoinHandle<()>>,
}

impl SessionManager {
    /// A manager in the idle state.
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                config,
                state: StateMachine::new(),
                browser: None,
                context_id: None,
                external: false,
                launched: None,
                transport: Transport::WebSocket,
                registry: PageRegistry::new(),
                trackers: HashMap::new(),
                disconnect_watch: None,
            })),
        }
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state.current()
    }

    /// Register a connection state-change listener.
    pub async fn subscribe_state<F>(&self, listener: F) -> ListenerHandle<StateChange>
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.inner.lock().await.state.subscribe(listener)
    }

    /// Whether the connected browser is external (connect, not launch).
    pub async fn is_external(&self) -> bool {
        self.inner.lock().await.external
    }

    /// Number of registered pages.
    pub async fn page_count(&self) -> usize {
        self.inner.lock().await.registry.len()
    }

    /// Clone of a page's CDP session, for the snapshot and action layers.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::PageNotFound`.
    pub async fn session_for(&self, id: &PageId) -> Result<CdpSession, BridgeError> {
        let inner = self.inner.lock().await;
        inner
            .registry
            .get(id)
            .map(|h| h.cdp.clone())
            .ok_or_else(|| BridgeError::PageNotFound(id.to_string()))
    }

    /// A page's recorded URL.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::PageNotFound`.
    pub async fn page_url(&self, id: &PageId) -> Result<String, BridgeError> {
        let inner = self.inner.lock().await;
        inner
            .registry
            .get(id)
            .map(|h| h.metadata.url.clone())
            .ok_or_else(|| BridgeError::PageNotFound(id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Launch / connect
    // -----------------------------------------------------------------------

    /// Launch a browser and connect to it.
    ///
    /// # Errors
    ///
    /// `InvalidState` when not idle or failed; `Chrome` errors when the
    /// executable cannot be found or the process does not come up;
    /// `Connection`/`ConnectionTimeout` when the debugger handshake fails.
    /// On any failure, whatever was spawned is killed best-effort and the
    /// state is `failed`.
    pub async fn launch(&self, opts: &LaunchOptions) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        inner.state.transition(ConnectionState::Connecting, "launch")?;

        match Self::do_launch(&mut inner, opts).await {
            Ok(watch) => {
                inner.disconnect_watch =
                    Some(spawn_disconnect_watch(Arc::clone(&self.inner), watch));
                inner.state.transition(ConnectionState::Connected, "launch")?;
                info!(transport = ?inner.transport, "browser launched");
                Ok(())
            }
            Err(e) => {
                if let Some(mut process) = inner.launched.take() {
                    process.kill().await;
                }
                inner.browser = None;
                let _ = inner.state.transition(ConnectionState::Failed, "launch");
                Err(e)
            }
        }
    }

    async fn do_launch(
        inner: &mut Inner,
        opts: &LaunchOptions,
    ) -> Result<ConnectedWatch, BridgeError> {
        let executable = resolve_executable(opts.channel, opts.executable_path.as_deref())?;
        let port = find_available_port()?;

        let user_data_dir = if opts.isolated {
            None
        } else {
            opts.user_data_dir.clone()
        };

        let process = launch_chrome(
            SpawnConfig {
                executable,
                port,
                headless: opts.headless,
                viewport: opts.viewport,
                user_data_dir,
                extra_args: opts.extra_args.clone(),
            },
            Duration::from_secs(30),
        )
        .await?;

        let version = query_version("127.0.0.1", port).await?;
        let cdp_config = CdpConfig {
            connect_timeout: inner.config.connect_timeout,
            ..CdpConfig::default()
        };
        let client = CdpClient::connect(&version.ws_debugger_url, cdp_config)
            .await
            .map_err(|e| BridgeError::Connection {
                endpoint: version.ws_debugger_url.clone(),
                operation: "launch".into(),
                cause: e.to_string(),
            })?;

        let watch = client.connected_watch();
        inner.browser = Some(client);
        inner.context_id = None;
        inner.external = false;
        inner.launched = Some(process);
        // The bridge carries one concrete transport; a pipe preference is
        // served over WebSocket and the resolved choice recorded here.
        inner.transport = match opts.transport {
            Transport::Pipe | Transport::WebSocket => Transport::WebSocket,
        };
        Ok(watch)
    }

    /// Connect to an existing debugger endpoint.
    ///
    /// Observes the configured connect timeout via a racing timer; on fire
    /// the partial connection is torn down best-effort and the error is
    /// `ConnectionTimeout`.
    ///
    /// # Errors
    ///
    /// `InvalidState` when not idle or failed; `InvalidUrl` before I/O for
    /// malformed specs; `Connection`/`ConnectionTimeout` otherwise.
    pub async fn connect(&self, spec: &ConnectSpec) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        inner.state.transition(ConnectionState::Connecting, "connect")?;

        let endpoint = describe_spec(spec);
        let timeout = inner.config.connect_timeout;
        let attempt = tokio::time::timeout(timeout, Self::do_connect(&mut inner, spec)).await;

        match attempt {
            Ok(Ok(watch)) => {
                inner.disconnect_watch =
                    Some(spawn_disconnect_watch(Arc::clone(&self.inner), watch));
                inner.state.transition(ConnectionState::Connected, "connect")?;
                info!(endpoint = %endpoint, "connected to external browser");
                Ok(())
            }
            Ok(Err(e)) => {
                inner.browser = None;
                let _ = inner.state.transition(ConnectionState::Failed, "connect");
                Err(e)
            }
            Err(_elapsed) => {
                if let Some(browser) = inner.browser.take() {
                    let _ = browser.close().await;
                }
                let _ = inner.state.transition(ConnectionState::Failed, "connect");
                Err(BridgeError::ConnectionTimeout { endpoint })
            }
        }
    }

    async fn do_connect(
        inner: &mut Inner,
        spec: &ConnectSpec,
    ) -> Result<ConnectedWatch, BridgeError> {
        let ws_url = resolve_ws_url(spec).await?;

        let cdp_config = CdpConfig {
            connect_timeout: inner.config.connect_timeout,
            ..CdpConfig::default()
        };
        let client = CdpClient::connect(&ws_url, cdp_config)
            .await
            .map_err(|e| BridgeError::Connection {
                endpoint: ws_url.clone(),
                operation: "connect".into(),
                cause: e.to_string(),
            })?;

        // Select the first pre-existing browser context as the shared context.
        let context_id = client
            .send("Target.getBrowserContexts", None)
            .await
            .ok()
            .and_then(|v| {
                v["browserContextIds"]
                    .as_array()
                    .and_then(|ids| ids.first())
                    .and_then(|id| id.as_str())
                    .map(str::to_owned)
            });

        let watch = client.connected_watch();
        inner.browser = Some(client);
        inner.context_id = context_id;
        inner.external = true;
        inner.launched = None;
        inner.transport = Transport::WebSocket;
        Ok(watch)
    }

    // -----------------------------------------------------------------------
    // Page operations
    // -----------------------------------------------------------------------

    /// Open a new page in the shared context, optionally navigating to `url`
    /// with a DOMContentLoaded wait.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless connected; `InvalidUrl` for a malformed `url`;
    /// CDP errors otherwise.
    pub async fn create_page(&self, url: Option<&str>) -> Result<PageId, BridgeError> {
        if let Some(u) = url {
            validate_page_url(u)?;
        }
        let mut inner = self.inner.lock().await;
        inner.state.require(ConnectionState::Connected, "create_page")?;
        let browser = inner.browser.as_ref().ok_or(BridgeError::ContextUnavailable)?;

        let mut params = serde_json::json!({ "url": url.unwrap_or("about:blank") });
        if let Some(ctx) = &inner.context_id {
            params["browserContextId"] = serde_json::Value::String(ctx.clone());
        }
        let result = browser.send("Target.createTarget", Some(params)).await?;
        let target_id = result["targetId"]
            .as_str()
            .ok_or_else(|| BridgeError::Internal("Target.createTarget returned no targetId".into()))?
            .to_owned();

        let session = browser.attach(&target_id).await?;
        enable_page_domains(&session).await?;
        let tracker = NetworkTracker::attach(&session, inner.config.quiet_window).await?;
        install_observer_hooks(&session).await;

        if url.is_some() {
            wait_for_dom_content_loaded(&session, Duration::from_secs(10)).await;
        }

        let page_id = PageId::generate();
        let metadata = PageMetadata {
            url: url.unwrap_or("about:blank").to_owned(),
            title: String::new(),
        };
        inner
            .registry
            .insert(PageHandle::new(page_id.clone(), session, metadata));
        inner.trackers.insert(page_id.clone(), tracker);
        debug!(page_id = %page_id, "page created");
        Ok(page_id)
    }

    /// Idempotently register the `index`-th existing attachable page.
    /// Re-adopting the same page returns the same handle and does not create
    /// a second CDP session.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless connected; `PageNotFound` when the index is out
    /// of range.
    pub async fn adopt_page(&self, index: usize) -> Result<PageId, BridgeError> {
        let mut inner = self.inner.lock().await;
        inner.state.require(ConnectionState::Connected, "adopt_page")?;
        let browser = inner.browser.as_ref().ok_or(BridgeError::ContextUnavailable)?;

        let targets = browser.send("Target.getTargets", None).await?;
        let candidates: Vec<(String, String, String)> = targets["targetInfos"]
            .as_array()
            .map(|infos| {
                infos
                    .iter()
                    .filter_map(|info| {
                        let kind = info["type"].as_str()?;
                        let url = info["url"].as_str().unwrap_or_default();
                        if kind != "page" || !is_attachable_target(kind, url) {
                            return None;
                        }
                        Some((
                            info["targetId"].as_str()?.to_owned(),
                            url.to_owned(),
                            info["title"].as_str().unwrap_or_default().to_owned(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let (target_id, url, title) = candidates
            .get(index)
            .cloned()
            .ok_or_else(|| BridgeError::PageNotFound(format!("tab index {index}")))?;

        if let Some(existing) = inner.registry.find_by_target(&target_id).cloned() {
            inner.registry.touch(&existing);
            return Ok(existing);
        }

        let session = browser.attach(&target_id).await?;
        enable_page_domains(&session).await?;
        let tracker = NetworkTracker::attach(&session, inner.config.quiet_window).await?;
        install_observer_hooks(&session).await;

        let page_id = PageId::generate();
        inner.registry.insert(PageHandle::new(
            page_id.clone(),
            session,
            PageMetadata { url, title },
        ));
        inner.trackers.insert(page_id.clone(), tracker);
        debug!(page_id = %page_id, "page adopted");
        Ok(page_id)
    }

    /// Close a page: release its tracker, detach its session, close the
    /// target, and drop it from the registry. The session and target
    /// teardown are best-effort.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::PageNotFound`.
    pub async fn close_page(&self, id: &PageId) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        let handle = inner
            .registry
            .remove(id)
            .ok_or_else(|| BridgeError::PageNotFound(id.to_string()))?;
        if let Some(mut tracker) = inner.trackers.remove(id) {
            tracker.detach();
        }
        if let Err(e) = handle.cdp.detach().await {
            debug!(page_id = %id, error = %e, "session detach failed during close");
        }
        if let Some(browser) = inner.browser.as_ref() {
            if let Err(e) = browser
                .send(
                    "Target.closeTarget",
                    Some(serde_json::json!({ "targetId": handle.target_id })),
                )
                .await
            {
                debug!(page_id = %id, error = %e, "target close failed during close");
            }
        }
        Ok(())
    }

    /// Navigate a page and settle it: DOMContentLoaded wait, tracker
    /// generation bump, capped non-throwing network-quiet wait, observer
    /// re-injection, metadata refresh.
    ///
    /// # Errors
    ///
    /// `InvalidUrl` before any I/O; `PageNotFound`; `Connection` when the
    /// browser reports a navigation error.
    pub async fn navigate_to(&self, id: &PageId, url: &str) -> Result<(), BridgeError> {
        validate_page_url(url)?;
        let mut inner = self.inner.lock().await;
        let session = {
            let handle = inner
                .registry
                .get_mut(id)
                .ok_or_else(|| BridgeError::PageNotFound(id.to_string()))?;
            handle.last_accessed = tokio::time::Instant::now();
            handle.cdp.clone()
        };

        let result = session
            .send("Page.navigate", Some(serde_json::json!({ "url": url })))
            .await?;
        if let Some(error_text) = result["errorText"].as_str() {
            if !error_text.is_empty() {
                return Err(BridgeError::Connection {
                    endpoint: url.to_owned(),
                    operation: "navigate".into(),
                    cause: error_text.to_owned(),
                });
            }
        }

        wait_for_dom_content_loaded(&session, Duration::from_secs(10)).await;

        let quiet_cap = inner.config.post_navigation_quiet_cap;
        if let Some(tracker) = inner.trackers.get_mut(id) {
            if let Err(e) = tracker.mark_navigation(&session).await {
                debug!(page_id = %id, error = %e, "tracker re-attach failed after navigation");
            }
            // Generous cap; resolves false rather than failing.
            tracker.wait_for_quiet(quiet_cap).await;
        }

        install_observer_hooks(&session).await;

        if let Some(handle) = inner.registry.get_mut(id) {
            handle.metadata.url = url.to_owned();
        }
        Ok(())
    }

    /// Resolve a page id: the given one, or the most-recently-used.
    ///
    /// # Errors
    ///
    /// `PageNotFound` when the id is unknown or no pages exist.
    pub async fn resolve_page(&self, id: Option<&PageId>) -> Result<PageId, BridgeError> {
        let inner = self.inner.lock().await;
        match id {
            Some(id) => {
                if inner.registry.contains(id) {
                    Ok(id.clone())
                } else {
                    Err(BridgeError::PageNotFound(id.to_string()))
                }
            }
            None => inner
                .registry
                .most_recently_used()
                .cloned()
                .ok_or_else(|| BridgeError::PageNotFound("no pages open".into())),
        }
    }

    /// Like [`resolve_page`](Self::resolve_page), creating a blank page when
    /// none exists.
    ///
    /// # Errors
    ///
    /// Propagates [`create_page`](Self::create_page) failures.
    pub async fn resolve_page_or_create(
        &self,
        id: Option<&PageId>,
    ) -> Result<PageId, BridgeError> {
        match self.resolve_page(id).await {
            Ok(resolved) => Ok(resolved),
            Err(BridgeError::PageNotFound(_)) if id.is_none() => self.create_page(None).await,
            Err(e) => Err(e),
        }
    }

    /// Refresh a page's MRU timestamp.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::PageNotFound`.
    pub async fn touch(&self, id: &PageId) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        if inner.registry.touch(id) {
            Ok(())
        } else {
            Err(BridgeError::PageNotFound(id.to_string()))
        }
    }

    /// Wait for a page's network to go quiet. Resolves `false` on deadline;
    /// never fails. Serializes with other session operations, like every
    /// state-touching wait on this plane.
    pub async fn wait_for_network_quiet(&self, id: &PageId, hard_deadline: Duration) -> bool {
        let inner = self.inner.lock().await;
        match inner.trackers.get(id) {
            Some(tracker) => tracker.wait_for_quiet(hard_deadline).await,
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Rebind & health
    // -----------------------------------------------------------------------

    /// Replace a page's dead CDP session with a fresh one bound to the same
    /// target. The page handle keeps its id and metadata; only the session
    /// is swapped, atomically from the registry's point of view.
    ///
    /// # Errors
    ///
    /// `PageNotFound` when the id is unknown, `PageClosed` when the target
    /// is gone, `ContextUnavailable` when there is no browser connection.
    pub async fn rebind_cdp(&self, id: &PageId) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        if !inner.registry.contains(id) {
            return Err(BridgeError::PageNotFound(id.to_string()));
        }
        let browser = inner.browser.as_ref().ok_or(BridgeError::ContextUnavailable)?;
        let target_id = inner
            .registry
            .get(id)
            .map(|h| h.target_id.clone())
            .unwrap_or_default();

        let targets = browser.send("Target.getTargets", None).await?;
        let target_alive = targets["targetInfos"]
            .as_array()
            .is_some_and(|infos| {
                infos
                    .iter()
                    .any(|info| info["targetId"].as_str() == Some(target_id.as_str()))
            });
        if !target_alive {
            return Err(BridgeError::PageClosed(id.to_string()));
        }

        let new_session = browser.attach(&target_id).await?;
        if let Err(e) = enable_page_domains(&new_session).await {
            debug!(page_id = %id, error = %e, "domain re-enable failed during rebind");
        }
        install_observer_hooks(&new_session).await;

        let quiet_window = inner.config.quiet_window;
        let replacement_tracker = NetworkTracker::attach(&new_session, quiet_window).await?;

        if let Some(old_session) = inner.registry.replace_session(id, new_session) {
            // The replaced session must not linger attached.
            if let Err(e) = old_session.detach().await {
                debug!(page_id = %id, error = %e, "stale session detach failed during rebind");
            }
        }
        if let Some(mut old_tracker) = inner.trackers.insert(id.clone(), replacement_tracker) {
            old_tracker.detach();
        }
        info!(page_id = %id, "CDP session rebound");
        Ok(())
    }

    /// Probe connection health: `Failed` when not connected, `Degraded` when
    /// any page fails a lightweight frame-tree probe, else `Healthy`.
    pub async fn connection_health(&self) -> HealthStatus {
        let inner = self.inner.lock().await;
        if inner.state.current() != ConnectionState::Connected {
            return HealthStatus::Failed;
        }
        for handle in inner.registry.handles() {
            if !handle.cdp.is_active() {
                return HealthStatus::Degraded;
            }
            let probe = handle
                .cdp
                .send_with_timeout("Page.getFrameTree", None, Duration::from_secs(2))
                .await;
            if probe.is_err() {
                return HealthStatus::Degraded;
            }
        }
        HealthStatus::Healthy
    }

    // -----------------------------------------------------------------------
    // Storage state
    // -----------------------------------------------------------------------

    /// Snapshot cookies (deduplicated by name/domain/path) and per-origin
    /// localStorage for every page with a web origin.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless connected. Per-page collection failures are
    /// skipped with a debug log rather than failing the whole snapshot.
    pub async fn save_storage_state(&self) -> Result<StorageState, BridgeError> {
        let inner = self.inner.lock().await;
        inner
            .state
            .require(ConnectionState::Connected, "save_storage_state")?;

        let mut cookies = Vec::new();
        let mut origins = Vec::new();

        for handle in inner.registry.handles() {
            match handle.cdp.send("Network.getCookies", None).await {
                Ok(result) => {
                    if let Some(list) = result["cookies"].as_array() {
                        cookies.extend(list.iter().filter_map(cookie_from_value));
                    }
                }
                Err(e) => debug!(page_id = %handle.page_id, error = %e, "cookie read failed"),
            }

            if !has_web_origin(&handle.metadata.url) {
                continue;
            }
            match collect_local_storage(&handle.cdp).await {
                Some(origin_state) => origins.push(origin_state),
                None => {
                    debug!(page_id = %handle.page_id, "localStorage read failed");
                }
            }
        }

        Ok(StorageState {
            cookies: dedup_cookies(cookies),
            origins: dedup_origins(origins),
        })
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Tear the session down. For an external browser: detach sessions and
    /// disconnect, leaving the browser alive. For a launched browser: close
    /// pages and the browser itself. Idempotent from idle; permitted from
    /// failed for resource cleanup.
    ///
    /// # Errors
    ///
    /// `InvalidState` when called mid-connect or mid-disconnect.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        match inner.state.current() {
            ConnectionState::Idle => Ok(()),
            ConnectionState::Connected => {
                inner
                    .state
                    .transition(ConnectionState::Disconnecting, "shutdown")?;
                Self::teardown(&mut inner).await;
                inner.state.transition(ConnectionState::Idle, "shutdown")?;
                info!("session shut down");
                Ok(())
            }
            ConnectionState::Failed => {
                // Connection is already gone; release resources but stay in
                // failed so the next launch/connect re-enters from there.
                Self::teardown(&mut inner).await;
                Ok(())
            }
            state @ (ConnectionState::Connecting | ConnectionState::Disconnecting) => {
                Err(BridgeError::InvalidState {
                    current: state.as_str().to_owned(),
                    operation: "shutdown".into(),
                })
            }
        }
    }

    async fn teardown(inner: &mut Inner) {
        if let Some(watch) = inner.disconnect_watch.take() {
            watch.abort();
        }
        for (_, mut tracker) in inner.trackers.drain() {
            tracker.detach();
        }

        let external = inner.external;
        if let Some(browser) = inner.browser.take() {
            for handle in inner.registry.handles() {
                if let Err(e) = handle.cdp.detach().await {
                    debug!(page_id = %handle.page_id, error = %e, "detach failed during shutdown");
                }
                if !external {
                    if let Err(e) = browser
                        .send(
                            "Target.closeTarget",
                            Some(serde_json::json!({ "targetId": handle.target_id })),
                        )
                        .await
                    {
                        debug!(error = %e, "target close failed during shutdown");
                    }
                }
            }
            if !external {
                if let Err(e) = browser.send("Browser.close", None).await {
                    debug!(error = %e, "Browser.close failed during shutdown");
                }
            }
            if let Err(e) = browser.close().await {
                debug!(error = %e, "transport close failed during shutdown");
            }
        }

        if let Some(mut process) = inner.launched.take() {
            process.kill().await;
        }

        inner.registry.clear();
        inner.context_id = None;
        inner.external = false;
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Transition connected→failed and clear session state when the transport
/// dies unexpectedly. A deliberate shutdown has already left the connected
/// state, so the watcher observes a non-connected state and does nothing.
fn spawn_disconnect_watch(
    inner: Arc<Mutex<Inner>>,
    mut watch: ConnectedWatch,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if !*watch.borrow() {
                break;
            }
            if watch.changed().await.is_err() {
                break;
            }
        }
        let mut guard = inner.lock().await;
        if guard.state.current() == ConnectionState::Connected {
            warn!("browser disconnected unexpectedly");
            let _ = guard
                .state
                .transition(ConnectionState::Failed, "disconnect-event");
            for (_, mut tracker) in guard.trackers.drain() {
                tracker.detach();
            }
            guard.registry.clear();
            guard.browser = None;
            guard.context_id = None;
        }
    })
}

/// Enable the CDP domains every registered page needs.
async fn enable_page_domains(session: &CdpSession) -> Result<(), BridgeError> {
    session.send("Page.enable", None).await?;
    session.send("Runtime.enable", None).await?;
    session.send("Network.enable", None).await?;
    Ok(())
}

/// Resolve a connect spec to a browser-level WebSocket URL.
async fn resolve_ws_url(spec: &ConnectSpec) -> Result<String, BridgeError> {
    match spec {
        ConnectSpec::WsUrl(url) => Ok(url.clone()),
        ConnectSpec::HttpUrl(url) => {
            let parsed = url::Url::parse(url).map_err(|_| BridgeError::InvalidUrl(url.clone()))?;
            let host = parsed
                .host_str()
                .ok_or_else(|| BridgeError::InvalidUrl(url.clone()))?
                .to_owned();
            let port = parsed.port().unwrap_or(crate::config::DEFAULT_CDP_PORT);
            let version = query_version(&host, port).await?;
            Ok(version.ws_debugger_url)
        }
        ConnectSpec::AutoDiscover => {
            let (port, ws_path) = read_devtools_active_port()?;
            Ok(format!("ws://127.0.0.1:{port}{ws_path}"))
        }
        ConnectSpec::HostPort { host, port } => {
            let version = query_version(host, *port).await?;
            Ok(version.ws_debugger_url)
        }
    }
}

fn describe_spec(spec: &ConnectSpec) -> String {
    match spec {
        ConnectSpec::WsUrl(url) | ConnectSpec::HttpUrl(url) => url.clone(),
        ConnectSpec::AutoDiscover => "DevToolsActivePort auto-discovery".into(),
        ConnectSpec::HostPort { host, port } => format!("{host}:{port}"),
    }
}

/// Validate a page URL before any I/O. `about:` URLs are allowed.
fn validate_page_url(raw: &str) -> Result<(), BridgeError> {
    if raw.starts_with("about:") {
        return Ok(());
    }
    url::Url::parse(raw)
        .map(|_| ())
        .map_err(|_| BridgeError::InvalidUrl(raw.to_owned()))
}

/// Pull an origin's localStorage via a page-side evaluation.
async fn collect_local_storage(session: &CdpSession) -> Option<OriginState> {
    const SCRIPT: &str = r"(function(){
var out=[];
try{for(var i=0;i<localStorage.length;i++){var k=localStorage.key(i);
out.push({name:k,value:localStorage.getItem(k)});}}catch(e){}
return JSON.stringify({origin:location.origin,items:out});
})()";

    let result = session
        .send(
            "Runtime.evaluate",
            Some(serde_json::json!({ "expression": SCRIPT, "returnByValue": true })),
        )
        .await
        .ok()?;
    let raw = result["result"]["value"].as_str()?;
    let parsed: serde_json::Value = serde_json::from_str(raw).ok()?;
    let origin = parsed["origin"].as_str()?.to_owned();
    let local_storage = parsed["items"]
        .as_array()?
        .iter()
        .filter_map(|item| {
            Some(StorageItem {
                name: item["name"].as_str()?.to_owned(),
                value: item["value"].as_str().unwrap_or_default().to_owned(),
            })
        })
        .collect();
    Some(OriginState {
        origin,
        local_storage,
    })
}
