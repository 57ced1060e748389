use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cdp::{CdpError, CdpEvent, CdpSession};

/// Per-page "network quiet" tracker.
///
/// Generic quiet-idle helpers cannot tell the current document's requests
/// from the previous one's across a mid-request navigation. This tracker
/// guards every counter update with a navigation generation: events captured
/// under an old generation are discarded, and [`mark_navigation`]
/// (NetworkTracker::mark_navigation) resets the counter for the new document
/// without cancelling waiters.
pub struct NetworkTracker {
    inner: Arc<Mutex<TrackerInner>>,
    quiet_window: Duration,
    pump: Option<JoinHandle<()>>,
}

struct TrackerInner {
    /// Navigation generation; bumped by `mark_navigation`.
    generation: u64,
    /// In-flight request count for the current generation, floored at zero.
    in_flight: usize,
    /// Waiters pending a quiet window.
    waiters: Vec<Waiter>,
    next_waiter_id: u64,
    /// Bumped whenever a quiet timer must be invalidated (new request,
    /// navigation reset). A timer only fires if its epoch is still current.
    quiet_epoch: u64,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<bool>,
}

/// Which of the three request events arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestEvent {
    Started,
    Finished,
    Failed,
}

impl NetworkTracker {
    /// Attach a tracker to a page session: subscribes to request start,
    /// finish, and failure events and spawns the event pump.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Closed` if the transport has exited.
    pub async fn attach(
        session: &CdpSession,
        quiet_window: Duration,
    ) -> Result<Self, CdpError> {
        let inner = Arc::new(Mutex::new(TrackerInner {
            generation: 0,
            in_flight: 0,
            waiters: Vec::new(),
            next_waiter_id: 1,
            quiet_epoch: 0,
        }));
        let pump = spawn_pump(session, Arc::clone(&inner), 0, quiet_window).await?;
        Ok(Self {
            inner,
            quiet_window,
            pump: Some(pump),
        })
    }

    /// Tracker with no event pump, for callers that feed events manually.
    #[must_use]
    pub fn detached(quiet_window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TrackerInner {
                generation: 0,
                in_flight: 0,
                waiters: Vec::new(),
                next_waiter_id: 1,
                quiet_epoch: 0,
            })),
            quiet_window,
            pump: None,
        }
    }

    /// Current in-flight count (test and diagnostics hook).
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.lock().map_or(0, |inner| inner.in_flight)
    }

    /// Current navigation generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.lock().map_or(0, |inner| inner.generation)
    }

    /// Wait until the network has been quiet for the configured window, or
    /// until `hard_deadline` elapses. Resolves `true` on quiet, `false` on
    /// deadline. Never fails.
    pub async fn wait_for_quiet(&self, hard_deadline: Duration) -> bool {
        let (waiter_id, rx) = {
            let Ok(mut inner) = self.inner.lock() else {
                return false;
            };
            let id = inner.next_waiter_id;
            inner.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(Waiter { id, tx });
            if inner.in_flight == 0 {
                start_quiet_timer(&self.inner, inner.quiet_epoch, self.quiet_window);
            }
            (id, rx)
        };

        match tokio::time::timeout(hard_deadline, rx).await {
            Ok(Ok(quiet)) => quiet,
            _ => {
                // Deadline (or a torn-down tracker): remove this one waiter
                // and resolve with timeout. Other waiters are untouched.
                if let Ok(mut inner) = self.inner.lock() {
                    inner.waiters.retain(|w| w.id != waiter_id);
                }
                false
            }
        }
    }

    /// Reset for a navigation: bump the generation, zero the counter, cancel
    /// any quiet timer, and re-attach the event pump. Existing waiters are
    /// kept; they now wait for the new document's idle.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Closed` if re-subscribing fails.
    pub async fn mark_navigation(&mut self, session: &CdpSession) -> Result<(), CdpError> {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        let generation = {
            let Ok(mut inner) = self.inner.lock() else {
                return Ok(());
            };
            inner.generation += 1;
            inner.in_flight = 0;
            inner.quiet_epoch += 1;
            if !inner.waiters.is_empty() {
                // The new document may never issue a request; give existing
                // waiters a quiet window from the reset itself.
                start_quiet_timer(&self.inner, inner.quiet_epoch, self.quiet_window);
            }
            inner.generation
        };
        let pump = spawn_pump(session, Arc::clone(&self.inner), generation, self.quiet_window)
            .await?;
        self.pump = Some(pump);
        Ok(())
    }

    /// Generation-reset without re-subscribing, for detached trackers.
    pub fn mark_navigation_detached(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.generation += 1;
            inner.in_flight = 0;
            inner.quiet_epoch += 1;
            if !inner.waiters.is_empty() {
                start_quiet_timer(&self.inner, inner.quiet_epoch, self.quiet_window);
            }
        }
    }

    /// Stop the event pump. Pending waiters resolve only via their deadlines.
    pub fn detach(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    /// Apply a request event directly (test hook for detached trackers).
    pub fn apply_event_for_generation(&self, generation: u64, started: bool, failed: bool) {
        let kind = if started {
            RequestEvent::Started
        } else if failed {
            RequestEvent::Failed
        } else {
            RequestEvent::Finished
        };
        apply_event(&self.inner, generation, kind, self.quiet_window);
    }
}

impl Drop for NetworkTracker {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Subscribe to the three request events and spawn the routing task.
async fn spawn_pump(
    session: &CdpSession,
    inner: Arc<Mutex<TrackerInner>>,
    generation: u64,
    quiet_window: Duration,
) -> Result<JoinHandle<()>, CdpError> {
    let mut started_rx = session.subscribe("Network.requestWillBeSent").await?;
    let mut finished_rx = session.subscribe("Network.loadingFinished").await?;
    let mut failed_rx = session.subscribe("Network.loadingFailed").await?;

    Ok(tokio::spawn(async move {
        loop {
            let (event, kind) = tokio::select! {
                Some(ev) = started_rx.recv() => (ev, RequestEvent::Started),
                Some(ev) = finished_rx.recv() => (ev, RequestEvent::Finished),
                Some(ev) = failed_rx.recv() => (ev, RequestEvent::Failed),
                else => break,
            };
            if is_websocket_resource(&event) {
                continue;
            }
            apply_event(&inner, generation, kind, quiet_window);
        }
        debug!("network tracker pump exited");
    }))
}

/// WebSocket resources behave as long-lived channels and never "finish";
/// counting them would hold the page non-quiet forever.
fn is_websocket_resource(event: &CdpEvent) -> bool {
    event.params["type"].as_str() == Some("WebSocket")
}

fn apply_event(
    inner: &Arc<Mutex<TrackerInner>>,
    generation: u64,
    kind: RequestEvent,
    quiet_window: Duration,
) {
    let Ok(mut guard) = inner.lock() else { return };
    if guard.generation != generation {
        return;
    }
    match kind {
        RequestEvent::Started => {
            guard.in_flight += 1;
            // A new request invalidates any quiet window in progress.
            guard.quiet_epoch += 1;
        }
        RequestEvent::Finished | RequestEvent::Failed => {
            guard.in_flight = guard.in_flight.saturating_sub(1);
            if guard.in_flight == 0 && !guard.waiters.is_empty() {
                start_quiet_timer(inner, guard.quiet_epoch, quiet_window);
            }
        }
    }
}

/// Start a quiet-window timer for the given epoch. The timer resolves every
/// pending waiter with success iff the epoch is still current and the count
/// is still zero when it fires.
fn start_quiet_timer(inner: &Arc<Mutex<TrackerInner>>, epoch: u64, quiet_window: Duration) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::time::sleep(quiet_window).await;
        let Ok(mut guard) = inner.lock() else { return };
        if guard.quiet_epoch != epoch || guard.in_flight != 0 {
            return;
        }
        for waiter in guard.waiters.drain(..) {
            let _ = waiter.tx.send(true);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUIET: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn quiet_resolves_when_no_requests() {
        let tracker = NetworkTracker::detached(QUIET);
        assert!(tracker.wait_for_quiet(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn waiter_times_out_while_request_in_flight() {
        let tracker = NetworkTracker::detached(QUIET);
        tracker.apply_event_for_generation(0, true, false);
        assert_eq!(tracker.in_flight(), 1);
        assert!(!tracker.wait_for_quiet(Duration::from_millis(150)).await);
        // The timed-out waiter must have been removed.
        assert_eq!(tracker.inner.lock().unwrap().waiters.len(), 0);
    }

    #[tokio::test]
    async fn finish_then_quiet_window_resolves_waiter() {
        let tracker = Arc::new(NetworkTracker::detached(QUIET));
        tracker.apply_event_for_generation(0, true, false);

        let t = Arc::clone(&tracker);
        let waiter = tokio::spawn(async move { t.wait_for_quiet(Duration::from_secs(2)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.apply_event_for_generation(0, false, false);

        assert!(waiter.await.unwrap());
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn new_request_cancels_quiet_window() {
        let tracker = Arc::new(NetworkTracker::detached(QUIET));
        tracker.apply_event_for_generation(0, true, false);

        let t = Arc::clone(&tracker);
        let waiter = tokio::spawn(async move { t.wait_for_quiet(Duration::from_millis(400)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Finish, then immediately start another request inside the window.
        tracker.apply_event_for_generation(0, false, false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.apply_event_for_generation(0, true, false);

        // The waiter should hit its hard deadline, not resolve quiet.
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn stale_generation_events_are_discarded() {
        let mut tracker = NetworkTracker::detached(QUIET);
        tracker.apply_event_for_generation(0, true, false);
        assert_eq!(tracker.in_flight(), 1);

        tracker.mark_navigation_detached();
        assert_eq!(tracker.generation(), 1);
        assert_eq!(tracker.in_flight(), 0);

        // An event captured under the old generation must be ignored.
        tracker.apply_event_for_generation(0, true, false);
        assert_eq!(tracker.in_flight(), 0);

        // Current-generation events still count.
        tracker.apply_event_for_generation(1, true, false);
        assert_eq!(tracker.in_flight(), 1);
    }

    #[tokio::test]
    async fn count_floors_at_zero() {
        let tracker = NetworkTracker::detached(QUIET);
        tracker.apply_event_for_generation(0, false, false);
        tracker.apply_event_for_generation(0, false, true);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn mark_navigation_then_silence_resolves_within_deadline_plus_window() {
        let mut tracker = NetworkTracker::detached(QUIET);
        tracker.apply_event_for_generation(0, true, false);

        tracker.mark_navigation_detached();
        // Zero events for the new document: quiet must resolve true.
        assert!(tracker.wait_for_quiet(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn existing_waiters_survive_navigation_reset() {
        let tracker = Arc::new(NetworkTracker::detached(QUIET));
        tracker.apply_event_for_generation(0, true, false);

        // Register while a request from the old document is in flight.
        let t = Arc::clone(&tracker);
        let waiter = tokio::spawn(async move { t.wait_for_quiet(Duration::from_secs(2)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        tracker.mark_navigation_detached();

        // The pre-navigation waiter resolves with the new document's quiet.
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn websocket_resources_are_ignored() {
        let ev = CdpEvent {
            method: "Network.requestWillBeSent".into(),
            params: serde_json::json!({"type": "WebSocket", "requestId": "1"}),
            session_id: None,
        };
        assert!(is_websocket_resource(&ev));

        let ev = CdpEvent {
            method: "Network.requestWillBeSent".into(),
            params: serde_json::json!({"type": "XHR", "requestId": "2"}),
            session_id: None,
        };
        assert!(!is_websocket_resource(&ev));
    }

    #[tokio::test]
    async fn multiple_waiters_all_resolve_on_quiet() {
        let tracker = Arc::new(NetworkTracker::detached(QUIET));
        tracker.apply_event_for_generation(0, true, false);

        let mut handles = Vec::new();
        for _ in 0..3 {
            let t = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                t.wait_for_quiet(Duration::from_secs(2)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.apply_event_for_generation(0, false, false);

        for handle in handles {
            assert!(handle.await.unwrap());
        }
    }
}
