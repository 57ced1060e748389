use std::time::Duration;

use tracing::debug;

use crate::cdp::CdpSession;
use crate::error::{FailureClass, classify_cdp_failure};

/// Outcome of a stabilization wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilizeStatus {
    /// Mutations ceased for a full quiet window.
    Stable,
    /// The bounded wait elapsed with mutations still arriving.
    Timeout,
    /// The page-side evaluation failed (typically: the execution context was
    /// destroyed by a navigation).
    Error,
}

/// Result of a stabilization wait, including how long it took.
#[derive(Debug, Clone)]
pub struct StabilizeOutcome {
    pub status: StabilizeStatus,
    pub waited_ms: u64,
    pub warning: Option<String>,
}

/// Page-side observer: records the timestamp of the last DOM mutation in a
/// window global. Installed once per document; re-installation is a no-op.
const OBSERVER_SCRIPT: &str = r"(function(){
if(window.__cefBridgeMutationTick!==undefined)return;
window.__cefBridgeMutationTick=Date.now();
try{
new MutationObserver(function(){window.__cefBridgeMutationTick=Date.now();})
.observe(document.documentElement||document,
{childList:true,subtree:true,attributes:true,characterData:true});
}catch(e){}
})();";

/// Expression yielding milliseconds since the last recorded mutation, or a
/// large value when the observer is not installed (an untouched document is
/// treated as already quiet).
const QUIET_PROBE: &str =
    "window.__cefBridgeMutationTick===undefined?1e9:(Date.now()-window.__cefBridgeMutationTick)";

/// Install the mutation observer on the current document and register it for
/// future documents. Best-effort: failures are logged at debug level and
/// never break the caller.
pub async fn install_observer_hooks(session: &CdpSession) {
    if let Err(e) = session
        .send(
            "Runtime.evaluate",
            Some(serde_json::json!({ "expression": OBSERVER_SCRIPT })),
        )
        .await
    {
        debug!(error = %e, "mutation observer install failed");
    }
    if let Err(e) = session
        .send(
            "Page.addScriptToEvaluateOnNewDocument",
            Some(serde_json::json!({ "source": OBSERVER_SCRIPT })),
        )
        .await
    {
        debug!(error = %e, "mutation observer registration for new documents failed");
    }
}

/// Wait until the DOM has been mutation-free for `quiet_window`, polling the
/// page every 100 ms, bounded by `max_wait`.
pub async fn wait_for_dom_quiet(
    session: &CdpSession,
    quiet_window: Duration,
    max_wait: Duration,
) -> StabilizeOutcome {
    let started = tokio::time::Instant::now();
    let poll_interval = Duration::from_millis(100);
    let quiet_ms = u64::try_from(quiet_window.as_millis()).unwrap_or(u64::MAX);

    loop {
        match probe_quiet_ms(session).await {
            Ok(elapsed_since_mutation) => {
                if elapsed_since_mutation >= quiet_ms {
                    return StabilizeOutcome {
                        status: StabilizeStatus::Stable,
                        waited_ms: elapsed_ms(started),
                        warning: None,
                    };
                }
            }
            Err(message) => {
                return StabilizeOutcome {
                    status: StabilizeStatus::Error,
                    waited_ms: elapsed_ms(started),
                    warning: Some(message),
                };
            }
        }

        if started.elapsed() >= max_wait {
            return StabilizeOutcome {
                status: StabilizeStatus::Timeout,
                waited_ms: elapsed_ms(started),
                warning: Some("DOM still mutating at stabilization deadline".into()),
            };
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Stabilize after a mutating action: DOM quiescence first; if the page-side
/// probe errors because the action triggered a navigation, fall back to
/// waiting for the new document's DOMContentLoaded with a short timeout.
pub async fn stabilize_after_action(
    session: &CdpSession,
    quiet_window: Duration,
    max_wait: Duration,
) -> StabilizeOutcome {
    let outcome = wait_for_dom_quiet(session, quiet_window, max_wait).await;
    if outcome.status != StabilizeStatus::Error {
        return outcome;
    }

    let started = tokio::time::Instant::now();
    let loaded = wait_for_dom_content_loaded(session, Duration::from_secs(3)).await;
    StabilizeOutcome {
        status: if loaded {
            StabilizeStatus::Stable
        } else {
            StabilizeStatus::Timeout
        },
        waited_ms: outcome.waited_ms + elapsed_ms(started),
        warning: outcome
            .warning
            .map(|w| format!("{w}; fell back to load-state wait")),
    }
}

/// Poll `document.readyState` until the document has left "loading", bounded
/// by `timeout`. Returns whether the load state was reached.
pub async fn wait_for_dom_content_loaded(session: &CdpSession, timeout: Duration) -> bool {
    let started = tokio::time::Instant::now();
    let poll_interval = Duration::from_millis(100);
    loop {
        let ready = session
            .send(
                "Runtime.evaluate",
                Some(serde_json::json!({
                    "expression": "document.readyState !== 'loading'",
                    "returnByValue": true,
                })),
            )
            .await
            .ok()
            .and_then(|v| v["result"]["value"].as_bool())
            .unwrap_or(false);
        if ready {
            return true;
        }
        if started.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Evaluate the quiet probe. `Ok(ms)` is milliseconds since the last
/// mutation; `Err` carries the failure message for classification upstream.
async fn probe_quiet_ms(session: &CdpSession) -> Result<u64, String> {
    let result = session
        .send(
            "Runtime.evaluate",
            Some(serde_json::json!({
                "expression": QUIET_PROBE,
                "returnByValue": true,
            })),
        )
        .await;

    match result {
        Ok(value) => {
            // Runtime.evaluate reports page-side throws in exceptionDetails
            // rather than as protocol errors.
            if let Some(detail) = value["exceptionDetails"]["text"].as_str() {
                return Err(detail.to_owned());
            }
            Ok(value["result"]["value"].as_f64().map_or(0, |v| v as u64))
        }
        Err(e) => Err(e.classifier_text()),
    }
}

/// Whether a stabilizer warning indicates the context died under navigation.
#[must_use]
pub fn is_navigation_symptom(warning: &str) -> bool {
    classify_cdp_failure(warning) == FailureClass::ContextDestroyed
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(started: tokio::time::Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
