use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, warn};

use crate::cdp::CdpSession;
use crate::error::{BridgeError, FailureClass, classify_cdp_failure};
use crate::page::{StabilizeStatus, wait_for_dom_quiet};
use crate::session::{PageId, SessionManager};
use crate::snapshot::compiler::{CompiledSnapshot, SnapshotCompiler, WARN_AX_EMPTY, WARN_DOM_EMPTY};
use crate::snapshot::model::Snapshot;

/// Health code reported to callers alongside every capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthCode {
    /// Snapshot captured with content.
    Healthy,
    /// Empty snapshot with no more specific signal; the DOM is likely still
    /// settling.
    PendingDom,
    /// Empty snapshot and the accessibility tree extraction warned.
    AxEmpty,
    /// Empty snapshot and the DOM/frame extraction warned.
    DomEmpty,
    /// Capture failed with a closed-session/target signature.
    CdpSessionDead,
    /// Capture failed for an unrecognized reason.
    Unknown,
}

impl HealthCode {
    /// Stable wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::PendingDom => "PENDING_DOM",
            Self::AxEmpty => "AX_EMPTY",
            Self::DomEmpty => "DOM_EMPTY",
            Self::CdpSessionDead => "CDP_SESSION_DEAD",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Capture tuning.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Attempts for an invalid capture before giving up (default 3).
    pub max_retries: u32,
    /// Pause between attempts (default 200 ms).
    pub backoff: Duration,
    /// DOM quiet window before compiling (default 500 ms).
    pub quiet_window: Duration,
    /// Ceiling on the stabilization wait per attempt (default 3 s).
    pub stabilize_max_wait: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(200),
            quiet_window: Duration::from_millis(500),
            stabilize_max_wait: Duration::from_secs(3),
        }
    }
}

/// The result of a capture attempt series.
#[derive(Debug)]
pub struct CaptureReport {
    /// The snapshot from the last attempt, when one was produced. Present
    /// even for `partial` captures; absent for error captures.
    pub snapshot: Option<Snapshot>,
    /// Whether the last attempt was classified valid.
    pub valid: bool,
    /// Valid but degraded: zero interactives or compiler-marked partial.
    pub partial: bool,
    pub code: HealthCode,
    /// Attempts consumed (≥ 1).
    pub attempts: u32,
    /// Failure or warning message from the last attempt.
    pub message: Option<String>,
    /// What the stabilizer reported on the last attempt.
    pub stabilizer: StabilizeStatus,
}

/// CDP-side recovery record for one capture.
#[derive(Debug, Clone, Serialize)]
pub struct CdpRuntimeHealth {
    pub ok: bool,
    pub recovered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_method: Option<&'static str>,
}

/// Snapshot-side health record for one capture.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRuntimeHealth {
    pub ok: bool,
    pub code: &'static str,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Combined runtime-health record returned to the tool layer.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeHealth {
    pub cdp: CdpRuntimeHealth,
    pub snapshot: SnapshotRuntimeHealth,
}

/// Classify one compile result. Pure; pinned by tests.
#[must_use]
pub fn classify_compiled(compiled: &CompiledSnapshot) -> (bool, bool, HealthCode) {
    if compiled.nodes.is_empty() {
        let code = if compiled.warnings.iter().any(|w| w == WARN_AX_EMPTY) {
            HealthCode::AxEmpty
        } else if compiled.warnings.iter().any(|w| w == WARN_DOM_EMPTY) {
            HealthCode::DomEmpty
        } else {
            HealthCode::PendingDom
        };
        return (false, false, code);
    }
    let interactive = compiled
        .nodes
        .iter()
        .filter(|n| n.kind.is_interactive())
        .count();
    let partial = compiled.partial || interactive == 0;
    (true, partial, HealthCode::Healthy)
}

/// Classify a capture error message.
#[must_use]
pub fn classify_capture_error(message: &str) -> HealthCode {
    if classify_cdp_failure(message) == FailureClass::SessionDead {
        HealthCode::CdpSessionDead
    } else {
        HealthCode::Unknown
    }
}

/// Run the capture algorithm: stabilize, compile, classify, retry invalid
/// results up to the bounded attempt count with a short backoff. The last
/// attempt's classification is returned either way.
///
/// `version` is the monotonic snapshot version assigned by the caller's
/// version manager.
pub async fn capture<C: SnapshotCompiler>(
    compiler: &C,
    session: &CdpSession,
    opts: &CaptureOptions,
    version: u64,
) -> CaptureReport {
    let max_attempts = opts.max_retries.max(1);
    let mut attempts = 0;
    let mut last: Option<CaptureReport> = None;

    while attempts < max_attempts {
        attempts += 1;

        let stabilize =
            wait_for_dom_quiet(session, opts.quiet_window, opts.stabilize_max_wait).await;

        let report = match compiler.compile(session).await {
            Ok(compiled) => {
                let (valid, partial, code) = classify_compiled(&compiled);
                let message = compiled.warnings.first().cloned();
                let snapshot = (!compiled.nodes.is_empty()).then(|| Snapshot {
                    snapshot_id: Snapshot::generate_id(),
                    version,
                    url: compiled.url.clone(),
                    title: compiled.title.clone(),
                    viewport: compiled.viewport,
                    captured_at: SystemTime::now(),
                    nodes: compiled.nodes,
                });
                CaptureReport {
                    snapshot,
                    valid,
                    partial,
                    code,
                    attempts,
                    message,
                    stabilizer: stabilize.status,
                }
            }
            Err(e) => {
                let message = e.to_string();
                CaptureReport {
                    snapshot: None,
                    valid: false,
                    partial: false,
                    code: classify_capture_error(&message),
                    attempts,
                    message: Some(message),
                    stabilizer: stabilize.status,
                }
            }
        };

        if report.valid {
            return report;
        }
        debug!(
            attempt = attempts,
            code = report.code.as_str(),
            "snapshot capture invalid"
        );
        last = Some(report);
        if attempts < max_attempts {
            tokio::time::sleep(opts.backoff).await;
        }
    }

    last.unwrap_or(CaptureReport {
        snapshot: None,
        valid: false,
        partial: false,
        code: HealthCode::Unknown,
        attempts,
        message: Some("no capture attempt ran".into()),
        stabilizer: StabilizeStatus::Error,
    })
}

/// Capture with the recovery rule: if the whole first series comes back
/// invalid, rebind the page's CDP session and retry once. Callers receive
/// both the report and a runtime-health record describing what happened.
///
/// # Errors
///
/// Returns `PageNotFound` if the page is not registered; rebind failures are
/// folded into the health record, not raised.
pub async fn capture_with_recovery<C: SnapshotCompiler>(
    compiler: &C,
    manager: &SessionManager,
    page_id: &PageId,
    opts: &CaptureOptions,
    version: u64,
) -> Result<(CaptureReport, RuntimeHealth), BridgeError> {
    let session = manager.session_for(page_id).await?;
    let report = capture(compiler, &session, opts, version).await;

    if report.valid {
        let health = RuntimeHealth {
            cdp: CdpRuntimeHealth {
                ok: true,
                recovered: false,
                recovery_method: None,
            },
            snapshot: SnapshotRuntimeHealth {
                ok: true,
                code: report.code.as_str(),
                attempts: report.attempts,
                message: report.message.clone(),
            },
        };
        return Ok((report, health));
    }

    warn!(page_id = %page_id, code = report.code.as_str(), "capture invalid; attempting rebind");
    match manager.rebind_cdp(page_id).await {
        Ok(()) => {
            let session = manager.session_for(page_id).await?;
            let retry_opts = CaptureOptions {
                max_retries: 1,
                ..opts.clone()
            };
            let retry = capture(compiler, &session, &retry_opts, version).await;
            let attempts = report.attempts + retry.attempts;
            let health = RuntimeHealth {
                cdp: CdpRuntimeHealth {
                    ok: true,
                    recovered: retry.valid,
                    recovery_method: Some("rebind"),
                },
                snapshot: SnapshotRuntimeHealth {
                    ok: retry.valid,
                    code: retry.code.as_str(),
                    attempts,
                    message: retry.message.clone(),
                },
            };
            Ok((CaptureReport { attempts, ..retry }, health))
        }
        Err(e) => {
            debug!(page_id = %page_id, error = %e, "rebind failed");
            let health = RuntimeHealth {
                cdp: CdpRuntimeHealth {
                    ok: false,
                    recovered: false,
                    recovery_method: Some("rebind"),
                },
                snapshot: SnapshotRuntimeHealth {
                    ok: false,
                    code: report.code.as_str(),
                    attempts: report.attempts,
                    message: report.message.clone(),
                },
            };
            Ok((report, health))
        }
    }
}
