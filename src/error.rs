use std::fmt;

use crate::cdp::CdpError;
use crate::chrome::ChromeError;

/// Top-level error for bridge operations.
///
/// Every variant maps to a stable `error_code()` string that is part of the
/// agent-facing contract. Input-validation failures (`InvalidArgument`,
/// `InvalidUrl`) are distinct from runtime failures and are never retried.
#[derive(Debug)]
pub enum BridgeError {
    /// A tool input failed validation before any I/O was attempted.
    InvalidArgument {
        /// The offending field or option name.
        field: String,
        /// Why the value was rejected.
        message: String,
    },

    /// A URL could not be parsed.
    InvalidUrl(String),

    /// An operation was attempted in a connection state that does not allow it.
    InvalidState {
        /// The connection state at the time of the attempt.
        current: String,
        /// The operation that was attempted.
        operation: String,
    },

    /// Transport-level connection failure.
    Connection {
        /// The endpoint that was being contacted.
        endpoint: String,
        /// The operation in progress.
        operation: String,
        /// Underlying cause.
        cause: String,
    },

    /// A connect attempt exceeded its configured timeout.
    ConnectionTimeout {
        /// The endpoint that was being contacted.
        endpoint: String,
    },

    /// The referenced page id is not in the registry.
    PageNotFound(String),

    /// The referenced page exists but its underlying target has closed.
    PageClosed(String),

    /// No browser context is available for the operation.
    ContextUnavailable,

    /// The eid is not known to the element registry.
    ElementNotFound {
        /// The element id supplied by the agent.
        eid: String,
    },

    /// The eid is known but its element is gone from the current document.
    StaleElement {
        /// The element id supplied by the agent.
        eid: String,
        /// The debugger message that triggered the classification.
        detail: String,
    },

    /// An action verb was invoked before any snapshot exists for the page.
    SnapshotRequired {
        /// The page the action targeted.
        page_id: String,
    },

    /// The page's CDP session is dead and could not be rebound.
    CdpSessionDead {
        /// The page whose session died.
        page_id: String,
    },

    /// The tenant's lease is held by a different controller.
    LeaseAlreadyHeld {
        /// The tenant whose lease was requested.
        tenant_id: String,
        /// The controller currently holding the lease.
        holder: String,
    },

    /// No lease exists for the tenant.
    LeaseNotFound {
        /// The tenant whose lease was looked up.
        tenant_id: String,
    },

    /// The tenant's lease exists but has expired.
    LeaseExpired {
        /// The tenant whose lease was looked up.
        tenant_id: String,
    },

    /// Every port in the allocator's range is in use.
    PortExhausted {
        /// Inclusive lower bound of the range.
        min: u16,
        /// Inclusive upper bound of the range.
        max: u16,
    },

    /// The fleet is at its configured worker ceiling.
    MaxWorkersReached {
        /// The configured ceiling.
        limit: usize,
    },

    /// A worker process failed to start.
    WorkerStartFailed {
        /// The worker that failed.
        worker_id: String,
        /// Underlying cause.
        cause: String,
    },

    /// A worker process exited unexpectedly.
    WorkerCrashed {
        /// The worker that crashed.
        worker_id: String,
    },

    /// The manager is shutting down and refuses new work.
    ShuttingDown,

    /// A CDP protocol or transport error.
    Cdp(CdpError),

    /// A Chrome discovery or launch error.
    Chrome(ChromeError),

    /// Internal invariant violation or unclassified failure.
    Internal(String),
}

impl BridgeError {
    /// Stable machine-readable code for this error, part of the agent contract.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::InvalidUrl(_) => "INVALID_URL",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::Connection { .. } => "CONNECTION_FAILED",
            Self::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            Self::PageNotFound(_) => "PAGE_NOT_FOUND",
            Self::PageClosed(_) => "PAGE_CLOSED",
            Self::ContextUnavailable => "CONTEXT_UNAVAILABLE",
            Self::ElementNotFound { .. } => "ELEMENT_NOT_FOUND",
            Self::StaleElement { .. } => "STALE_ELEMENT",
            Self::SnapshotRequired { .. } => "SNAPSHOT_REQUIRED",
            Self::CdpSessionDead { .. } => "CDP_SESSION_DEAD",
            Self::LeaseAlreadyHeld { .. } => "LEASE_ALREADY_HELD",
            Self::LeaseNotFound { .. } => "LEASE_NOT_FOUND",
            Self::LeaseExpired { .. } => "LEASE_EXPIRED",
            Self::PortExhausted { .. } => "PORT_EXHAUSTED",
            Self::MaxWorkersReached { .. } => "MAX_WORKERS_REACHED",
            Self::WorkerStartFailed { .. } => "WORKER_START_FAILED",
            Self::WorkerCrashed { .. } => "WORKER_CRASHED",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Cdp(_) => "CDP_ERROR",
            Self::Chrome(_) => "CHROME_ERROR",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether this error is an input-validation failure (never retried).
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. } | Self::InvalidUrl(_))
    }

    /// Render as a single-line JSON object for stderr reporting.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "error": self.to_string(),
            "code": self.error_code(),
        })
        .to_string()
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { field, message } => {
                write!(f, "invalid argument `{field}`: {message}")
            }
            Self::InvalidUrl(url) => write!(f, "invalid URL: {url}"),
            Self::InvalidState { current, operation } => {
                write!(f, "operation `{operation}` not allowed in state `{current}`")
            }
            Self::Connection {
                endpoint,
                operation,
                cause,
            } => write!(
                f,
                "connection failure during {operation} to {endpoint}: {cause}"
            ),
            Self::ConnectionTimeout { endpoint } => {
                write!(f, "connection to {endpoint} timed out")
            }
            Self::PageNotFound(id) => write!(f, "page not found: {id}"),
            Self::PageClosed(id) => write!(f, "page closed: {id}"),
            Self::ContextUnavailable => write!(f, "no browser context available"),
            Self::ElementNotFound { eid } => write!(f, "element not found: {eid}"),
            Self::StaleElement { eid, detail } => {
                write!(f, "stale element {eid}: {detail}")
            }
            Self::SnapshotRequired { page_id } => {
                write!(f, "no snapshot exists for page {page_id}; capture one first")
            }
            Self::CdpSessionDead { page_id } => {
                write!(
                    f,
                    "CDP session for page {page_id} is dead and could not be rebound"
                )
            }
            Self::LeaseAlreadyHeld { tenant_id, holder } => {
                write!(
                    f,
                    "lease for tenant {tenant_id} is held by controller {holder}"
                )
            }
            Self::LeaseNotFound { tenant_id } => {
                write!(f, "no lease for tenant {tenant_id}")
            }
            Self::LeaseExpired { tenant_id } => {
                write!(f, "lease for tenant {tenant_id} has expired")
            }
            Self::PortExhausted { min, max } => {
                write!(f, "no free ports in range {min}-{max}")
            }
            Self::MaxWorkersReached { limit } => {
                write!(f, "worker limit reached ({limit})")
            }
            Self::WorkerStartFailed { worker_id, cause } => {
                write!(f, "worker {worker_id} failed to start: {cause}")
            }
            Self::WorkerCrashed { worker_id } => write!(f, "worker {worker_id} crashed"),
            Self::ShuttingDown => write!(f, "manager is shutting down"),
            Self::Cdp(e) => write!(f, "{e}"),
            Self::Chrome(e) => write!(f, "{e}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cdp(e) => Some(e),
            Self::Chrome(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CdpError> for BridgeError {
    fn from(e: CdpError) -> Self {
        Self::Cdp(e)
    }
}

impl From<ChromeError> for BridgeError {
    fn from(e: ChromeError) -> Self {
        Self::Chrome(e)
    }
}

// =============================================================================
// Debugger failure classification
// =============================================================================

/// Classification of a raw debugger failure message.
///
/// Chromium does not expose structured codes for every relevant failure, so
/// the bridge keeps a compatibility shim that matches message substrings.
/// The shim is centralized here so the recognized substrings live in exactly
/// one place and can be replaced wholesale when the protocol grows codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The targeted DOM node no longer exists in the document.
    StaleElement,
    /// The debugger session or its target is gone.
    SessionDead,
    /// The page navigated mid-operation (execution context destroyed).
    ContextDestroyed,
    /// Anything else.
    Other,
}

/// Substrings that indicate a stale DOM node.
const STALE_SIGNATURES: &[&str] = &[
    "no node for given backend id",
    "no node with given id",
    "node is detached from document",
    "node has been deleted",
    "could not find node",
];

/// Substrings that indicate a dead session or closed target.
const DEAD_SIGNATURES: &[&str] = &[
    "session closed",
    "session with given id not found",
    "target closed",
    "browser has disconnected",
    "inspected target navigated or closed",
    "connection closed",
    "websocket",
];

/// Substrings that indicate the execution context was torn down by navigation.
const CONTEXT_SIGNATURES: &[&str] = &[
    "execution context was destroyed",
    "cannot find context with specified id",
];

/// Classify a raw debugger failure message.
///
/// Matching is case-insensitive. Stale-node signatures win over dead-session
/// signatures when both appear, because stale errors are recoverable by
/// re-capture while dead sessions require a rebind.
#[must_use]
pub fn classify_cdp_failure(message: &str) -> FailureClass {
    let lower = message.to_ascii_lowercase();
    if STALE_SIGNATURES.iter().any(|s| lower.contains(s)) {
        return FailureClass::StaleElement;
    }
    if CONTEXT_SIGNATURES.iter().any(|s| lower.contains(s)) {
        return FailureClass::ContextDestroyed;
    }
    if DEAD_SIGNATURES.iter().any(|s| lower.contains(s)) {
        return FailureClass::SessionDead;
    }
    FailureClass::Other
}
