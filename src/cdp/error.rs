use std::fmt;

/// Errors from the CDP client layer.
#[derive(Debug)]
pub enum CdpError {
    /// The WebSocket handshake failed.
    Connection(String),

    /// The connection attempt exceeded its timeout.
    ConnectTimeout,

    /// A command received no response within its deadline.
    CommandTimeout {
        /// The method that timed out.
        method: String,
    },

    /// The browser returned a protocol-level error.
    Protocol {
        /// JSON-RPC error code.
        code: i64,
        /// Error message from the browser.
        message: String,
    },

    /// The connection closed while commands were outstanding, or a command
    /// was issued after the connection had closed.
    Closed,

    /// A response was structurally not what the protocol promises.
    InvalidResponse(String),

    /// The transport task is gone or a channel broke.
    Internal(String),
}

impl CdpError {
    /// The message text used by the bridge-level failure classifier.
    #[must_use]
    pub fn classifier_text(&self) -> String {
        match self {
            Self::Protocol { message, .. } => message.clone(),
            Self::Closed => "connection closed".into(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for CdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "CDP connection error: {msg}"),
            Self::ConnectTimeout => write!(f, "CDP connection attempt timed out"),
            Self::CommandTimeout { method } => write!(f, "CDP command timed out: {method}"),
            Self::Protocol { code, message } => {
                write!(f, "CDP protocol error ({code}): {message}")
            }
            Self::Closed => write!(f, "CDP connection closed"),
            Self::InvalidResponse(msg) => write!(f, "CDP invalid response: {msg}"),
            Self::Internal(msg) => write!(f, "CDP internal error: {msg}"),
        }
    }
}

impl std::error::Error for CdpError {}
