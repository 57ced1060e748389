use std::fmt;

/// Errors from Chromium discovery and launch.
#[derive(Debug)]
pub enum ChromeError {
    /// No Chromium executable could be located.
    NotFound(String),
    /// A release-channel name outside the recognized set.
    UnknownChannel(String),
    /// The process could not be spawned.
    LaunchFailed(String),
    /// The debug endpoint did not come up before the startup timeout.
    StartupTimeout {
        /// The remote debugging port that never responded.
        port: u16,
    },
    /// HTTP discovery request failed.
    HttpError(String),
    /// A discovery response could not be parsed.
    ParseError(String),
    /// The `DevToolsActivePort` sentinel is missing or unreadable.
    NoActivePort,
    /// No running Chromium could be discovered.
    NotRunning(String),
}

impl fmt::Display for ChromeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "Chromium executable not found: {msg}"),
            Self::UnknownChannel(name) => write!(
                f,
                "unknown release channel `{name}` (expected stable, canary, beta, or dev)"
            ),
            Self::LaunchFailed(msg) => write!(f, "Chromium launch failed: {msg}"),
            Self::StartupTimeout { port } => {
                write!(f, "Chromium did not become ready on port {port}")
            }
            Self::HttpError(msg) => write!(f, "debugger HTTP error: {msg}"),
            Self::ParseError(msg) => write!(f, "debugger response parse error: {msg}"),
            Self::NoActivePort => write!(f, "DevToolsActivePort file missing or unreadable"),
            Self::NotRunning(msg) => write!(f, "no running Chromium discovered: {msg}"),
        }
    }
}

impl std::error::Error for ChromeError {}

impl From<std::io::Error> for ChromeError {
    fn from(e: std::io::Error) -> Self {
        Self::LaunchFailed(e.to_string())
    }
}
