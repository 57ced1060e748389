use std::path::{Path, PathBuf};

use super::ChromeError;

/// Chromium release channel, as accepted by launch options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stable,
    Canary,
    Beta,
    Dev,
}

impl Channel {
    /// Parse a channel name off the wire.
    ///
    /// # Errors
    ///
    /// Returns `ChromeError::UnknownChannel` for anything outside the
    /// recognized set.
    pub fn parse(value: &str) -> Result<Self, ChromeError> {
        match value {
            "stable" => Ok(Self::Stable),
            "canary" => Ok(Self::Canary),
            "beta" => Ok(Self::Beta),
            "dev" => Ok(Self::Dev),
            other => Err(ChromeError::UnknownChannel(other.to_owned())),
        }
    }

    /// The wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Canary => "canary",
            Self::Beta => "beta",
            Self::Dev => "dev",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve the executable for a launch, in the order the launch options
/// promise: an explicit `executable_path` (which must exist), then the
/// `CHROME_PATH` environment variable, then the channel's well-known
/// locations on this platform.
///
/// # Errors
///
/// Returns `ChromeError::NotFound` when the explicit path does not exist or
/// nothing in the fallback chain does.
pub fn resolve_executable(channel: Channel, explicit: Option<&Path>) -> Result<PathBuf, ChromeError> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ChromeError::NotFound(format!(
            "configured executable_path {} does not exist",
            path.display()
        )));
    }
    let env_override = std::env::var("CHROME_PATH").ok().map(PathBuf::from);
    resolve_from(channel, env_override.as_deref())
}

/// Testable core of [`resolve_executable`]: takes the env override as a
/// parameter instead of reading `CHROME_PATH` directly. An env override that
/// does not exist is skipped, not fatal.
fn resolve_from(channel: Channel, env_override: Option<&Path>) -> Result<PathBuf, ChromeError> {
    if let Some(p) = env_override {
        if p.exists() {
            return Ok(p.to_path_buf());
        }
    }
    for candidate in chrome_candidates(channel) {
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(ChromeError::NotFound(format!(
        "no {channel}-channel executable on this host; set executable_path or CHROME_PATH"
    )))
}

/// Default Chromium user-data directory for the current platform, used by
/// `DevToolsActivePort` auto-discovery.
#[must_use]
pub fn default_user_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        home_dir().map(|h| h.join("Library/Application Support/Google/Chrome"))
    }

    #[cfg(target_os = "linux")]
    {
        home_dir().map(|h| h.join(".config/google-chrome"))
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("LOCALAPPDATA").ok().map(|d| {
            PathBuf::from(d)
                .join("Google")
                .join("Chrome")
                .join("User Data")
        })
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        None
    }
}

#[cfg(any(target_os = "macos", target_os = "linux"))]
fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

/// All candidate executable paths for the channel on the current platform.
fn chrome_candidates(channel: Channel) -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        macos_candidates(channel)
    }

    #[cfg(target_os = "linux")]
    {
        linux_candidates(channel)
    }

    #[cfg(target_os = "windows")]
    {
        windows_candidates(channel)
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        let _ = channel;
        vec![]
    }
}

#[cfg(target_os = "macos")]
fn macos_candidates(channel: Channel) -> Vec<PathBuf> {
    match channel {
        Channel::Stable => vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ],
        Channel::Canary => vec![PathBuf::from(
            "/Applications/Google Chrome Canary.app/Contents/MacOS/Google Chrome Canary",
        )],
        Channel::Beta => vec![PathBuf::from(
            "/Applications/Google Chrome Beta.app/Contents/MacOS/Google Chrome Beta",
        )],
        Channel::Dev => vec![PathBuf::from(
            "/Applications/Google Chrome Dev.app/Contents/MacOS/Google Chrome Dev",
        )],
    }
}

#[cfg(target_os = "linux")]
fn linux_candidates(channel: Channel) -> Vec<PathBuf> {
    let path_dirs: Vec<PathBuf> = std::env::var("PATH")
        .unwrap_or_default()
        .split(':')
        .map(PathBuf::from)
        .collect();

    let names: &[&str] = match channel {
        Channel::Stable => &[
            "google-chrome",
            "google-chrome-stable",
            "chromium-browser",
            "chromium",
        ],
        Channel::Canary => &["google-chrome-canary"],
        Channel::Beta => &["google-chrome-beta"],
        Channel::Dev => &["google-chrome-unstable"],
    };

    let mut candidates = Vec::new();
    for name in names {
        for dir in &path_dirs {
            candidates.push(dir.join(name));
        }
    }
    candidates
}

#[cfg(target_os = "windows")]
fn windows_candidates(channel: Channel) -> Vec<PathBuf> {
    let program_files = std::env::var("ProgramFiles").unwrap_or_default();
    let program_files_x86 = std::env::var("ProgramFiles(x86)").unwrap_or_default();
    let local_app_data = std::env::var("LOCALAPPDATA").unwrap_or_default();

    match channel {
        Channel::Stable => vec![
            PathBuf::from(&program_files).join("Google/Chrome/Application/chrome.exe"),
            PathBuf::from(&program_files_x86).join("Google/Chrome/Application/chrome.exe"),
        ],
        Channel::Canary => {
            vec![PathBuf::from(&local_app_data).join("Google/Chrome SxS/Application/chrome.exe")]
        }
        Channel::Beta => vec![
            PathBuf::from(&program_files).join("Google/Chrome Beta/Application/chrome.exe"),
            PathBuf::from(&program_files_x86).join("Google/Chrome Beta/Application/chrome.exe"),
        ],
        Channel::Dev => vec![
            PathBuf::from(&program_files).join("Google/Chrome Dev/Application/chrome.exe"),
            PathBuf::from(&program_files_x86).join("Google/Chrome Dev/Application/chrome.exe"),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_parse_round_trips_wire_names() {
        for name in ["stable", "canary", "beta", "dev"] {
            assert_eq!(Channel::parse(name).unwrap().as_str(), name);
        }
    }

    #[test]
    fn channel_parse_rejects_unknown() {
        let err = Channel::parse("nightly").unwrap_err();
        assert!(matches!(err, ChromeError::UnknownChannel(ref name) if name == "nightly"));
        assert!(err.to_string().contains("nightly"));
    }

    #[test]
    fn chrome_candidates_is_not_empty() {
        assert!(!chrome_candidates(Channel::Stable).is_empty());
    }

    #[test]
    fn explicit_path_wins_when_it_exists() {
        let exe = std::env::current_exe().unwrap();
        let resolved = resolve_executable(Channel::Stable, Some(&exe)).unwrap();
        assert_eq!(resolved, exe);
    }

    #[test]
    fn missing_explicit_path_is_an_error_not_a_fallback() {
        let fake = Path::new("/nonexistent/cef-bridge-chromium");
        let err = resolve_executable(Channel::Stable, Some(fake)).unwrap_err();
        match err {
            ChromeError::NotFound(message) => {
                assert!(message.contains("executable_path"));
                assert!(message.contains("cef-bridge-chromium"));
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn missing_env_override_is_skipped() {
        let fake = Path::new("/nonexistent/cef-bridge-chromium");
        // The env override falls through to candidates rather than failing.
        if let Ok(path) = resolve_from(Channel::Stable, Some(fake)) {
            assert_ne!(path.as_path(), fake);
        }
    }

    #[test]
    fn not_found_error_names_the_channel() {
        let err = resolve_from(Channel::Canary, None);
        if let Err(ChromeError::NotFound(message)) = err {
            assert!(message.contains("canary"));
        }
    }
}
