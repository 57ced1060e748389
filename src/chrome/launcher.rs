use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::debug;

use super::ChromeError;
use super::discovery::query_version;

/// How to spawn a session-plane Chromium process.
pub struct SpawnConfig {
    /// Path to the executable.
    pub executable: PathBuf,
    /// Remote debugging port.
    pub port: u16,
    /// Headless mode.
    pub headless: bool,
    /// Viewport as `--window-size` (width, height).
    pub viewport: Option<(u32, u32)>,
    /// User data directory. `None` creates a temporary one, removed on kill.
    pub user_data_dir: Option<PathBuf>,
    /// Extra command-line arguments appended verbatim.
    pub extra_args: Vec<String>,
}

/// A handle to a spawned Chromium process.
pub struct ChromeProcess {
    child: Option<Child>,
    port: u16,
    temp_dir: Option<TempDir>,
}

/// A temporary profile directory, removed on drop.
struct TempDir {
    path: PathBuf,
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

impl ChromeProcess {
    /// PID of the child, or 0 if already detached.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.child.as_ref().and_then(Child::id).unwrap_or(0)
    }

    /// Remote debugging port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Kill the process and clean up its temporary profile.
    pub async fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill().await;
        }
        self.child = None;
    }

    /// Detach so the process outlives this handle. Returns `(pid, port)`;
    /// the caller owns the process lifetime from here.
    #[must_use]
    pub fn detach(mut self) -> (u32, u16) {
        let pid = self.pid();
        let port = self.port;
        self.child = None;
        // The detached browser still needs its profile directory.
        self.temp_dir = None;
        (pid, port)
    }
}

impl Drop for ChromeProcess {
    fn drop(&mut self) {
        // Drop cannot await; begin the kill and let the runtime reap it.
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// Generate a random hex suffix for temporary directory names, from
/// `/dev/urandom` when available.
fn random_suffix() -> String {
    use std::io::Read;
    let mut buf = [0u8; 8];
    if let Ok(mut f) = std::fs::File::open("/dev/urandom") {
        if f.read_exact(&mut buf).is_ok() {
            return hex_encode(&buf);
        }
    }
    let pid = std::process::id();
    let addr = &raw const buf as usize;
    format!("{pid:x}-{addr:x}")
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Find an available TCP port on localhost.
///
/// # Errors
///
/// Returns `ChromeError::LaunchFailed` if binding fails.
pub fn find_available_port() -> Result<u16, ChromeError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").map_err(|e| {
        ChromeError::LaunchFailed(format!("could not bind to find a free port: {e}"))
    })?;
    let port = listener
        .local_addr()
        .map_err(|e| ChromeError::LaunchFailed(format!("could not get local address: {e}")))?
        .port();
    drop(listener);
    Ok(port)
}

/// Spawn Chromium and poll its debug endpoint until ready.
///
/// # Errors
///
/// Returns `ChromeError::LaunchFailed` if the process cannot be spawned or
/// exits before becoming ready, or `ChromeError::StartupTimeout` if the debug
/// endpoint never responds.
pub async fn launch_chrome(
    config: SpawnConfig,
    timeout: Duration,
) -> Result<ChromeProcess, ChromeError> {
    let (data_dir, temp_dir) = if let Some(dir) = config.user_data_dir {
        std::fs::create_dir_all(&dir)?;
        (dir, None)
    } else {
        let dir = std::env::temp_dir().join(format!("cef-bridge-{}", random_suffix()));
        std::fs::create_dir_all(&dir)?;
        let td = TempDir { path: dir.clone() };
        (dir, Some(td))
    };

    let mut cmd = Command::new(&config.executable);
    cmd.arg(format!("--remote-debugging-port={}", config.port))
        .arg(format!("--user-data-dir={}", data_dir.display()))
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--hide-crash-restore-bubble");

    if config.headless {
        cmd.arg("--headless=new");
    }
    if let Some((width, height)) = config.viewport {
        cmd.arg(format!("--window-size={width},{height}"));
    }
    for arg in &config.extra_args {
        cmd.arg(arg);
    }

    cmd.stdout(Stdio::null()).stderr(Stdio::null());

    let child = cmd.spawn().map_err(|e| {
        ChromeError::LaunchFailed(format!(
            "failed to spawn {}: {e}",
            config.executable.display()
        ))
    })?;
    debug!(port = config.port, "spawned Chromium");

    let mut process = ChromeProcess {
        child: Some(child),
        port: config.port,
        temp_dir,
    };

    let start = tokio::time::Instant::now();
    let poll_interval = Duration::from_millis(100);

    loop {
        if start.elapsed() > timeout {
            process.kill().await;
            return Err(ChromeError::StartupTimeout { port: config.port });
        }

        if let Some(child) = process.child.as_mut() {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(ChromeError::LaunchFailed(format!(
                    "Chromium exited with status {status} before becoming ready"
                )));
            }
        }

        if query_version("127.0.0.1", config.port).await.is_ok() {
            return Ok(process);
        }

        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_available_port_returns_valid_port() {
        let port = find_available_port().unwrap();
        assert!(port > 0);
    }

    #[test]
    fn hex_encode_formats() {
        assert_eq!(hex_encode(&[0x00, 0xff, 0x0a]), "00ff0a");
    }

    #[test]
    fn random_suffix_is_nonempty_and_hexish() {
        let s = random_suffix();
        assert!(!s.is_empty());
        assert!(s.chars().all(|c| c.is_ascii_hexdigit() || c == '-'));
    }

    #[test]
    fn temp_dir_cleanup_on_drop() {
        let path = std::env::temp_dir().join("cef-bridge-test-cleanup");
        std::fs::create_dir_all(&path).unwrap();
        assert!(path.exists());

        let td = TempDir { path: path.clone() };
        drop(td);

        assert!(!path.exists());
    }
}
