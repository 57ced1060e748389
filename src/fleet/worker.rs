use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chrome::query_version;
use crate::error::BridgeError;
use crate::events::{ListenerHandle, Listeners};

#[cfg(unix)]
use libc::{SIGKILL, SIGTERM};
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

/// Worker process lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

/// Worker lifecycle notifications.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Started {
        worker_id: String,
    },
    /// The child exited. Emitted for expected and unexpected exits alike;
    /// the state at emission time tells them apart.
    Exit {
        worker_id: String,
        code: Option<i32>,
        signal: Option<i32>,
        crashed: bool,
    },
}

/// How to run one Chromium worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub tenant_id: String,
    pub port: u16,
    pub profile_dir: PathBuf,
    pub executable: PathBuf,
    /// Extra flags appended after the required set.
    pub extra_args: Vec<String>,
    /// How long to wait for `/json/version` before declaring a failed start.
    pub startup_timeout: Duration,
}

/// Snapshot of a worker for diagnostics and events.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerDescriptor {
    pub worker_id: String,
    pub tenant_id: String,
    pub port: u16,
    pub profile_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cdp_endpoint: Option<String>,
    pub state: WorkerState,
}

/// One Chromium child process, dedicated to one tenant for its lifetime.
///
/// A worker may be restarted after reaching `stopped` or `crashed`;
/// rebinding it to another tenant is not supported (stop and replace).
pub struct ChromeWorker {
    config: WorkerConfig,
    state_tx: Arc<watch::Sender<WorkerState>>,
    state_rx: watch::Receiver<WorkerState>,
    pid: Option<u32>,
    cdp_endpoint: Option<String>,
    started_at: Option<Instant>,
    pub last_activity: Instant,
    listeners: Arc<Listeners<WorkerEvent>>,
}

impl ChromeWorker {
    #[must_use]
    pub fn new(config: WorkerConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(WorkerState::Idle);
        Self {
            config,
            state_tx: Arc::new(state_tx),
            state_rx,
            pid: None,
            cdp_endpoint: None,
            started_at: None,
            last_activity: Instant::now(),
            listeners: Arc::new(Listeners::new()),
        }
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.config.tenant_id
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.config.port
    }

    #[must_use]
    pub fn cdp_endpoint(&self) -> Option<&str> {
        self.cdp_endpoint.as_deref()
    }

    #[must_use]
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    #[must_use]
    pub fn descriptor(&self) -> WorkerDescriptor {
        WorkerDescriptor {
            worker_id: self.config.worker_id.clone(),
            tenant_id: self.config.tenant_id.clone(),
            port: self.config.port,
            profile_dir: self.config.profile_dir.clone(),
            pid: self.pid,
            cdp_endpoint: self.cdp_endpoint.clone(),
            state: self.state(),
        }
    }

    /// Register a worker-event listener.
    pub fn subscribe<F>(&self, listener: F) -> ListenerHandle<WorkerEvent>
    where
        F: Fn(&WorkerEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Start the Chromium child: create the profile directory, spawn with
    /// the required debugging flags, and poll `/json/version` until it
    /// responds or the startup timeout fires.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the worker is idle, stopped, or crashed;
    /// `WorkerStartFailed` when the spawn fails or the endpoint never
    /// comes up (the worker is then in `crashed`).
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        let current = self.state();
        if !matches!(
            current,
            WorkerState::Idle | WorkerState::Stopped | WorkerState::Crashed
        ) {
            return Err(BridgeError::InvalidState {
                current: format!("{current:?}").to_lowercase(),
                operation: "start".into(),
            });
        }
        self.state_tx.send_replace(WorkerState::Starting);

        if let Err(e) = std::fs::create_dir_all(&self.config.profile_dir) {
            self.state_tx.send_replace(WorkerState::Crashed);
            return Err(BridgeError::WorkerStartFailed {
                worker_id: self.config.worker_id.clone(),
                cause: format!("profile dir: {e}"),
            });
        }

        let mut cmd = Command::new(&self.config.executable);
        cmd.arg(format!("--remote-debugging-port={}", self.config.port))
            .arg("--remote-debugging-address=127.0.0.1")
            .arg(format!(
                "--user-data-dir={}",
                self.config.profile_dir.display()
            ))
            .arg("--no-first-run")
            .arg("--hide-crash-restore-bubble")
            .arg("--disable-background-timer-throttling")
            .arg("--disable-backgrounding-occluded-windows")
            .arg("--headless=new");
        for arg in &self.config.extra_args {
            cmd.arg(arg);
        }
        cmd.stdout(Stdio::null()).stderr(Stdio::null());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.state_tx.send_replace(WorkerState::Crashed);
                return Err(BridgeError::WorkerStartFailed {
                    worker_id: self.config.worker_id.clone(),
                    cause: format!("spawn: {e}"),
                });
            }
        };
        let pid = child.id();
        debug!(worker_id = %self.config.worker_id, port = self.config.port, ?pid, "worker spawned");

        // Readiness poll.
        let deadline = Instant::now() + self.config.startup_timeout;
        let version = loop {
            if Instant::now() > deadline {
                let _ = child.kill().await;
                self.state_tx.send_replace(WorkerState::Crashed);
                return Err(BridgeError::WorkerStartFailed {
                    worker_id: self.config.worker_id.clone(),
                    cause: format!("no /json/version response on port {}", self.config.port),
                });
            }
            if let Ok(Some(status)) = child.try_wait() {
                self.state_tx.send_replace(WorkerState::Crashed);
                return Err(BridgeError::WorkerStartFailed {
                    worker_id: self.config.worker_id.clone(),
                    cause: format!("exited with {status} before becoming ready"),
                });
            }
            if let Ok(version) = query_version("127.0.0.1", self.config.port).await {
                break version;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        };

        self.pid = pid;
        self.cdp_endpoint = Some(version.ws_debugger_url);
        self.started_at = Some(Instant::now());
        self.last_activity = Instant::now();
        self.state_tx.send_replace(WorkerState::Running);

        // Exit watcher owns the child from here.
        let state_tx = Arc::clone(&self.state_tx);
        let listeners = Arc::clone(&self.listeners);
        let worker_id = self.config.worker_id.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let (code, signal) = match &status {
                Ok(status) => {
                    #[cfg(unix)]
                    let signal = std::os::unix::process::ExitStatusExt::signal(status);
                    #[cfg(not(unix))]
                    let signal = None;
                    (status.code(), signal)
                }
                Err(_) => (None, None),
            };
            let crashed = *state_tx.borrow() == WorkerState::Running;
            if crashed {
                warn!(worker_id = %worker_id, ?code, ?signal, "worker exited unexpectedly");
                state_tx.send_replace(WorkerState::Crashed);
            } else {
                state_tx.send_replace(WorkerState::Stopped);
            }
            listeners.emit(&WorkerEvent::Exit {
                worker_id,
                code,
                signal,
                crashed,
            });
        });

        info!(worker_id = %self.config.worker_id, port = self.config.port, "worker running");
        self.listeners.emit(&WorkerEvent::Started {
            worker_id: self.config.worker_id.clone(),
        });
        Ok(())
    }

    /// Stop gracefully: SIGTERM, then SIGKILL if the child has not exited
    /// within `grace`.
    pub async fn stop(&mut self, grace: Duration) {
        if !matches!(self.state(), WorkerState::Running | WorkerState::Starting) {
            return;
        }
        self.state_tx.send_replace(WorkerState::Stopping);
        self.send_signal(SIGTERM);

        let mut rx = self.state_rx.clone();
        let exited = tokio::time::timeout(grace, async {
            loop {
                if matches!(*rx.borrow(), WorkerState::Stopped | WorkerState::Crashed) {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok();

        if !exited {
            warn!(worker_id = %self.config.worker_id, "grace elapsed; sending SIGKILL");
            self.send_signal(SIGKILL);
            let mut rx = self.state_rx.clone();
            let _ = tokio::time::timeout(Duration::from_secs(2), async {
                loop {
                    if matches!(*rx.borrow(), WorkerState::Stopped | WorkerState::Crashed) {
                        break;
                    }
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
        }
        self.pid = None;
        self.cdp_endpoint = None;
    }

    /// Immediate SIGKILL.
    pub fn kill(&mut self) {
        if matches!(self.state(), WorkerState::Running | WorkerState::Starting | WorkerState::Stopping)
        {
            self.state_tx.send_replace(WorkerState::Stopping);
            self.send_signal(SIGKILL);
        }
        self.pid = None;
        self.cdp_endpoint = None;
    }

    #[cfg(unix)]
    #[allow(clippy::cast_possible_wrap)]
    fn send_signal(&self, signal: i32) {
        if let Some(pid) = self.pid {
            // SAFETY: plain kill(2) on a pid this process spawned.
            unsafe {
                libc::kill(pid as i32, signal);
            }
        }
    }

    #[cfg(not(unix))]
    fn send_signal(&self, _signal: i32) {}
}
