use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::chrome::query_version;
use crate::events::{ListenerHandle, Listeners};

/// Health monitor tuning.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Probe cadence (default 30 s).
    pub interval: Duration,
    /// Per-probe timeout (default 3 s).
    pub probe_timeout: Duration,
    /// Consecutive failures before a worker flips unhealthy (default 3).
    pub failure_threshold: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(3),
            failure_threshold: 3,
        }
    }
}

/// Emitted when a worker's healthy flag flips.
#[derive(Debug, Clone)]
pub struct HealthChange {
    pub worker_id: String,
    pub healthy: bool,
}

struct WorkerProbe {
    port: u16,
    consecutive_failures: u32,
    healthy: bool,
}

/// Periodic `/json/version` prober over the registered workers.
///
/// A worker starts healthy; `failure_threshold` consecutive probe failures
/// flip it unhealthy; any success resets the counter and flips it back.
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    inner: Arc<Mutex<HashMap<String, WorkerProbe>>>,
    listeners: Arc<Listeners<HealthChange>>,
    task: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(config: HealthMonitorConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(HashMap::new())),
            listeners: Arc::new(Listeners::new()),
            task: None,
        }
    }

    /// Register a health-change listener.
    pub fn subscribe<F>(&self, listener: F) -> ListenerHandle<HealthChange>
    where
        F: Fn(&HealthChange) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Track a worker's debug port. The worker starts healthy.
    pub fn register(&self, worker_id: &str, port: u16) {
        if let Ok(mut workers) = self.inner.lock() {
            workers.insert(
                worker_id.to_owned(),
                WorkerProbe {
                    port,
                    consecutive_failures: 0,
                    healthy: true,
                },
            );
        }
    }

    /// Stop tracking a worker.
    pub fn unregister(&self, worker_id: &str) {
        if let Ok(mut workers) = self.inner.lock() {
            workers.remove(worker_id);
        }
    }

    /// Current healthy flag, if the worker is registered.
    #[must_use]
    pub fn is_healthy(&self, worker_id: &str) -> Option<bool> {
        self.inner
            .lock()
            .ok()
            .and_then(|workers| workers.get(worker_id).map(|w| w.healthy))
    }

    /// Record one probe result. Public for direct-drive tests; the probe
    /// loop feeds it live results.
    pub fn record_result(&self, worker_id: &str, ok: bool) {
        record_probe(&self.inner, &self.listeners, &self.config, worker_id, ok);
    }

    /// Start the periodic probe loop. Idempotent.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let listeners = Arc::clone(&self.listeners);
        let config = self.config.clone();
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let targets: Vec<(String, u16)> = match inner.lock() {
                    Ok(workers) => workers
                        .iter()
                        .map(|(id, probe)| (id.clone(), probe.port))
                        .collect(),
                    Err(_) => continue,
                };
                for (worker_id, port) in targets {
                    let ok = tokio::time::timeout(
                        config.probe_timeout,
                        query_version("127.0.0.1", port),
                    )
                    .await
                    .map(|r| r.is_ok())
                    .unwrap_or(false);
                    record_probe(&inner, &listeners, &config, &worker_id, ok);
                }
            }
        }));
    }

    /// Stop the probe loop. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Apply one probe result and emit a change event on a flip. Shared between
/// the probe task and the public recorder.
fn record_probe(
    inner: &Arc<Mutex<HashMap<String, WorkerProbe>>>,
    listeners: &Arc<Listeners<HealthChange>>,
    config: &HealthMonitorConfig,
    worker_id: &str,
    ok: bool,
) {
    let change = {
        let Ok(mut workers) = inner.lock() else { return };
        let Some(probe) = workers.get_mut(worker_id) else {
            return;
        };
        if ok {
            probe.consecutive_failures = 0;
            if probe.healthy {
                None
            } else {
                probe.healthy = true;
                Some(true)
            }
        } else {
            probe.consecutive_failures += 1;
            if probe.healthy && probe.consecutive_failures >= config.failure_threshold {
                probe.healthy = false;
                Some(false)
            } else {
                None
            }
        }
    };
    if let Some(healthy) = change {
        debug!(worker_id, healthy, "worker health changed");
        listeners.emit(&HealthChange {
            worker_id: worker_id.to_owned(),
            healthy,
        });
    }
}
