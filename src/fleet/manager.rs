use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::events::{ListenerHandle, Listeners};
use crate::fleet::health::{HealthMonitor, HealthMonitorConfig};
use crate::fleet::lease::LeaseManager;
use crate::fleet::ports::PortAllocator;
use crate::fleet::worker::{ChromeWorker, WorkerConfig, WorkerDescriptor, WorkerEvent, WorkerState};

/// Fleet tuning. Defaults follow the documented timeouts: lease TTL 5 min,
/// idle 5 min, hard TTL 2 h, probe every 30 s.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Inclusive debug-port range.
    pub port_range: (u16, u16),
    /// Worker ceiling.
    pub max_workers: usize,
    /// Default lease TTL.
    pub lease_ttl: Duration,
    /// How long a released tenant's worker lingers before eviction.
    pub idle_timeout: Duration,
    /// Absolute worker lifetime cap, activity notwithstanding.
    pub hard_ttl: Duration,
    /// Chromium executable for workers.
    pub executable: PathBuf,
    /// Directory under which per-worker profiles are created.
    pub profile_root: PathBuf,
    /// Extra worker flags.
    pub worker_extra_args: Vec<String>,
    /// Worker startup deadline.
    pub startup_timeout: Duration,
    /// SIGTERM grace before SIGKILL on stop.
    pub stop_grace: Duration,
    /// Cadence of the hard-TTL / expired-lease sweeper.
    pub sweep_interval: Duration,
    /// Health monitor tuning.
    pub health: HealthMonitorConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            port_range: (9300, 9399),
            max_workers: 4,
            lease_ttl: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(300),
            hard_ttl: Duration::from_secs(7200),
            executable: PathBuf::from("chromium"),
            profile_root: std::env::temp_dir().join("cef-bridge-workers"),
            worker_extra_args: Vec::new(),
            startup_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(30),
            health: HealthMonitorConfig::default(),
        }
    }
}

/// Fleet lifecycle notifications.
#[derive(Debug, Clone)]
pub enum FleetEvent {
    WorkerCreated {
        worker_id: String,
        tenant_id: String,
    },
    WorkerStarted {
        worker_id: String,
    },
    WorkerStopped {
        worker_id: String,
        reason: String,
    },
    WorkerCrashed {
        worker_id: String,
        tenant_id: String,
    },
    LeaseAcquired {
        tenant_id: String,
        controller_id: String,
    },
    LeaseReleased {
        tenant_id: String,
    },
    LeaseRefreshed {
        tenant_id: String,
    },
}

struct FleetInner {
    ports: PortAllocator,
    leases: LeaseManager,
    workers: HashMap<String, ChromeWorker>,
    health: HealthMonitor,
    /// Bumped whenever a tenant re-acquires; pending idle evictions from an
    /// older epoch stand down.
    idle_epochs: HashMap<String, u64>,
    shutting_down: bool,
    sweeper: Option<JoinHandle<()>>,
}

/// Presents a per-tenant exclusive browser: composes the port allocator,
/// lease manager, worker processes, and health monitor behind one
/// process-wide surface.
pub struct WorkerManager {
    config: FleetConfig,
    inner: Arc<Mutex<FleetInner>>,
    listeners: Arc<Listeners<FleetEvent>>,
}

impl WorkerManager {
    /// Build a manager. The sweeper starts on first acquisition.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a bad port range.
    pub fn new(config: FleetConfig) -> Result<Self, BridgeError> {
        let ports = PortAllocator::new(config.port_range.0, config.port_range.1)?;
        let mut health = HealthMonitor::new(config.health.clone());
        health.start();
        Ok(Self {
            inner: Arc::new(Mutex::new(FleetInner {
                ports,
                leases: LeaseManager::new(config.lease_ttl),
                workers: HashMap::new(),
                health,
                idle_epochs: HashMap::new(),
                shutting_down: false,
                sweeper: None,
            })),
            listeners: Arc::new(Listeners::new()),
            config,
        })
    }

    /// Register a fleet-event listener.
    pub fn subscribe<F>(&self, listener: F) -> ListenerHandle<FleetEvent>
    where
        F: Fn(&FleetEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Number of workers currently owned.
    pub async fn worker_count(&self) -> usize {
        self.inner.lock().await.workers.len()
    }

    /// Snapshot of a tenant's worker.
    pub async fn descriptor(&self, tenant_id: &str) -> Option<WorkerDescriptor> {
        self.inner
            .lock()
            .await
            .workers
            .get(tenant_id)
            .map(ChromeWorker::descriptor)
    }

    /// Acquire (or re-acquire) the tenant's exclusive worker and return its
    /// CDP endpoint.
    ///
    /// # Errors
    ///
    /// `ShuttingDown`, `LeaseAlreadyHeld`, `MaxWorkersReached`,
    /// `PortExhausted`, or `WorkerStartFailed`.
    pub async fn acquire_for_tenant(
        &self,
        tenant_id: &str,
        controller_id: &str,
    ) -> Result<String, BridgeError> {
        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            return Err(BridgeError::ShuttingDown);
        }
        self.ensure_sweeper(&mut inner);

        // Existing running worker: same controller refreshes; a free lease
        // is (re)acquired; a foreign active lease refuses.
        if let Some(worker) = inner.workers.get(tenant_id) {
            if worker.state() == WorkerState::Running {
                let endpoint = worker
                    .cdp_endpoint()
                    .ok_or_else(|| BridgeError::Internal("running worker without endpoint".into()))?
                    .to_owned();
                let worker_id = worker.worker_id().to_owned();
                if inner.leases.is_held_by(tenant_id, controller_id) {
                    inner.leases.refresh(tenant_id, None)?;
                    bump_idle_epoch(&mut inner, tenant_id);
                    self.listeners.emit(&FleetEvent::LeaseRefreshed {
                        tenant_id: tenant_id.to_owned(),
                    });
                    return Ok(endpoint);
                }
                inner
                    .leases
                    .acquire(tenant_id, controller_id, &worker_id, None)?;
                bump_idle_epoch(&mut inner, tenant_id);
                self.listeners.emit(&FleetEvent::LeaseAcquired {
                    tenant_id: tenant_id.to_owned(),
                    controller_id: controller_id.to_owned(),
                });
                return Ok(endpoint);
            }
            // A dead worker under this tenant: clear it before replacing.
            Self::remove_worker_entry(&mut inner, tenant_id, "replacing dead worker");
        }

        let worker_id = format!("wk-{}", uuid::Uuid::new_v4().simple());
        inner
            .leases
            .acquire(tenant_id, controller_id, &worker_id, None)?;

        if inner.workers.len() >= self.config.max_workers {
            let _ = inner.leases.release(tenant_id, None);
            return Err(BridgeError::MaxWorkersReached {
                limit: self.config.max_workers,
            });
        }

        let port = match inner.ports.allocate_verified() {
            Ok(port) => port,
            Err(e) => {
                let _ = inner.leases.release(tenant_id, None);
                return Err(e);
            }
        };

        let profile_dir = self.config.profile_root.join(&worker_id);
        let mut worker = ChromeWorker::new(WorkerConfig {
            worker_id: worker_id.clone(),
            tenant_id: tenant_id.to_owned(),
            port,
            profile_dir,
            executable: self.config.executable.clone(),
            extra_args: self.config.worker_extra_args.clone(),
            startup_timeout: self.config.startup_timeout,
        });
        self.listeners.emit(&FleetEvent::WorkerCreated {
            worker_id: worker_id.clone(),
            tenant_id: tenant_id.to_owned(),
        });

        if let Err(e) = worker.start().await {
            inner.ports.release(port);
            let _ = inner.leases.release(tenant_id, None);
            return Err(e);
        }

        // Crash handling: a worker that dies while running revokes the
        // tenant's lease before its port is released.
        let crash_inner = Arc::clone(&self.inner);
        let crash_listeners = Arc::clone(&self.listeners);
        let crash_tenant = tenant_id.to_owned();
        let _crash_handle = worker.subscribe(move |event| {
            if let WorkerEvent::Exit { crashed: true, worker_id, .. } = event {
                let inner = Arc::clone(&crash_inner);
                let listeners = Arc::clone(&crash_listeners);
                let tenant_id = crash_tenant.clone();
                let worker_id = worker_id.clone();
                tokio::spawn(async move {
                    handle_worker_crash(&inner, &listeners, &tenant_id, &worker_id).await;
                });
            }
        });

        inner.health.register(&worker_id, port);
        let endpoint = worker
            .cdp_endpoint()
            .ok_or_else(|| BridgeError::Internal("started worker without endpoint".into()))?
            .to_owned();
        inner.workers.insert(tenant_id.to_owned(), worker);
        bump_idle_epoch(&mut inner, tenant_id);

        self.listeners.emit(&FleetEvent::WorkerStarted {
            worker_id: worker_id.clone(),
        });
        self.listeners.emit(&FleetEvent::LeaseAcquired {
            tenant_id: tenant_id.to_owned(),
            controller_id: controller_id.to_owned(),
        });
        info!(tenant_id, worker_id = %worker_id, port, "worker acquired");
        Ok(endpoint)
    }

    /// Release the tenant's lease and start the idle-eviction timer.
    ///
    /// # Errors
    ///
    /// Returns `LeaseNotFound` when no lease exists.
    pub async fn release_lease(&self, tenant_id: &str) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        inner.leases.release(tenant_id, None)?;
        self.listeners.emit(&FleetEvent::LeaseReleased {
            tenant_id: tenant_id.to_owned(),
        });

        let epoch = bump_idle_epoch(&mut inner, tenant_id);
        drop(inner);

        let idle_inner = Arc::clone(&self.inner);
        let idle_listeners = Arc::clone(&self.listeners);
        let idle_tenant = tenant_id.to_owned();
        let idle_timeout = self.config.idle_timeout;
        let stop_grace = self.config.stop_grace;
        tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            let mut inner = idle_inner.lock().await;
            if inner.shutting_down
                || inner.idle_epochs.get(&idle_tenant) != Some(&epoch)
                || inner.leases.has_active(&idle_tenant)
            {
                return;
            }
            stop_worker_locked(
                &mut inner,
                &idle_listeners,
                &idle_tenant,
                "idle timeout",
                stop_grace,
            )
            .await;
        });
        Ok(())
    }

    /// Refresh the tenant's lease TTL.
    ///
    /// # Errors
    ///
    /// Returns `LeaseNotFound` or `LeaseExpired`.
    pub async fn refresh_lease(&self, tenant_id: &str) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        inner.leases.refresh(tenant_id, None)?;
        self.listeners.emit(&FleetEvent::LeaseRefreshed {
            tenant_id: tenant_id.to_owned(),
        });
        Ok(())
    }

    /// Revoke the tenant's lease and stop its worker.
    pub async fn stop_worker(&self, tenant_id: &str, reason: &str) {
        let mut inner = self.inner.lock().await;
        stop_worker_locked(
            &mut inner,
            &self.listeners,
            tenant_id,
            reason,
            self.config.stop_grace,
        )
        .await;
    }

    /// Stop accepting acquisitions, stop every worker, stop the monitor and
    /// sweeper. Idempotent.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if inner.shutting_down {
            return;
        }
        inner.shutting_down = true;
        if let Some(sweeper) = inner.sweeper.take() {
            sweeper.abort();
        }

        let tenants: Vec<String> = inner.workers.keys().cloned().collect();
        for tenant_id in tenants {
            stop_worker_locked(
                &mut inner,
                &self.listeners,
                &tenant_id,
                "manager shutdown",
                self.config.stop_grace,
            )
            .await;
        }
        inner.health.stop();
        info!("worker manager shut down");
    }

    fn ensure_sweeper(&self, inner: &mut FleetInner) {
        if inner.sweeper.is_some() {
            return;
        }
        let sweep_inner = Arc::clone(&self.inner);
        let sweep_listeners = Arc::clone(&self.listeners);
        let hard_ttl = self.config.hard_ttl;
        let interval = self.config.sweep_interval;
        let stop_grace = self.config.stop_grace;
        inner.sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let mut inner = sweep_inner.lock().await;
                if inner.shutting_down {
                    return;
                }
                inner.leases.cleanup_expired();

                let now = Instant::now();
                let overdue: Vec<String> = inner
                    .workers
                    .iter()
                    .filter(|(_, worker)| {
                        worker
                            .started_at()
                            .is_some_and(|started| now.duration_since(started) > hard_ttl)
                    })
                    .map(|(tenant, _)| tenant.clone())
                    .collect();
                for tenant_id in overdue {
                    stop_worker_locked(
                        &mut inner,
                        &sweep_listeners,
                        &tenant_id,
                        "hard ttl exceeded",
                        stop_grace,
                    )
                    .await;
                }
            }
        }));
    }

    /// Drop a dead worker's registration without the stop sequence.
    fn remove_worker_entry(inner: &mut FleetInner, tenant_id: &str, reason: &str) {
        if let Some(worker) = inner.workers.remove(tenant_id) {
            debug!(tenant_id, worker_id = %worker.worker_id(), reason, "removing worker entry");
            inner.health.unregister(worker.worker_id());
            inner.ports.release(worker.port());
            let _ = std::fs::remove_dir_all(worker.descriptor().profile_dir);
        }
    }
}

/// Bump and return the tenant's idle epoch.
fn bump_idle_epoch(inner: &mut FleetInner, tenant_id: &str) -> u64 {
    let epoch = inner.idle_epochs.entry(tenant_id.to_owned()).or_insert(0);
    *epoch += 1;
    *epoch
}

/// Full stop sequence under the fleet lock: revoke lease, stop process,
/// release port, unregister from health, delete profile, emit.
async fn stop_worker_locked(
    inner: &mut FleetInner,
    listeners: &Listeners<FleetEvent>,
    tenant_id: &str,
    reason: &str,
    grace: Duration,
) {
    let Some(mut worker) = inner.workers.remove(tenant_id) else {
        debug!(tenant_id, "stop requested for tenant without a worker");
        return;
    };
    let worker_id = worker.worker_id().to_owned();
    let port = worker.port();
    let profile_dir = worker.descriptor().profile_dir;

    inner.leases.revoke(tenant_id, reason);
    worker.stop(grace).await;
    inner.ports.release(port);
    inner.health.unregister(&worker_id);
    if let Err(e) = std::fs::remove_dir_all(&profile_dir) {
        debug!(worker_id = %worker_id, error = %e, "profile dir removal failed");
    }

    info!(tenant_id, worker_id = %worker_id, reason, "worker stopped");
    listeners.emit(&FleetEvent::WorkerStopped {
        worker_id,
        reason: reason.to_owned(),
    });
}

/// Crash path: revoke the tenant's lease before releasing the port.
async fn handle_worker_crash(
    inner: &Arc<Mutex<FleetInner>>,
    listeners: &Arc<Listeners<FleetEvent>>,
    tenant_id: &str,
    worker_id: &str,
) {
    let mut inner = inner.lock().await;
    if inner.shutting_down {
        return;
    }
    let still_ours = inner
        .workers
        .get(tenant_id)
        .is_some_and(|w| w.worker_id() == worker_id && w.state() == WorkerState::Crashed);
    if !still_ours {
        return;
    }
    warn!(tenant_id, worker_id, "worker crashed");

    let Some(worker) = inner.workers.remove(tenant_id) else {
        return;
    };
    inner.leases.revoke(tenant_id, "worker crashed");
    inner.ports.release(worker.port());
    inner.health.unregister(worker_id);
    let _ = std::fs::remove_dir_all(worker.descriptor().profile_dir);

    listeners.emit(&FleetEvent::WorkerCrashed {
        worker_id: worker_id.to_owned(),
        tenant_id: tenant_id.to_owned(),
    });
}
