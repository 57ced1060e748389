//! Worker fleet: per-tenant exclusive Chromium processes behind one
//! process-wide manager, built from the port allocator, lease manager,
//! worker process wrapper, and health monitor.

mod health;
mod lease;
mod manager;
mod ports;
mod worker;

pub use health::{HealthChange, HealthMonitor, HealthMonitorConfig};
pub use lease::{Lease, LeaseEvent, LeaseManager, LeaseStatus};
pub use manager::{FleetConfig, FleetEvent, WorkerManager};
pub use ports::PortAllocator;
pub use worker::{ChromeWorker, WorkerConfig, WorkerDescriptor, WorkerEvent, WorkerState};
