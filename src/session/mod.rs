//! Session and debugger lifecycle: the connection state machine, the page
//! registry, and the manager that owns both.

mod manager;
mod registry;
mod state;
mod storage;

pub use manager::{HealthStatus, SessionManager};
pub use registry::{PageHandle, PageId, PageMetadata, PageRegistry};
pub use state::{ConnectionState, StateChange, StateMachine};
pub use storage::{Cookie, OriginState, StorageItem, StorageState};
