//! Per-page observation plumbing: the network-quiet tracker and the DOM
//! stabilizer. Both are owned by the session manager's page registry and are
//! released explicitly when a page closes.

mod network;
mod stabilizer;

pub use network::NetworkTracker;
pub use stabilizer::{
    StabilizeOutcome, StabilizeStatus, install_observer_hooks, is_navigation_symptom,
    stabilize_after_action, wait_for_dom_content_loaded, wait_for_dom_quiet,
};
