//! Chromium process discovery and launch.
//!
//! Everything needed to find a debugger endpoint: executable resolution per
//! release channel, `/json/version` HTTP discovery, the `DevToolsActivePort`
//! sentinel file, and a launcher that spawns Chromium and polls it ready.

mod discovery;
mod error;
mod launcher;
mod platform;

pub use discovery::{
    BrowserVersion, TargetInfo, discover_debugger, is_attachable_target, query_targets,
    query_version, read_devtools_active_port, read_devtools_active_port_from,
};
pub use error::ChromeError;
pub use launcher::{ChromeProcess, SpawnConfig, find_available_port, launch_chrome};
pub use platform::{Channel, default_user_data_dir, resolve_executable};
