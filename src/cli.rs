use clap::{Parser, Subcommand};

/// Automation middleware between tool-calling agents and Chromium browsers.
#[derive(Debug, Parser)]
#[command(name = "cef-bridge", version, about)]
pub struct Cli {
    /// Debugger host for connect-style commands.
    #[arg(long, global = true, env = "CEF_BRIDGE_HOST")]
    pub host: Option<String>,

    /// Debugger port for connect-style commands.
    #[arg(long, global = true, env = "CEF_BRIDGE_PORT")]
    pub port: Option<u16>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the tool protocol over stdio: one JSON request per line in,
    /// one JSON response per line out.
    Serve {
        /// Attach to an existing browser at this endpoint instead of
        /// launching one on the first verb that needs a browser.
        #[arg(long, conflicts_with = "tenant")]
        endpoint: Option<String>,

        /// Multi-tenant mode: lease a dedicated worker for this tenant and
        /// serve against its debugger endpoint.
        #[arg(long, env = "TENANT_ID")]
        tenant: Option<String>,

        /// Controller identity for lease ownership.
        #[arg(long, env = "CONTROLLER_ID", default_value = "local")]
        controller: String,
    },

    /// One-shot: launch a headless browser, navigate, print the snapshot
    /// state response, and shut down.
    Snapshot {
        /// The URL to capture.
        url: String,

        /// Run with a visible browser window.
        #[arg(long)]
        headed: bool,

        /// Release channel for executable lookup (stable, canary, beta, dev).
        #[arg(long, default_value = "stable")]
        channel: String,

        /// Explicit Chromium executable, overriding channel lookup.
        #[arg(long, env = "CHROME_PATH")]
        chrome_path: Option<std::path::PathBuf>,
    },

    /// Probe an endpoint's debugger and print its version information.
    Doctor {
        /// Endpoint to probe; defaults to the configured host and port.
        #[arg(long)]
        endpoint: Option<String>,
    },
}
