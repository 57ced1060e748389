use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use cef_bridge::bridge::Bridge;
use cef_bridge::chrome::{Channel, discover_debugger, query_version, resolve_executable};
use cef_bridge::cli::{Cli, Command};
use cef_bridge::config::{self, ConnectSpec, LaunchOptions};
use cef_bridge::error::BridgeError;
use cef_bridge::fleet::{FleetConfig, WorkerManager};
use cef_bridge::tools::ToolRequest;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let result = runtime.block_on(run(cli));

    if let Err(e) = result {
        eprintln!("{}", e.to_json());
        std::process::exit(match e {
            BridgeError::InvalidArgument { .. } | BridgeError::InvalidUrl(_) => 2,
            BridgeError::ConnectionTimeout { .. } | BridgeError::Connection { .. } => 3,
            _ => 1,
        });
    }
}

async fn run(cli: Cli) -> Result<(), BridgeError> {
    let config = config::load_config()?;

    match cli.command {
        Command::Serve {
            endpoint,
            tenant,
            controller,
        } => serve(config, endpoint, tenant, &controller).await,
        Command::Snapshot {
            url,
            headed,
            channel,
            chrome_path,
        } => snapshot_once(config, &url, headed, &channel, chrome_path).await,
        Command::Doctor { endpoint } => doctor(&cli.host, cli.port, endpoint.as_deref()).await,
    }
}

/// The stdio protocol loop: one JSON request per line, one JSON response
/// per line. Errors are responses too; only I/O on stdio ends the loop.
///
/// In tenant mode, a dedicated worker is leased up front and the session is
/// bound to its debugger endpoint; the lease is released on exit.
async fn serve(
    config: cef_bridge::config::BridgeConfig,
    endpoint: Option<String>,
    tenant: Option<String>,
    controller: &str,
) -> Result<(), BridgeError> {
    let bridge = Bridge::new(config);

    let fleet = match tenant {
        Some(tenant_id) => {
            let mut fleet_config = FleetConfig::default();
            if let Ok(executable) = resolve_executable(Channel::Stable, None) {
                fleet_config.executable = executable;
            }
            let manager = WorkerManager::new(fleet_config)?;
            let endpoint = manager.acquire_for_tenant(&tenant_id, controller).await?;
            let spec = match ConnectSpec::classify(&endpoint) {
                Ok(spec) => spec,
                Err(e) => {
                    manager.shutdown().await;
                    return Err(e);
                }
            };
            if let Err(e) = bridge.session().connect(&spec).await {
                manager.shutdown().await;
                return Err(e);
            }
            Some((manager, tenant_id))
        }
        None => {
            if let Some(endpoint) = endpoint {
                let spec = ConnectSpec::classify(&endpoint)?;
                bridge.session().connect(&spec).await?;
            }
            None
        }
    };

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_owned();
        if line.is_empty() {
            continue;
        }
        let reply = match ToolRequest::parse(&line) {
            Ok(request) => match bridge.handle(request).await {
                Ok(value) => value,
                Err(e) => serde_json::json!({ "error": e.to_string(), "code": e.error_code() }),
            },
            Err(e) => serde_json::json!({ "error": e.to_string(), "code": e.error_code() }),
        };
        let mut out = reply.to_string();
        out.push('\n');
        if stdout.write_all(out.as_bytes()).await.is_err() {
            break;
        }
        let _ = stdout.flush().await;
    }

    let shutdown = bridge.session().shutdown().await;
    if let Some((manager, tenant_id)) = fleet {
        let _ = manager.release_lease(&tenant_id).await;
        manager.shutdown().await;
    }
    shutdown
}

/// Launch, navigate, capture, print, shut down.
async fn snapshot_once(
    config: cef_bridge::config::BridgeConfig,
    url: &str,
    headed: bool,
    channel: &str,
    chrome_path: Option<std::path::PathBuf>,
) -> Result<(), BridgeError> {
    let opts = LaunchOptions {
        headless: !headed,
        channel: Channel::parse(channel)?,
        executable_path: chrome_path,
        ..LaunchOptions::default()
    };

    let bridge = Bridge::new(config);
    bridge.session().launch(&opts).await?;
    let reply = bridge
        .handle(ToolRequest::Navigate {
            url: url.to_owned(),
            page_id: None,
        })
        .await;
    let shutdown = bridge.session().shutdown().await;
    let reply = reply?;
    shutdown?;
    println!("{reply}");
    Ok(())
}

/// Probe a debugger endpoint and print `/json/version`. With no explicit
/// endpoint, the `DevToolsActivePort` sentinel is consulted before the
/// configured host and port.
async fn doctor(
    host: &Option<String>,
    port: Option<u16>,
    endpoint: Option<&str>,
) -> Result<(), BridgeError> {
    let (host, port) = match endpoint {
        Some(endpoint) => match ConnectSpec::classify(endpoint)? {
            ConnectSpec::HostPort { host, port } => (host, port),
            ConnectSpec::HttpUrl(url) => {
                let parsed =
                    url::Url::parse(&url).map_err(|_| BridgeError::InvalidUrl(url.clone()))?;
                let host = parsed
                    .host_str()
                    .ok_or_else(|| BridgeError::InvalidUrl(url.clone()))?
                    .to_owned();
                (host, parsed.port().unwrap_or(config::DEFAULT_CDP_PORT))
            }
            ConnectSpec::WsUrl(url) => {
                return Err(BridgeError::InvalidArgument {
                    field: "endpoint".into(),
                    message: format!("doctor probes HTTP endpoints, not {url}"),
                });
            }
            ConnectSpec::AutoDiscover => (config::bridge_host(), config::bridge_port()),
        },
        None => {
            let host = host.clone().unwrap_or_else(config::bridge_host);
            let port = port.unwrap_or_else(config::bridge_port);
            let (ws_url, discovered_port) = discover_debugger(&host, port).await?;
            println!(
                "{}",
                serde_json::json!({
                    "ws_debugger_url": ws_url,
                    "port": discovered_port,
                })
            );
            return Ok(());
        }
    };

    let version = query_version(&host, port).await?;
    println!(
        "{}",
        serde_json::json!({
            "browser": version.browser,
            "protocol_version": version.protocol_version,
            "ws_debugger_url": version.ws_debugger_url,
        })
    );
    Ok(())
}
