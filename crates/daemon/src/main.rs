/// hostlink daemon - per-host runtime connection broker
///
/// This daemon:
/// - Binds applications to identities on a local control socket
/// - Dials on their behalf under policy and hands back connected sockets
/// - Routes inbound TLS connections by server name on shared ports
/// - Coordinates live handoff of connections between instances

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hostlink_common::BrokerConfig;
use hostlink_core::Runtime;
use hostlink_daemon::{ApiServer, ControlServer};

const DEFAULT_CONFIG: &str = "hostlink.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config_arg = |index: usize| {
        PathBuf::from(args.get(index).map(String::as_str).unwrap_or(DEFAULT_CONFIG))
    };

    match args.get(1).map(String::as_str) {
        None => run(config_arg(2)).await?,
        Some("run") => run(config_arg(2)).await?,
        Some("check-config") => check_config(config_arg(2))?,
        Some("help" | "--help" | "-h") => print_help(),
        Some("version" | "--version" | "-v") => {
            println!("hostlink daemon v{}", env!("CARGO_PKG_VERSION"));
        }
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Run with 'help' to see available commands");
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Load the configuration, or write the defaults if none exists
fn load_config(path: &PathBuf) -> Result<BrokerConfig> {
    if path.exists() {
        info!("Loading configuration from {:?}", path);
        return Ok(BrokerConfig::from_file(path)?);
    }

    info!("No configuration file found, using defaults");
    let config = BrokerConfig::default();
    if let Err(e) = config.to_file(path) {
        warn!("Failed to save default config: {}", e);
    } else {
        info!("Saved default configuration to {:?}", path);
    }
    Ok(config)
}

async fn run(config_path: PathBuf) -> Result<()> {
    info!("Starting hostlink daemon v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&config_path)?;
    let runtime = Arc::new(Runtime::new(config.clone())?);
    let sni_addrs = runtime.start().await?;
    for addr in &sni_addrs {
        info!("SNI multiplexor bound to {}", addr);
    }

    // Control socket
    let listener = ControlServer::bind(&config.control_socket)?;
    info!("Control socket: {}", config.control_socket.display());
    let control = Arc::new(ControlServer::new(runtime.clone()));
    tokio::spawn(async move {
        if let Err(e) = control.serve(listener).await {
            error!("Control server error: {}", e);
        }
    });

    // Status API
    let api_server = ApiServer::new(config.api_addr, runtime.clone());
    tokio::spawn(async move {
        if let Err(e) = api_server.start().await {
            warn!("API server error: {}", e);
        }
    });

    let mut hangup = signal(SignalKind::hangup())?;
    info!("Daemon is running. Send SIGHUP to reload, Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                match runtime.reload() {
                    Ok(report) => info!(
                        "Reloaded: policy v{}, routes v{}, {} services",
                        report.policy_version, report.routes_version, report.services
                    ),
                    Err(e) => error!("Reload failed, keeping current documents: {}", e),
                }
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    info!("Shutdown signal received");
    runtime.stop().await;
    if let Err(e) = std::fs::remove_file(&config.control_socket) {
        warn!("Failed to remove control socket: {}", e);
    }

    info!("Daemon stopped");
    Ok(())
}

/// Parse the configuration and every document it points at
fn check_config(config_path: PathBuf) -> Result<()> {
    let config = BrokerConfig::from_file(&config_path)?;
    let runtime = Runtime::new(config)?;
    let report = runtime.reload()?;

    println!("Configuration OK: {}", config_path.display());
    println!("  policy version:  {}", report.policy_version);
    println!("  identities:      {}", report.identities);
    println!("  routes version:  {}", report.routes_version);
    println!("  routes:          {}", report.routes);
    println!("  services:        {}", report.services);
    Ok(())
}

/// Print help message
fn print_help() {
    println!("hostlink daemon - per-host runtime connection broker");
    println!();
    println!("USAGE:");
    println!("    hostlink-daemon [COMMAND] [CONFIG]");
    println!();
    println!("COMMANDS:");
    println!("    run            Run the broker (default)");
    println!("    check-config   Validate the configuration and its documents");
    println!("    help           Show this help message");
    println!("    version        Show version information");
    println!();
    println!("CONFIG defaults to ./{}; a default file is written if missing.", DEFAULT_CONFIG);
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG       Log filter, e.g. info or hostlink_core=debug,audit=info");
}
