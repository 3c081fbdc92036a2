//! portrelay: multi-port TCP relay.
//!
//! Reads a port → backend mapping, binds one listener per entry, and relays
//! every accepted connection byte-for-byte to its backend.

use anyhow::Context;
use clap::Parser;
use portrelay_server::config::{CliOverrides, RelayConfig};
use portrelay_server::shutdown;
use portrelay_server::supervisor::RelaySupervisor;
use std::path::PathBuf;
use tracing::{error, info};

/// portrelay — forward local TCP ports to backend addresses
#[derive(Parser, Debug)]
#[command(name = "portrelay", version, about = "Multi-port TCP relay")]
struct Cli {
    /// Config file path (YAML, or TOML with a .toml extension)
    #[arg(short, long, default_value = "config.yml")]
    config: String,

    /// Local address to bind every listener on
    #[arg(long)]
    bind: Option<String>,

    /// Backend connect timeout in seconds (0 disables)
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Close sessions idle for this many seconds (0 disables)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Maximum concurrent sessions per listener (0 = unlimited)
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Seconds to wait for in-flight sessions on shutdown
    #[arg(long)]
    shutdown_grace: Option<u64>,

    /// Validate the config and exit
    #[arg(long)]
    check: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            bind_address: self.bind.clone(),
            connect_timeout_secs: self.connect_timeout,
            idle_timeout_secs: self.idle_timeout,
            max_sessions_per_listener: self.max_sessions,
            shutdown_grace_secs: self.shutdown_grace,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting portrelay");

    let relay_config = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            let reason = format!("{e:#}");
            error!(error = %reason, "failed to load config");
            std::process::exit(1);
        }
    };

    if cli.check {
        for entry in relay_config.mappings.entries() {
            info!(port = entry.listen_port, backend = %entry.backend, "mapping");
        }
        info!(mappings = relay_config.mappings.len(), "config ok");
        return;
    }

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let mut relay = tokio::spawn(RelaySupervisor::new(relay_config).run(shutdown_rx));

    tokio::select! {
        joined = &mut relay => {
            if let Err(e) = joined {
                error!(error = %e, "supervisor task failed");
            }
        }
        _ = shutdown::shutdown_signal() => {
            info!("received shutdown signal");
            shutdown_tx.send_replace(true);
            if let Err(e) = relay.await {
                error!(error = %e, "supervisor task failed");
            }
        }
    }

    info!("portrelay stopped");
}

fn load_config(cli: &Cli) -> anyhow::Result<RelayConfig> {
    let path = PathBuf::from(&cli.config);
    RelayConfig::load(&path, &cli.overrides())
        .with_context(|| format!("config {}", path.display()))
}
