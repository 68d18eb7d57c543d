//! tunmux CLI - multiplex many connections over one tunnel
//!
//! `serve` runs the remote side; `forward` and `up` run local listeners whose
//! connections are carried over a single physical connection.

mod config;
mod forward;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunmux_connection::{LocalEndpoint, TcpPhysicalConnector};
use tunmux_connectors::HeaderRouter;
use tunmux_proto::Address;
use tunmux_server::{TunnelServer, TunnelServerConfig};

use config::{ForwardKind, TunmuxConfig, DEFAULT_CONFIG_FILE};
use forward::{run_forward, Forward};

/// tunmux - Carry many connections over one tunnel
#[derive(Parser, Debug)]
#[command(name = "tunmux")]
#[command(about = "tunmux - Carry many connections over one tunnel")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tunnel server
    #[command(long_about = r#"
Accept tunnels from tunmux clients and open the connections they request.

EXAMPLES:
  tunmux serve --bind 0.0.0.0:6000

ENVIRONMENT VARIABLES:
  TUNMUX_BIND    Address to listen on
    "#)]
    Serve {
        /// Address to listen on
        #[arg(long, env = "TUNMUX_BIND", default_value = "0.0.0.0:6000")]
        bind: SocketAddr,
    },

    /// Forward a local port to a target behind the tunnel
    #[command(long_about = r#"
Listen on a local address and carry every accepted connection to the target,
as resolved by the tunnel server. All connections share one tunnel.

EXAMPLES:
  tunmux forward --tunnel proxy.example.com:6000 \
    --listen 127.0.0.1:5432 \
    --target db.internal:5432

ENVIRONMENT VARIABLES:
  TUNMUX_TUNNEL  Tunnel server address
    "#)]
    Forward {
        /// Tunnel server address (e.g., proxy.example.com:6000)
        #[arg(long, env = "TUNMUX_TUNNEL")]
        tunnel: String,

        /// Local address to accept connections on
        #[arg(long)]
        listen: String,

        /// Target host:port on the tunnel server's side
        #[arg(long)]
        target: Address,

        /// Connection kind opened on the tunnel server's side
        #[arg(long, value_enum, default_value = "tcp")]
        kind: ForwardKind,

        /// Tunnel connect timeout in seconds
        #[arg(long, default_value = "10")]
        connect_timeout: u64,
    },

    /// Run every forward listed in a config file
    Up {
        /// Path to the config file
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { cli.log_level.as_str() };
    init_logging(log_level)?;

    tokio::select! {
        result = run(cli.command) => result,
        signal = signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown signal received, stopping"),
                Err(e) => error!("Error listening for shutdown signal: {}", e),
            }
            Ok(())
        }
    }
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Serve { bind } => serve(bind).await,
        Commands::Forward {
            tunnel,
            listen,
            target,
            kind,
            connect_timeout,
        } => {
            let endpoint = local_endpoint(&tunnel, Duration::from_secs(connect_timeout));
            let forward = Forward {
                name: "forward".to_string(),
                listen,
                target,
                kind,
            };
            run_forward(endpoint, forward).await
        }
        Commands::Up { config } => up(&config).await,
    }
}

async fn serve(bind: SocketAddr) -> Result<()> {
    let server = TunnelServer::bind(
        TunnelServerConfig { bind_addr: bind },
        Arc::new(HeaderRouter::with_defaults()),
    )
    .await?;

    info!("Press Ctrl+C to stop");
    server.run().await?;
    Ok(())
}

async fn up(path: &std::path::Path) -> Result<()> {
    let config = TunmuxConfig::load(path)?;
    let endpoint = local_endpoint(&config.tunnel, config.connect_timeout());

    info!(
        "Starting {} forwards over tunnel {}",
        config.forwards.len(),
        config.tunnel
    );

    let mut forwards = JoinSet::new();
    for forward in &config.forwards {
        let forward = Forward {
            name: forward.name.clone(),
            listen: forward.listen.clone(),
            target: forward.target_address()?,
            kind: forward.kind,
        };
        forwards.spawn(run_forward(endpoint.clone(), forward));
    }

    while let Some(joined) = forwards.join_next().await {
        joined.context("Forward task panicked")??;
    }
    Ok(())
}

fn local_endpoint(tunnel: &str, connect_timeout: Duration) -> LocalEndpoint {
    let connector = TcpPhysicalConnector::new(tunnel).with_connect_timeout(connect_timeout);
    LocalEndpoint::new(Arc::new(connector))
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();

    Ok(())
}
