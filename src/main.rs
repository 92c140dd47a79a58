//! Burrow CLI - expose local HTTP services through a public relay
//!
//! `burrow relay` runs the public side, `burrow tunnel` connects a local
//! service to it.

mod tls;

use anyhow::{Context, Result};
use burrow_client::{RelayClientConfig, TunnelClient};
use burrow_lib::RelayBuilder;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Burrow - HTTP tunnels through a public relay
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Burrow - expose local HTTP services through a public relay")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, env = "BURROW_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay: public HTTP ingress plus the tunnel control endpoint
    #[command(long_about = r#"
Run the relay. Public HTTP requests for <subdomain>.<domain> are forwarded
over the control channel of the tunnel holding that subdomain.

EXAMPLES:
  # Local development
  burrow relay --http-addr 0.0.0.0:8080 --control-addr 0.0.0.0:8765 --domain localhost

  # Public deployment with TLS on both listeners
  burrow relay --http-addr 0.0.0.0:443 --domain tunnel.example.com \
    --tls-cert cert.pem --tls-key key.pem --control-tls

ENVIRONMENT VARIABLES:
  BURROW_HTTP_ADDR       Public listener address
  BURROW_CONTROL_ADDR    Control listener address
  BURROW_DOMAIN          Domain tunnels are published under
  BURROW_TLS_CERT        TLS certificate (PEM)
  BURROW_TLS_KEY         TLS private key (PEM)
    "#)]
    Relay(RelayArgs),

    /// Connect a local HTTP service to a relay
    #[command(long_about = r#"
Connect to a relay and forward every request it receives for our subdomain
to a local HTTP service. Reconnects automatically when the connection drops.

EXAMPLES:
  # Random subdomain
  burrow tunnel --server ws://localhost:8765 --local http://localhost:3000

  # Fixed subdomain over TLS
  burrow tunnel --server wss://relay.example.com --local http://localhost:3000 \
    --subdomain my-app

ENVIRONMENT VARIABLES:
  BURROW_SERVER          Relay control URL
  BURROW_LOCAL           Local service base URL
  BURROW_SUBDOMAIN       Requested subdomain
    "#)]
    Tunnel(TunnelArgs),
}

#[derive(Args, Debug)]
struct RelayArgs {
    /// Public HTTP listener
    #[arg(long, env = "BURROW_HTTP_ADDR", default_value = burrow_lib::DEFAULT_HTTP_ADDR)]
    http_addr: String,

    /// Control channel listener (WebSocket, `GET /tunnel`)
    #[arg(long, env = "BURROW_CONTROL_ADDR", default_value = burrow_lib::DEFAULT_CONTROL_ADDR)]
    control_addr: String,

    /// Domain tunnels are published under (e.g. tunnel.example.com)
    #[arg(long, env = "BURROW_DOMAIN")]
    domain: Option<String>,

    /// Port advertised in public URLs, when a proxy sits in front of the relay
    #[arg(long, env = "BURROW_PUBLIC_PORT")]
    public_port: Option<u16>,

    /// TLS certificate (PEM) for the public listener
    #[arg(long, env = "BURROW_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS private key (PEM) for the public listener
    #[arg(long, env = "BURROW_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Serve the control listener over TLS too (wss://)
    #[arg(long, env = "BURROW_CONTROL_TLS", requires = "tls_cert")]
    control_tls: bool,

    /// Seconds a public request waits for the tunnel's response
    #[arg(long, env = "BURROW_REQUEST_TIMEOUT", default_value = "30")]
    request_timeout: u64,

    /// Seconds between heartbeats sent to clients
    #[arg(long, env = "BURROW_HEARTBEAT_INTERVAL", default_value = "10")]
    heartbeat_interval: u64,

    /// Seconds without traffic before a tunnel is closed
    #[arg(long, env = "BURROW_IDLE_TIMEOUT", default_value = "30")]
    idle_timeout: u64,

    /// Seconds a closing tunnel may spend finishing in-flight requests
    #[arg(long, env = "BURROW_DRAIN_TIMEOUT", default_value = "5")]
    drain_timeout: u64,

    /// Maximum number of concurrent tunnels
    #[arg(long, env = "BURROW_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// Maximum public request body, in bytes
    #[arg(long, env = "BURROW_MAX_BODY_SIZE", default_value = "10485760")]
    max_body_size: usize,

    /// Length of generated subdomains
    #[arg(long, env = "BURROW_SUBDOMAIN_LENGTH", default_value = "8")]
    subdomain_length: usize,
}

#[derive(Args, Debug)]
struct TunnelArgs {
    /// Relay control URL (ws:// or wss://)
    #[arg(long, env = "BURROW_SERVER", default_value = "ws://localhost:8765")]
    server: String,

    /// Base URL of the local service
    #[arg(long, env = "BURROW_LOCAL", default_value = "http://localhost:3000")]
    local: String,

    /// Subdomain to request instead of a random one
    #[arg(long, env = "BURROW_SUBDOMAIN")]
    subdomain: Option<String>,

    /// Seconds to wait before reconnecting
    #[arg(long, env = "BURROW_RECONNECT_DELAY", default_value = "5")]
    reconnect_delay: u64,

    /// Seconds a call to the local service may take
    #[arg(long, env = "BURROW_UPSTREAM_TIMEOUT", default_value = "30")]
    upstream_timeout: u64,
}

/// Setup logging; RUST_LOG wins over `--log-level`
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Cancel `token` on Ctrl+C
fn spawn_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
        token.cancel();
    });
}

async fn run_relay(args: RelayArgs) -> Result<()> {
    let mut builder = RelayBuilder::new()
        .http_addr(&args.http_addr)
        .context("Invalid --http-addr")?
        .control_addr(&args.control_addr)
        .context("Invalid --control-addr")?
        .request_timeout(Duration::from_secs(args.request_timeout))
        .heartbeat_interval(Duration::from_secs(args.heartbeat_interval))
        .idle_timeout(Duration::from_secs(args.idle_timeout))
        .drain_timeout(Duration::from_secs(args.drain_timeout))
        .max_body_size(args.max_body_size)
        .subdomain_length(args.subdomain_length);

    if let Some(domain) = &args.domain {
        builder = builder.domain(domain);
    }
    if let Some(port) = args.public_port {
        builder = builder.public_port(port);
    }
    if let Some(max_sessions) = args.max_sessions {
        builder = builder.max_sessions(max_sessions);
    }
    if let (Some(cert), Some(key)) = (&args.tls_cert, &args.tls_key) {
        info!("Loading TLS certificate from {}", cert.display());
        let tls = tls::server_config(cert, key)?;
        if args.control_tls {
            builder = builder.control_tls(tls.clone());
        }
        builder = builder.http_tls(tls);
    }

    let mut relay = builder.build().context("Invalid relay configuration")?;
    let addrs = relay.start().await.context("Failed to start relay")?;
    info!("Public traffic on {}", addrs.http);
    info!("Tunnel clients connect to {}", addrs.control);

    let shutdown = CancellationToken::new();
    spawn_ctrl_c(shutdown.clone());
    relay.run_until_stopped(shutdown).await?;
    Ok(())
}

async fn run_tunnel(args: TunnelArgs) -> Result<()> {
    let config = RelayClientConfig::builder()
        .server_url(args.server)
        .local_url(args.local)
        .subdomain(args.subdomain)
        .reconnect_delay(Duration::from_secs(args.reconnect_delay))
        .upstream_timeout(Duration::from_secs(args.upstream_timeout))
        .build()
        .context("Invalid tunnel configuration")?;

    info!("Forwarding to {}", config.local_url);
    info!("Relay: {}", config.control_url());

    let shutdown = CancellationToken::new();
    spawn_ctrl_c(shutdown.clone());
    TunnelClient::new(config).run_forever(shutdown).await;

    info!("Burrow stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    // Both providers are compiled in, so pick one explicitly
    let _ = rustls::crypto::ring::default_provider().install_default();

    match cli.command {
        Commands::Relay(args) => run_relay(args).await,
        Commands::Tunnel(args) => run_tunnel(args).await,
    }
}
