//! Relay configuration

use burrow_proto::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_IDLE_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
use burrow_control::DEFAULT_DRAIN_TIMEOUT;
use burrow_router::DEFAULT_SUBDOMAIN_LENGTH;
use burrow_server_http::DEFAULT_MAX_BODY_SIZE;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Default public listener
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";

/// Default control listener
pub const DEFAULT_CONTROL_ADDR: &str = "0.0.0.0:8765";

/// Everything a relay needs to start
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Public ingress listener
    pub http_addr: SocketAddr,
    /// Control channel listener (`GET /tunnel`)
    pub control_addr: SocketAddr,
    /// Serve the public listener over TLS
    pub http_tls: Option<Arc<ServerConfig>>,
    /// Serve the control listener over TLS
    pub control_tls: Option<Arc<ServerConfig>>,
    /// Domain tunnels are published under; any domain is accepted when unset
    pub base_domain: Option<String>,
    /// Port advertised in public URLs, when it differs from the bound one
    pub public_port: Option<u16>,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub drain_timeout: Duration,
    /// Upper bound on concurrent tunnels; unlimited when unset
    pub max_sessions: Option<usize>,
    pub max_body_size: usize,
    /// Length of generated subdomains
    pub subdomain_length: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            control_addr: SocketAddr::from(([0, 0, 0, 0], 8765)),
            http_tls: None,
            control_tls: None,
            base_domain: None,
            public_port: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            max_sessions: None,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            subdomain_length: DEFAULT_SUBDOMAIN_LENGTH,
        }
    }
}
