//! High-level relay API
//!
//! # Quick Start
//!
//! ```ignore
//! use burrow_lib::RelayBuilder;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut relay = RelayBuilder::new()
//!         .http_addr("0.0.0.0:8080")?
//!         .control_addr("0.0.0.0:8765")?
//!         .domain("tunnel.example.com")
//!         .build()?;
//!
//!     let addrs = relay.start().await?;
//!     println!("public traffic on {}", addrs.http);
//!
//!     relay.run_until_stopped(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

use crate::relay_config::RelayConfig;
use burrow_control::{
    Dispatcher, PendingRequests, SessionConfig, SessionHandler, SessionRegistry,
    DEFAULT_OUTBOUND_QUEUE, DEFAULT_WRITE_TIMEOUT,
};
use burrow_router::{RandomSubdomainGenerator, SubdomainGenerator};
use burrow_server_http::{
    control_router, ingress_router, HttpServer, HttpServerError, IngressState,
};
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Extra time granted to sessions after their own drain timeout
const SESSION_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Relay errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(#[from] HttpServerError),

    #[error("Relay already started")]
    AlreadyStarted,

    #[error("Server task failed: {0}")]
    TaskFailed(String),
}

/// Addresses the relay actually bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayAddrs {
    pub http: SocketAddr,
    pub control: SocketAddr,
}

/// Builder for [`Relay`]
pub struct RelayBuilder {
    config: RelayConfig,
    generator: Option<Arc<dyn SubdomainGenerator>>,
}

impl RelayBuilder {
    pub fn new() -> Self {
        Self::from_config(RelayConfig::default())
    }

    pub fn from_config(config: RelayConfig) -> Self {
        Self {
            config,
            generator: None,
        }
    }

    /// Address of the public listener (e.g. "0.0.0.0:8080")
    pub fn http_addr(mut self, addr: &str) -> Result<Self, RelayError> {
        self.config.http_addr = parse_addr(addr)?;
        Ok(self)
    }

    /// Address of the control listener (e.g. "0.0.0.0:8765")
    pub fn control_addr(mut self, addr: &str) -> Result<Self, RelayError> {
        self.config.control_addr = parse_addr(addr)?;
        Ok(self)
    }

    pub fn http_tls(mut self, tls: Arc<ServerConfig>) -> Self {
        self.config.http_tls = Some(tls);
        self
    }

    pub fn control_tls(mut self, tls: Arc<ServerConfig>) -> Self {
        self.config.control_tls = Some(tls);
        self
    }

    /// Domain tunnels are published under (e.g. "tunnel.example.com")
    pub fn domain(mut self, domain: &str) -> Self {
        self.config.base_domain = Some(domain.to_string());
        self
    }

    pub fn public_port(mut self, port: u16) -> Self {
        self.config.public_port = Some(port);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    pub fn max_sessions(mut self, max_sessions: usize) -> Self {
        self.config.max_sessions = Some(max_sessions);
        self
    }

    pub fn max_body_size(mut self, max_body_size: usize) -> Self {
        self.config.max_body_size = max_body_size;
        self
    }

    pub fn subdomain_length(mut self, length: usize) -> Self {
        self.config.subdomain_length = length;
        self
    }

    /// Replace the random subdomain generator
    pub fn subdomain_generator(mut self, generator: Arc<dyn SubdomainGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Validate the configuration and build the relay
    pub fn build(self) -> Result<Relay, RelayError> {
        let mut config = self.config;

        if let Some(domain) = config.base_domain.take() {
            let domain = domain.trim().trim_matches('.').to_ascii_lowercase();
            if domain.is_empty() {
                return Err(RelayError::ConfigError("domain must not be empty".to_string()));
            }
            config.base_domain = Some(domain);
        }
        if config.request_timeout.is_zero() {
            return Err(RelayError::ConfigError(
                "request timeout must be greater than zero".to_string(),
            ));
        }
        if config.idle_timeout.is_zero() || config.heartbeat_interval.is_zero() {
            return Err(RelayError::ConfigError(
                "heartbeat interval and idle timeout must be greater than zero".to_string(),
            ));
        }
        if config.heartbeat_interval >= config.idle_timeout {
            warn!(
                "Heartbeat interval {:?} is not shorter than idle timeout {:?}; quiet clients will be dropped",
                config.heartbeat_interval, config.idle_timeout
            );
        }
        if config.max_sessions == Some(0) {
            return Err(RelayError::ConfigError(
                "max sessions must be at least 1".to_string(),
            ));
        }
        if config.max_body_size == 0 {
            return Err(RelayError::ConfigError(
                "max body size must be greater than zero".to_string(),
            ));
        }

        let generator = self.generator.unwrap_or_else(|| {
            Arc::new(RandomSubdomainGenerator::with_length(config.subdomain_length))
        });
        let registry = Arc::new(
            SessionRegistry::new()
                .with_generator(generator)
                .with_max_sessions(config.max_sessions),
        );
        let pending = PendingRequests::new().with_default_timeout(config.request_timeout);

        Ok(Relay {
            config,
            registry,
            pending,
            stop: CancellationToken::new(),
            servers: JoinSet::new(),
            addrs: None,
        })
    }
}

impl Default for RelayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr, RelayError> {
    addr.parse()
        .map_err(|e| RelayError::ParseError(format!("Invalid address '{}': {}", addr, e)))
}

/// A configured tunnel relay: public ingress plus control endpoint
pub struct Relay {
    config: RelayConfig,
    registry: Arc<SessionRegistry>,
    pending: PendingRequests,
    /// Stops both listeners and drains every session
    stop: CancellationToken,
    servers: JoinSet<Result<(), HttpServerError>>,
    addrs: Option<RelayAddrs>,
}

impl Relay {
    pub fn builder() -> RelayBuilder {
        RelayBuilder::new()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Live sessions by subdomain
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Requests currently waiting on a tunnel
    pub fn pending(&self) -> PendingRequests {
        self.pending.clone()
    }

    /// Bound addresses, once started
    pub fn addrs(&self) -> Option<RelayAddrs> {
        self.addrs
    }

    /// Bind both listeners and start serving in the background
    pub async fn start(&mut self) -> Result<RelayAddrs, RelayError> {
        if self.addrs.is_some() {
            return Err(RelayError::AlreadyStarted);
        }

        let dispatcher = Dispatcher::new(self.registry.clone(), self.pending.clone())
            .with_base_domain(self.config.base_domain.clone())
            .with_request_timeout(self.config.request_timeout);
        let ingress_state =
            IngressState::new(dispatcher).with_max_body_size(self.config.max_body_size);

        let ingress = HttpServer::bind(
            "ingress",
            self.config.http_addr,
            ingress_router(ingress_state),
            self.config.http_tls.clone(),
        )
        .await?;
        let http_addr = ingress.local_addr()?;

        // Public URLs point at the ingress, so they need its bound port
        let session_config = SessionConfig {
            heartbeat_interval: self.config.heartbeat_interval,
            idle_timeout: self.config.idle_timeout,
            drain_timeout: self.config.drain_timeout,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            base_domain: self.config.base_domain.clone(),
            public_scheme: if ingress.is_tls() { "https" } else { "http" }.to_string(),
            public_port: Some(self.config.public_port.unwrap_or(http_addr.port())),
        };
        let handler = SessionHandler::new(
            self.registry.clone(),
            self.pending.clone(),
            session_config,
            self.stop.clone(),
        );

        let control = HttpServer::bind(
            "control",
            self.config.control_addr,
            control_router(handler),
            self.config.control_tls.clone(),
        )
        .await?;
        let control_addr = control.local_addr()?;

        self.servers.spawn(ingress.serve(self.stop.clone()));
        self.servers.spawn(control.serve(self.stop.clone()));

        let addrs = RelayAddrs {
            http: http_addr,
            control: control_addr,
        };
        self.addrs = Some(addrs);

        info!(
            "✅ Relay started (public: {}, control: {}, domain: {})",
            addrs.http,
            addrs.control,
            self.config.base_domain.as_deref().unwrap_or("<any>")
        );
        Ok(addrs)
    }

    /// Serve until `shutdown` is cancelled or a listener fails, then drain
    ///
    /// Starts the relay first if [`Relay::start`] was not called.
    pub async fn run_until_stopped(mut self, shutdown: CancellationToken) -> Result<(), RelayError> {
        if self.addrs.is_none() {
            self.start().await?;
        }

        let mut failure = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, draining {} sessions", self.registry.active_count());
                None
            }
            joined = self.servers.join_next() => {
                warn!("A relay listener stopped unexpectedly");
                joined.and_then(server_failure)
            }
        };

        self.stop.cancel();
        while let Some(joined) = self.servers.join_next().await {
            if let Some(e) = server_failure(joined) {
                failure.get_or_insert(e);
            }
        }

        // Upgraded control channels outlive the listener that accepted them
        let registry = self.registry.clone();
        let drained = tokio::time::timeout(self.config.drain_timeout + SESSION_DRAIN_GRACE, async {
            while registry.active_count() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} sessions still open after drain timeout",
                self.registry.active_count()
            );
        }

        info!("Relay stopped");
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn server_failure(joined: Result<Result<(), HttpServerError>, JoinError>) -> Option<RelayError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            error!("Relay listener failed: {}", e);
            Some(RelayError::ServerError(e))
        }
        Err(e) => {
            error!("Relay listener task failed: {}", e);
            Some(RelayError::TaskFailed(e.to_string()))
        }
    }
}
