//! Burrow Library - Public API for embedding the relay or the tunnel client
//!
//! Re-exports the building blocks of both sides and adds [`RelayBuilder`], a
//! one-stop way to run a relay from Rust code.
//!
//! # Quick Start - Tunnel Client
//!
//! ```ignore
//! use burrow_lib::{RelayClientConfig, TunnelClient};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RelayClientConfig::builder()
//!         .server_url("wss://relay.example.com")
//!         .local_url("http://localhost:3000")
//!         .build()?;
//!
//!     TunnelClient::new(config)
//!         .run_forever(CancellationToken::new())
//!         .await;
//!     Ok(())
//! }
//! ```
//!
//! # Embedding the pieces
//!
//! The relay is only glue around its parts. Custom deployments can assemble
//! them directly:
//!
//! ```ignore
//! use burrow_lib::{
//!     control_router, ingress_router, Dispatcher, HttpServer, IngressState, PendingRequests,
//!     SessionConfig, SessionHandler, SessionRegistry,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(SessionRegistry::new());
//! let pending = PendingRequests::new();
//! let shutdown = CancellationToken::new();
//!
//! let handler = SessionHandler::new(
//!     registry.clone(),
//!     pending.clone(),
//!     SessionConfig::default(),
//!     shutdown.clone(),
//! );
//! let dispatcher = Dispatcher::new(registry, pending);
//!
//! let control = HttpServer::bind("control", "0.0.0.0:8765".parse()?, control_router(handler), None).await?;
//! let ingress = HttpServer::bind(
//!     "ingress",
//!     "0.0.0.0:8080".parse()?,
//!     ingress_router(IngressState::new(dispatcher)),
//!     None,
//! )
//! .await?;
//!
//! tokio::spawn(control.serve(shutdown.clone()));
//! ingress.serve(shutdown).await?;
//! # Ok(())
//! # }
//! ```

pub mod relay;
pub mod relay_config;

pub use relay::{Relay, RelayAddrs, RelayBuilder, RelayError};
pub use relay_config::{RelayConfig, DEFAULT_CONTROL_ADDR, DEFAULT_HTTP_ADDR};

// Protocol
pub use burrow_proto::{
    ControlMessage, RequestFrame, RequestId, ResponseFrame, CONTROL_PATH, HEALTH_PATH,
    MAX_FRAME_SIZE, PROTOCOL_VERSION,
};

// Routing
pub use burrow_router::{
    RandomSubdomainGenerator, RegistryError, SubdomainGenerator, TunnelRegistry,
};

// Control plane
pub use burrow_control::{
    CloseReason, DispatchError, Dispatcher, PendingRequests, Session, SessionConfig,
    SessionHandler, SessionId, SessionRegistry, SessionStatus,
};

// HTTP surfaces
pub use burrow_server_http::{
    control_router, ingress_router, HttpServer, HttpServerError, IngressState,
};

// Client
pub use burrow_client::{
    Assignment, ChannelEnd, RelayClientConfig, RelayClientError, TunnelClient, UpstreamClient,
};
