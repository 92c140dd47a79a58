//! Tunnel client library
//!
//! Connects to a relay's control endpoint, receives forwarded HTTP requests
//! and replays them against a local service.

pub mod config;
pub mod tunnel;
pub mod upstream;

pub use config::{RelayClientConfig, RelayClientConfigBuilder, DEFAULT_RECONNECT_DELAY};
pub use tunnel::{serve_channel, Assignment, ChannelEnd, TunnelClient};
pub use upstream::UpstreamClient;

use burrow_transport::TransportError;
use thiserror::Error;

/// Tunnel client errors
#[derive(Debug, Error)]
pub enum RelayClientError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Relay refused the tunnel: {0}")]
    Rejected(String),

    #[error("Connection closed before the tunnel was established")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}
