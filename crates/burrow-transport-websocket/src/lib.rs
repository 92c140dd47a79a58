//! WebSocket transport for the control channel
//!
//! The relay accepts control channels on an axum route (so the control
//! endpoint can share a listener with plain HTTP), while tunnel clients dial
//! out with tokio-tungstenite. Both sides exchange one JSON text frame per
//! [`burrow_proto::ControlMessage`].

pub mod client;
pub mod server;

pub use client::{WebSocketClientSink, WebSocketClientSource, WebSocketClientTransport};
pub use server::{WebSocketServerSink, WebSocketServerSource, WebSocketServerTransport};
