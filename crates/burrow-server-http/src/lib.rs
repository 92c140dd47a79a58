//! HTTP surfaces of the relay
//!
//! Two routers share one listener implementation:
//! - the public ingress, which turns inbound HTTP into tunnel requests
//! - the control endpoint, where tunnel clients open their WebSocket
//!
//! Either can be served plain or behind rustls.

pub mod control;
pub mod ingress;
pub mod server;

pub use control::{control_router, ControlParams};
pub use ingress::{ingress_router, IngressState, DEFAULT_MAX_BODY_SIZE};
pub use server::{HttpServer, HttpServerError};
