//! Control plane for tunnel sessions
//!
//! Everything between "a client opened a control channel" and "a public
//! caller got its response": session lifecycle, request/response
//! correlation and dispatch of public requests into sessions.
pub mod dispatch;
pub mod handler;
pub mod pending_requests;
pub mod session;

pub use dispatch::{DispatchError, Dispatcher, IncomingRequest};
pub use handler::{
    CloseReason, SessionConfig, SessionHandler, DEFAULT_DRAIN_TIMEOUT, DEFAULT_OUTBOUND_QUEUE,
    DEFAULT_WRITE_TIMEOUT,
};
pub use pending_requests::{CorrelatorError, PendingRequests, PendingResponse, RequestOutcome};
pub use session::{Session, SessionError, SessionId, SessionStatus};

use burrow_router::TunnelRegistry;
use std::sync::Arc;

/// Registry of live sessions, keyed by subdomain
pub type SessionRegistry = TunnelRegistry<Arc<Session>>;
