//! Burrow Protocol Definitions
//!
//! This crate defines the control-channel envelopes exchanged between the relay
//! and a tunnel client, the JSON codec used to put them on the wire, and the
//! protocol-wide constants both sides agree on.

pub mod codec;
pub mod headers;
pub mod messages;

pub use codec::{CodecError, ControlCodec};
pub use headers::{is_hop_by_hop, strip_hop_by_hop};
pub use messages::*;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum encoded frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Path of the control-channel WebSocket endpoint on the relay
pub const CONTROL_PATH: &str = "/tunnel";

/// Liveness path on the public listener; never routed to a tunnel
pub const HEALTH_PATH: &str = "/health";

/// Deadline applied to every forwarded request when the caller gives none
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between relay-initiated heartbeats
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// A session with no inbound traffic for this long is closed
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Milliseconds since the unix epoch, used for heartbeat timestamps
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
