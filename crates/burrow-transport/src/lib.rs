//! Transport abstraction for the control channel
//!
//! The relay and the client only ever speak [`ControlMessage`]s. How those
//! messages travel (WebSocket today, an in-memory pipe in tests) is hidden
//! behind the traits in this crate.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │   session handler (relay) / tunnel client    │
//! └──────────────────────────────────────────────┘
//!                      │ ControlTransport::split
//!                      ↓
//! ┌─────────────────────┐   ┌────────────────────┐
//! │  FrameSink (writer)  │   │ FrameSource (read) │
//! └─────────────────────┘   └────────────────────┘
//!                      │ implemented by
//!                      ↓
//! ┌──────────────────────┬───────────────────────┐
//! │ burrow-transport-    │ memory (this crate)   │
//! │ websocket            │                       │
//! └──────────────────────┴───────────────────────┘
//! ```

pub mod memory;

pub use memory::{MemorySink, MemorySource, MemoryTransport};

use async_trait::async_trait;
use burrow_proto::{CodecError, ControlMessage};
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// A single frame could not be decoded; the channel itself is still usable
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Timeout")]
    Timeout,
}

impl TransportError {
    /// Whether the channel can keep being used after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::Codec(_))
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Sending half of a control channel
#[async_trait]
pub trait FrameSink: Send + Debug {
    /// Encode and send one control message
    async fn send_message(&mut self, message: &ControlMessage) -> TransportResult<()>;

    /// Close the sending side of the channel
    async fn close(&mut self) -> TransportResult<()>;
}

/// Receiving half of a control channel
#[async_trait]
pub trait FrameSource: Send + Debug {
    /// Receive the next control message
    ///
    /// Returns `Ok(None)` once the peer has closed the channel. An
    /// undecodable frame yields `Err(TransportError::Codec(..))` and the
    /// source can be polled again.
    async fn recv_message(&mut self) -> TransportResult<Option<ControlMessage>>;
}

/// An established control channel
pub trait ControlTransport: Send + Debug + 'static {
    type Sink: FrameSink + 'static;
    type Source: FrameSource + 'static;

    /// Split into independently owned halves so reading and writing can run
    /// on different tasks
    fn split(self) -> (Self::Sink, Self::Source);

    /// Get the remote peer address, when the transport has one
    fn remote_address(&self) -> Option<SocketAddr>;

    /// Get a unique stable identifier for this connection, for logging
    fn connection_id(&self) -> String;
}
