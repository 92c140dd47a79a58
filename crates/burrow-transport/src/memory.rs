//! In-process control channel
//!
//! Two connected endpoints exchanging encoded text frames over tokio
//! channels. Frames go through [`ControlCodec`] exactly as they would on a
//! socket, so malformed input can be injected with [`MemorySink::send_raw`].

use crate::{ControlTransport, FrameSink, FrameSource, TransportError, TransportResult};
use async_trait::async_trait;
use burrow_proto::{ControlCodec, ControlMessage};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 256;

/// One end of an in-memory control channel
#[derive(Debug)]
pub struct MemoryTransport {
    id: String,
    remote_addr: Option<SocketAddr>,
    tx: mpsc::Sender<String>,
    rx: mpsc::Receiver<String>,
}

impl MemoryTransport {
    /// Create two connected endpoints
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);

        (
            MemoryTransport {
                id: "memory-a".to_string(),
                remote_addr: None,
                tx: a_tx,
                rx: a_rx,
            },
            MemoryTransport {
                id: "memory-b".to_string(),
                remote_addr: None,
                tx: b_tx,
                rx: b_rx,
            },
        )
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

impl ControlTransport for MemoryTransport {
    type Sink = MemorySink;
    type Source = MemorySource;

    fn split(self) -> (MemorySink, MemorySource) {
        (
            MemorySink {
                id: self.id.clone(),
                tx: Some(self.tx),
            },
            MemorySource {
                id: self.id,
                rx: self.rx,
            },
        )
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn connection_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Debug)]
pub struct MemorySink {
    id: String,
    tx: Option<mpsc::Sender<String>>,
}

impl MemorySink {
    /// Push a raw text frame, bypassing the encoder
    pub async fn send_raw(&mut self, text: impl Into<String>) -> TransportResult<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::StreamClosed)?;
        tx.send(text.into())
            .await
            .map_err(|_| TransportError::StreamClosed)
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_message(&mut self, message: &ControlMessage) -> TransportResult<()> {
        let text = ControlCodec::encode(message)?;
        trace!("[{}] -> {}", self.id, message.kind());
        self.send_raw(text).await
    }

    async fn close(&mut self) -> TransportResult<()> {
        // Dropping the sender ends the peer's stream
        self.tx.take();
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemorySource {
    id: String,
    rx: mpsc::Receiver<String>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv_message(&mut self) -> TransportResult<Option<ControlMessage>> {
        match self.rx.recv().await {
            Some(text) => {
                let message = ControlCodec::decode(&text)?;
                trace!("[{}] <- {}", self.id, message.kind());
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }
}
