//! Relay side: a control channel over an upgraded axum WebSocket

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use burrow_proto::{CodecError, ControlCodec, ControlMessage};
use burrow_transport::{
    ControlTransport, FrameSink, FrameSource, TransportError, TransportResult,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tracing::{debug, trace};

/// Control channel accepted by the relay's `/tunnel` endpoint
pub struct WebSocketServerTransport {
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    connection_id: String,
}

impl std::fmt::Debug for WebSocketServerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketServerTransport")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl WebSocketServerTransport {
    pub fn new(socket: WebSocket, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            socket,
            remote_addr,
            connection_id: format!("ws-{}", uuid::Uuid::new_v4()),
        }
    }
}

impl ControlTransport for WebSocketServerTransport {
    type Sink = WebSocketServerSink;
    type Source = WebSocketServerSource;

    fn split(self) -> (Self::Sink, Self::Source) {
        let (sink, stream) = self.socket.split();
        (
            WebSocketServerSink {
                connection_id: self.connection_id.clone(),
                sink,
            },
            WebSocketServerSource {
                connection_id: self.connection_id,
                stream,
            },
        )
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}

pub struct WebSocketServerSink {
    connection_id: String,
    sink: SplitSink<WebSocket, Message>,
}

impl std::fmt::Debug for WebSocketServerSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketServerSink")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

#[async_trait]
impl FrameSink for WebSocketServerSink {
    async fn send_message(&mut self, message: &ControlMessage) -> TransportResult<()> {
        let text = ControlCodec::encode(message)?;
        trace!("[{}] -> {} ({} bytes)", self.connection_id, message.kind(), text.len());

        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }

    async fn close(&mut self) -> TransportResult<()> {
        debug!("[{}] Closing WebSocket", self.connection_id);
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }
}

pub struct WebSocketServerSource {
    connection_id: String,
    stream: SplitStream<WebSocket>,
}

impl std::fmt::Debug for WebSocketServerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketServerSource")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

#[async_trait]
impl FrameSource for WebSocketServerSource {
    async fn recv_message(&mut self) -> TransportResult<Option<ControlMessage>> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(TransportError::ConnectionError(e.to_string())),
                None => return Ok(None),
            };

            match message {
                Message::Text(text) => {
                    return Ok(Some(ControlCodec::decode(text.as_str())?));
                }
                Message::Binary(data) => {
                    let text = std::str::from_utf8(&data)
                        .map_err(|e| CodecError::MalformedFrame(e.to_string()))?;
                    return Ok(Some(ControlCodec::decode(text)?));
                }
                Message::Close(_) => {
                    debug!("[{}] WebSocket close received", self.connection_id);
                    return Ok(None);
                }
                Message::Ping(_) | Message::Pong(_) => {
                    // Pong replies are queued by the WebSocket layer itself
                    trace!("[{}] Received ping/pong", self.connection_id);
                }
            }
        }
    }
}
