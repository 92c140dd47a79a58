//! Client side: a control channel dialled with tokio-tungstenite

use async_trait::async_trait;
use burrow_proto::{CodecError, ControlCodec, ControlMessage};
use burrow_transport::{
    ControlTransport, FrameSink, FrameSource, TransportError, TransportResult,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Control channel opened by a tunnel client
pub struct WebSocketClientTransport {
    ws: WsStream,
    remote_addr: Option<SocketAddr>,
    connection_id: String,
}

impl std::fmt::Debug for WebSocketClientTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketClientTransport")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl WebSocketClientTransport {
    /// Dial a `ws://` or `wss://` control URL
    pub async fn connect(url: &str) -> TransportResult<Self> {
        debug!("Connecting to {}", url);

        let (ws, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("{}: {}", url, e)))?;

        let remote_addr = match ws.get_ref() {
            MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
            _ => None,
        };

        info!(
            "Control channel established to {} (HTTP {})",
            url,
            response.status()
        );

        Ok(Self {
            ws,
            remote_addr,
            connection_id: format!("ws-{}", uuid::Uuid::new_v4()),
        })
    }
}

impl ControlTransport for WebSocketClientTransport {
    type Sink = WebSocketClientSink;
    type Source = WebSocketClientSource;

    fn split(self) -> (Self::Sink, Self::Source) {
        let (sink, stream) = self.ws.split();
        (
            WebSocketClientSink {
                connection_id: self.connection_id.clone(),
                sink,
            },
            WebSocketClientSource {
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

pub struct WebSocketClientSink {
    connection_id: String,
    sink: SplitSink<WsStream, Message>,
}

impl std::fmt::Debug for WebSocketClientSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketClientSink")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

#[async_trait]
impl FrameSink for WebSocketClientSink {
    async fn send_message(&mut self, message: &ControlMessage) -> TransportResult<()> {
        let text = ControlCodec::encode(message)?;
        trace!("[{}] -> {} ({} bytes)", self.connection_id, message.kind(), text.len());

        self.sink
            .send(Message::Text(text))
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

pub struct WebSocketClientSource {
    connection_id: String,
    stream: SplitStream<WsStream>,
}

impl std::fmt::Debug for WebSocketClientSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketClientSource")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

#[async_trait]
impl FrameSource for WebSocketClientSource {
    async fn recv_message(&mut self) -> TransportResult<Option<ControlMessage>> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(TransportError::ConnectionError(e.to_string())),
                None => return Ok(None),
            };

            match message {
                Message::Text(text) => {
                    return Ok(Some(ControlCodec::decode(&text)?));
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
                _ => {
                    // Ping/pong and raw frames; pongs are answered by tungstenite
                    trace!("[{}] Ignoring control frame", self.connection_id);
                }
            }
        }
    }
}
