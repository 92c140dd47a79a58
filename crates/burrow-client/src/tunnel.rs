//! Control channel handling on the client side

use crate::config::RelayClientConfig;
use crate::upstream::UpstreamClient;
use crate::RelayClientError;
use burrow_proto::{ControlMessage, ResponseFrame};
use burrow_transport::{ControlTransport, FrameSink, FrameSource, TransportError};
use burrow_transport_websocket::WebSocketClientTransport;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const OUTBOUND_QUEUE: usize = 256;
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);
/// How long in-flight requests may keep running after a graceful disconnect
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What the relay told us when the channel came up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub subdomain: String,
    pub public_url: Option<String>,
}

/// How a served channel ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEnd {
    /// The relay closed the connection without saying why
    ServerClosed,
    /// The relay sent `disconnect`
    ServerDisconnect(String),
    /// Local shutdown was requested
    Shutdown,
}

impl fmt::Display for ChannelEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelEnd::ServerClosed => write!(f, "connection closed by relay"),
            ChannelEnd::ServerDisconnect(reason) => write!(f, "relay disconnected: {}", reason),
            ChannelEnd::Shutdown => write!(f, "shutdown requested"),
        }
    }
}

/// Serve one established control channel until it ends
///
/// Waits for `subdomain_assigned` first; a `disconnect` in its place means
/// the relay refused us. Afterwards every `request` is executed against the
/// upstream on its own task and answered with a `response` carrying the same
/// id. Heartbeats are acknowledged.
pub async fn serve_channel<T: ControlTransport>(
    transport: T,
    upstream: Arc<UpstreamClient>,
    assignment: &watch::Sender<Option<Assignment>>,
    shutdown: CancellationToken,
) -> Result<ChannelEnd, RelayClientError> {
    let connection_id = transport.connection_id();
    let (mut sink, mut source) = transport.split();

    let assigned = tokio::select! {
        assigned = await_assignment(&mut source) => assigned,
        _ = shutdown.cancelled() => {
            let _ = sink.close().await;
            return Ok(ChannelEnd::Shutdown);
        }
    };
    let assigned = match assigned {
        Ok(assigned) => assigned,
        Err(e) => {
            let _ = sink.close().await;
            return Err(e);
        }
    };

    match &assigned.public_url {
        Some(url) => info!("🌐 Tunnel established: {} -> {}", url, upstream.base_url()),
        None => info!(
            "🌐 Tunnel established: subdomain '{}' -> {}",
            assigned.subdomain,
            upstream.base_url()
        ),
    }
    debug!("Control channel {} assigned '{}'", connection_id, assigned.subdomain);
    assignment.send_replace(Some(assigned));

    let (tx, rx) = mpsc::channel::<ControlMessage>(OUTBOUND_QUEUE);
    let mut writer = tokio::spawn(writer_loop(sink, rx));
    let mut requests = JoinSet::new();

    let result = loop {
        // Reap finished request tasks so the set stays small
        while requests.try_join_next().is_some() {}

        let message = tokio::select! {
            message = source.recv_message() => message,
            _ = shutdown.cancelled() => {
                let _ = tx
                    .send(ControlMessage::Disconnect {
                        reason: "client shutting down".to_string(),
                    })
                    .await;
                break Ok(ChannelEnd::Shutdown);
            }
        };

        match message {
            Ok(Some(ControlMessage::Request(frame))) => {
                debug!("Request {}: {} {}", frame.id, frame.method, frame.path);
                let upstream = upstream.clone();
                let tx = tx.clone();
                requests.spawn(async move {
                    let response = upstream.execute(frame).await;
                    if tx.send(ControlMessage::Response(response)).await.is_err() {
                        debug!("Control channel gone before response could be sent");
                    }
                });
            }
            Ok(Some(ControlMessage::Heartbeat { timestamp })) => {
                if tx.send(ControlMessage::HeartbeatAck { timestamp }).await.is_err() {
                    break Err(TransportError::StreamClosed.into());
                }
            }
            Ok(Some(ControlMessage::HeartbeatAck { .. })) => {
                debug!("Heartbeat acknowledged");
            }
            Ok(Some(ControlMessage::Disconnect { reason })) => {
                info!("Relay disconnected: {}", reason);
                break Ok(ChannelEnd::ServerDisconnect(reason));
            }
            Ok(Some(other)) => {
                warn!("Ignoring unexpected {} frame from relay", other.kind());
            }
            Ok(None) => break Ok(ChannelEnd::ServerClosed),
            Err(e) if e.is_recoverable() => {
                warn!("Dropping malformed frame from relay: {}", e);
            }
            Err(e) => {
                error!("Control channel error: {}", e);
                break Err(e.into());
            }
        }
    };

    assignment.send_replace(None);

    // Both sides drain on a graceful disconnect, so in-flight answers still
    // have somewhere to go
    if matches!(
        result,
        Ok(ChannelEnd::Shutdown) | Ok(ChannelEnd::ServerDisconnect(_))
    ) && !requests.is_empty()
    {
        debug!("Waiting for {} in-flight requests", requests.len());
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while requests.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Abandoning {} in-flight requests", requests.len());
        }
    }
    requests.abort_all();
    drop(tx);

    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    result
}

async fn await_assignment<S: FrameSource>(source: &mut S) -> Result<Assignment, RelayClientError> {
    loop {
        match source.recv_message().await {
            Ok(Some(ControlMessage::SubdomainAssigned {
                subdomain,
                public_url,
            })) => {
                return Ok(Assignment {
                    subdomain,
                    public_url,
                })
            }
            Ok(Some(ControlMessage::Disconnect { reason })) => {
                return Err(RelayClientError::Rejected(reason));
            }
            Ok(Some(ControlMessage::Heartbeat { .. })) => {
                debug!("Heartbeat before assignment");
            }
            Ok(Some(other)) => {
                return Err(RelayClientError::Protocol(format!(
                    "expected subdomain_assigned, got {}",
                    other.kind()
                )));
            }
            Ok(None) => return Err(RelayClientError::ConnectionClosed),
            Err(e) if e.is_recoverable() => {
                warn!("Dropping malformed frame from relay: {}", e);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn writer_loop<S: FrameSink>(mut sink: S, mut rx: mpsc::Receiver<ControlMessage>) {
    while let Some(message) = rx.recv().await {
        match sink.send_message(&message).await {
            Ok(()) => {}
            Err(e) if e.is_recoverable() => {
                error!("Dropping unsendable {} frame: {}", message.kind(), e);
                if let ControlMessage::Response(frame) = &message {
                    let failed = ResponseFrame::text(frame.id, 500, format!("Error: {}", e));
                    if let Err(e) = sink.send_message(&ControlMessage::Response(failed)).await {
                        if !e.is_recoverable() {
                            error!("Failed to send response frame: {}", e);
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                error!("Failed to send {} frame: {}", message.kind(), e);
                break;
            }
        }
    }
    let _ = sink.close().await;
}

/// Long-running tunnel client: connects, serves and reconnects
pub struct TunnelClient {
    config: RelayClientConfig,
    upstream: Arc<UpstreamClient>,
    assignment: watch::Sender<Option<Assignment>>,
}

impl TunnelClient {
    pub fn new(config: RelayClientConfig) -> Self {
        let upstream = Arc::new(UpstreamClient::new(
            config.local_url.clone(),
            config.upstream_timeout,
        ));
        let (assignment, _) = watch::channel(None);
        Self {
            config,
            upstream,
            assignment,
        }
    }

    pub fn config(&self) -> &RelayClientConfig {
        &self.config
    }

    /// Watch the current assignment; `None` while disconnected
    pub fn subscribe(&self) -> watch::Receiver<Option<Assignment>> {
        self.assignment.subscribe()
    }

    /// Connect once and serve the channel until it ends
    pub async fn run_once(&self, shutdown: CancellationToken) -> Result<ChannelEnd, RelayClientError> {
        let url = self.config.control_url();
        info!("Connecting to relay at {}", url);

        let transport = tokio::select! {
            connected = WebSocketClientTransport::connect(&url) => connected?,
            _ = shutdown.cancelled() => return Ok(ChannelEnd::Shutdown),
        };

        serve_channel(transport, self.upstream.clone(), &self.assignment, shutdown).await
    }

    /// Keep a tunnel up until `shutdown` is cancelled, waiting
    /// `reconnect_delay` after every lost or failed connection
    pub async fn run_forever(&self, shutdown: CancellationToken) {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.run_once(shutdown.clone()).await {
                Ok(ChannelEnd::Shutdown) => {
                    info!("Tunnel stopped");
                    return;
                }
                Ok(end) => {
                    attempt = 0;
                    warn!("Tunnel lost: {}", end);
                }
                Err(e) => {
                    error!("Tunnel attempt {} failed: {}", attempt, e);
                }
            }

            info!(
                "Reconnecting in {} seconds...",
                self.config.reconnect_delay.as_secs_f32()
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown.cancelled() => {
                    info!("Tunnel stopped");
                    return;
                }
            }
        }
    }
}
