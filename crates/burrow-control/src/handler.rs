//! Control channel handler
//!
//! Drives one tunnel session from handshake to teardown:
//!
//! 1. reserve a subdomain and announce it with `subdomain_assigned`
//! 2. register the session so ingress can route to it
//! 3. pump inbound frames, send heartbeats, watch for idleness
//! 4. on the way out, fail pending requests, then drop the route

use crate::pending_requests::PendingRequests;
use crate::session::{Session, SessionError, SessionId};
use burrow_proto::{
    unix_millis, ControlMessage, ResponseFrame, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_IDLE_TIMEOUT,
};
use burrow_router::TunnelRegistry;
use burrow_transport::{ControlTransport, FrameSink, FrameSource};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default time a draining session waits for in-flight responses
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default depth of a session's outbound frame queue
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Default time one frame may take to reach the transport
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-session timing and addressing
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub drain_timeout: Duration,
    pub outbound_queue: usize,
    /// A frame stuck in the transport longer than this fails the writer
    pub write_timeout: Duration,
    /// Domain under which subdomains are published (e.g. `tunnel.example.com`)
    pub base_domain: Option<String>,
    /// Scheme of the public URL sent to clients
    pub public_scheme: String,
    /// Public port, omitted from the URL when it is the scheme's default
    pub public_port: Option<u16>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            base_domain: None,
            public_scheme: "http".to_string(),
            public_port: None,
        }
    }
}

impl SessionConfig {
    /// Public URL for a subdomain, when a base domain is configured
    pub fn public_url(&self, subdomain: &str) -> Option<String> {
        let base = self.base_domain.as_ref()?;
        let default_port = match self.public_scheme.as_str() {
            "https" => 443,
            _ => 80,
        };

        Some(match self.public_port {
            Some(port) if port != default_port => {
                format!("{}://{}.{}:{}", self.public_scheme, subdomain, base, port)
            }
            _ => format!("{}://{}.{}", self.public_scheme, subdomain, base),
        })
    }
}

/// Why a control channel ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// No subdomain could be assigned
    Rejected(String),
    /// The client closed the channel
    PeerClosed,
    /// The client sent `disconnect`
    PeerDisconnect(String),
    IdleTimeout,
    Transport(String),
    /// The writer task stopped delivering frames
    WriterFailed,
    /// The relay is shutting down
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Rejected(reason) => write!(f, "rejected: {}", reason),
            CloseReason::PeerClosed => write!(f, "control channel closed by client"),
            CloseReason::PeerDisconnect(reason) => write!(f, "client disconnected: {}", reason),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::Transport(e) => write!(f, "transport error: {}", e),
            CloseReason::WriterFailed => write!(f, "control channel writer failed"),
            CloseReason::Shutdown => write!(f, "relay shutting down"),
        }
    }
}

/// Accepts control channels and runs their sessions
#[derive(Clone)]
pub struct SessionHandler {
    registry: Arc<TunnelRegistry<Arc<Session>>>,
    pending: PendingRequests,
    config: SessionConfig,
    shutdown: CancellationToken,
}

impl SessionHandler {
    pub fn new(
        registry: Arc<TunnelRegistry<Arc<Session>>>,
        pending: PendingRequests,
        config: SessionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            pending,
            config,
            shutdown,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run a control channel until it closes
    pub async fn handle_connection<T>(
        &self,
        transport: T,
        peer_addr: Option<SocketAddr>,
        requested_subdomain: Option<String>,
    ) -> CloseReason
    where
        T: ControlTransport,
    {
        let peer_addr = peer_addr.or_else(|| transport.remote_address());
        let connection_id = transport.connection_id();
        let (mut sink, source) = transport.split();

        debug!(
            "New control channel {} from {:?} (requested subdomain: {:?})",
            connection_id, peer_addr, requested_subdomain
        );

        let reservation = match requested_subdomain.as_deref() {
            Some(name) => self.registry.reserve_named(name),
            None => self.registry.reserve(),
        };

        let subdomain = match reservation {
            Ok(subdomain) => subdomain,
            Err(e) => {
                warn!("Rejecting control channel {}: {}", connection_id, e);
                let _ = sink
                    .send_message(&ControlMessage::Disconnect {
                        reason: e.to_string(),
                    })
                    .await;
                let _ = sink.close().await;
                return CloseReason::Rejected(e.to_string());
            }
        };

        let session_id = SessionId::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue.max(1));
        let session = Arc::new(Session::new(
            session_id,
            subdomain.clone(),
            peer_addr,
            outbound_tx,
        ));
        self.pending.open_session(session_id);

        if let Err(e) = self.registry.register(&subdomain, session.clone()) {
            error!("Failed to register tunnel {}: {}", subdomain, e);
            self.registry.release(&subdomain);
            self.pending.cancel_all(session_id, "handshake failed");
            session.mark_closed();
            let _ = sink.close().await;
            return CloseReason::Rejected(e.to_string());
        }
        session.activate();

        // Routable from here on. Requests arriving before the announcement is
        // out wait in the outbound queue; the writer task starts only after
        // it, so `subdomain_assigned` is always the first frame on the wire.
        let assigned = ControlMessage::SubdomainAssigned {
            subdomain: subdomain.clone(),
            public_url: self.config.public_url(&subdomain),
        };
        if let Err(e) = sink.send_message(&assigned).await {
            error!("Failed to announce subdomain {}: {}", subdomain, e);
            let reason = CloseReason::Transport(e.to_string());
            self.teardown(&session, &reason, None, CancellationToken::new())
                .await;
            return reason;
        }

        info!(
            "Tunnel session {} active on '{}' (peer: {})",
            session_id,
            subdomain,
            peer_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        );

        let writer_stop = CancellationToken::new();
        let writer = tokio::spawn(writer_loop(
            sink,
            outbound_rx,
            writer_stop.clone(),
            WriterContext {
                session_id,
                subdomain: subdomain.clone(),
                pending: self.pending.clone(),
                write_timeout: self.config.write_timeout,
            },
        ));

        let (reason, writer) = self.run_session(&session, source, writer).await;
        self.teardown(&session, &reason, writer, writer_stop).await;
        reason
    }

    async fn run_session<R>(
        &self,
        session: &Arc<Session>,
        mut source: R,
        mut writer: JoinHandle<()>,
    ) -> (CloseReason, Option<JoinHandle<()>>)
    where
        R: FrameSource,
    {
        let session_id = session.id();
        let subdomain = session.subdomain().to_string();

        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut draining: Option<(Instant, CloseReason)> = None;

        loop {
            if let Some((_, reason)) = &draining {
                if self.pending.pending_count(session_id) == 0 {
                    debug!("Session {} drained", subdomain);
                    return (reason.clone(), Some(writer));
                }
            }

            let idle_deadline = session.last_activity() + self.config.idle_timeout;
            let drain_deadline = draining
                .as_ref()
                .map(|(deadline, _)| *deadline)
                .unwrap_or_else(Instant::now);

            tokio::select! {
                result = source.recv_message() => {
                    match result {
                        Ok(Some(message)) => {
                            session.touch();
                            match message {
                                ControlMessage::Response(frame) => {
                                    let id = frame.id;
                                    if !self.pending.complete(session_id, id, frame) {
                                        warn!("Dropping response for unknown request {} on {}", id, subdomain);
                                    }
                                }
                                ControlMessage::Heartbeat { timestamp } => {
                                    debug!("Heartbeat from {}", subdomain);
                                    match session.try_send(ControlMessage::HeartbeatAck { timestamp }) {
                                        Ok(()) => {}
                                        Err(SessionError::QueueFull) => {
                                            debug!("Outbound queue for {} full, skipping heartbeat ack", subdomain);
                                        }
                                        Err(_) => return (CloseReason::WriterFailed, Some(writer)),
                                    }
                                }
                                ControlMessage::HeartbeatAck { .. } => {
                                    debug!("Heartbeat ack from {}", subdomain);
                                }
                                ControlMessage::Disconnect { reason } => {
                                    info!("Tunnel {} disconnecting: {}", subdomain, reason);
                                    if session.begin_drain() {
                                        draining = Some((
                                            Instant::now() + self.config.drain_timeout,
                                            CloseReason::PeerDisconnect(reason),
                                        ));
                                    }
                                }
                                other => {
                                    warn!("Unexpected {} frame from tunnel {}, ignoring", other.kind(), subdomain);
                                }
                            }
                        }
                        Ok(None) => {
                            info!("Control channel closed for tunnel {}", subdomain);
                            let reason = match draining {
                                Some((_, reason)) => reason,
                                None => CloseReason::PeerClosed,
                            };
                            return (reason, Some(writer));
                        }
                        Err(e) if e.is_recoverable() => {
                            warn!("Dropping malformed frame from tunnel {}: {}", subdomain, e);
                        }
                        Err(e) => {
                            error!("Error on control channel for tunnel {}: {}", subdomain, e);
                            return (CloseReason::Transport(e.to_string()), Some(writer));
                        }
                    }
                }

                _ = heartbeat.tick(), if draining.is_none() => {
                    debug!("Sending heartbeat to {}", subdomain);
                    let beat = ControlMessage::Heartbeat { timestamp: unix_millis() };
                    match session.try_send(beat) {
                        Ok(()) => {}
                        Err(SessionError::QueueFull) => {
                            debug!("Outbound queue for {} full, skipping heartbeat", subdomain);
                        }
                        Err(_) => return (CloseReason::WriterFailed, Some(writer)),
                    }
                }

                _ = tokio::time::sleep_until(idle_deadline) => {
                    warn!(
                        "Tunnel {} idle for {:?}, closing",
                        subdomain, self.config.idle_timeout
                    );
                    return (CloseReason::IdleTimeout, Some(writer));
                }

                _ = tokio::time::sleep_until(drain_deadline), if draining.is_some() => {
                    warn!(
                        "Tunnel {} still has {} pending requests after drain timeout",
                        subdomain,
                        self.pending.pending_count(session_id)
                    );
                    let reason = draining.take().map(|(_, r)| r).unwrap_or(CloseReason::Shutdown);
                    return (reason, Some(writer));
                }

                _ = self.shutdown.cancelled(), if draining.is_none() => {
                    info!("Relay shutting down, draining tunnel {}", subdomain);
                    session.begin_drain();
                    let notice = ControlMessage::Disconnect {
                        reason: CloseReason::Shutdown.to_string(),
                    };
                    if let Err(e) = session.try_send(notice) {
                        warn!("Could not queue disconnect for {}: {}", subdomain, e);
                    }
                    draining = Some((
                        Instant::now() + self.config.drain_timeout,
                        CloseReason::Shutdown,
                    ));
                }

                _ = &mut writer => {
                    error!("Control channel writer for {} stopped", subdomain);
                    return (CloseReason::WriterFailed, None);
                }
            }
        }
    }

    /// Release everything the session holds. Runs at most once per session.
    async fn teardown(
        &self,
        session: &Arc<Session>,
        reason: &CloseReason,
        writer: Option<JoinHandle<()>>,
        writer_stop: CancellationToken,
    ) {
        if !session.mark_closed() {
            return;
        }

        let session_id = session.id();
        let subdomain = session.subdomain();

        // Callers get their 502 before the route disappears
        let cancelled = self.pending.cancel_all(session_id, &reason.to_string());

        self.registry
            .unregister_if(subdomain, |s| s.id() == session_id);

        writer_stop.cancel();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(Duration::from_secs(1), &mut writer)
                .await
                .is_err()
            {
                warn!("Writer for {} did not stop in time, aborting", subdomain);
                writer.abort();
            }
        }

        info!(
            "Tunnel session {} on '{}' closed ({}), {} pending requests cancelled",
            session_id, subdomain, reason, cancelled
        );
    }
}

struct WriterContext {
    session_id: SessionId,
    subdomain: String,
    pending: PendingRequests,
    write_timeout: Duration,
}

impl WriterContext {
    /// Push one frame to the transport
    ///
    /// Returns `false` once the channel is unusable. A frame that cannot be
    /// encoded is skipped; if it was a request, its caller gets a 502.
    async fn write<S: FrameSink>(&self, sink: &mut S, message: &ControlMessage) -> bool {
        match tokio::time::timeout(self.write_timeout, sink.send_message(message)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) if e.is_recoverable() => {
                error!(
                    "Dropping unsendable {} for tunnel {}: {}",
                    message.kind(),
                    self.subdomain,
                    e
                );
                if let ControlMessage::Request(frame) = message {
                    let failed = ResponseFrame::text(frame.id, 502, "Bad Gateway");
                    self.pending.complete(self.session_id, frame.id, failed);
                }
                true
            }
            Ok(Err(e)) => {
                error!(
                    "Failed to send {} to tunnel {}: {}",
                    message.kind(),
                    self.subdomain,
                    e
                );
                false
            }
            Err(_) => {
                error!(
                    "Tunnel {} stopped reading, {} not sent within {:?}",
                    self.subdomain,
                    message.kind(),
                    self.write_timeout
                );
                false
            }
        }
    }
}

/// Drains the session's outbound queue into the transport
///
/// On stop, frames already queued (e.g. a final `disconnect`) are flushed
/// before the sink is closed.
async fn writer_loop<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<ControlMessage>,
    stop: CancellationToken,
    ctx: WriterContext,
) where
    S: FrameSink,
{
    loop {
        tokio::select! {
            biased;

            message = rx.recv() => {
                let Some(message) = message else { break };
                if !ctx.write(&mut sink, &message).await {
                    return;
                }
            }

            _ = stop.cancelled() => {
                while let Ok(message) = rx.try_recv() {
                    if !ctx.write(&mut sink, &message).await {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = sink.close().await;
    debug!("Writer task for {} ended", ctx.subdomain);
}
