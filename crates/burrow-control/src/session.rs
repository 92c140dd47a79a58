//! Tunnel session state
//!
//! A [`Session`] is the relay's view of one connected tunnel client: its
//! subdomain, the queue feeding the control channel writer, and a status that
//! only ever moves forward (Connecting → Active → Draining → Closed).

use burrow_proto::{ControlMessage, RequestFrame};
use chrono::{DateTime, Utc};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Unique identifier of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    Connecting = 0,
    Active = 1,
    Draining = 2,
    Closed = 3,
}

impl SessionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionStatus::Connecting,
            1 => SessionStatus::Active,
            2 => SessionStatus::Draining,
            _ => SessionStatus::Closed,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Connecting => "connecting",
            SessionStatus::Active => "active",
            SessionStatus::Draining => "draining",
            SessionStatus::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session is not active (status: {0})")]
    NotActive(SessionStatus),

    #[error("Control channel closed")]
    ChannelClosed,

    #[error("Outbound queue is full")]
    QueueFull,
}

/// Relay-side state of one tunnel client
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    subdomain: String,
    peer_addr: Option<SocketAddr>,
    created_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    status: AtomicU8,
    /// Frames queued for the control channel writer task
    outbound: mpsc::Sender<ControlMessage>,
}

impl Session {
    pub fn new(
        id: SessionId,
        subdomain: String,
        peer_addr: Option<SocketAddr>,
        outbound: mpsc::Sender<ControlMessage>,
    ) -> Self {
        Self {
            id,
            subdomain,
            peer_addr,
            created_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            status: AtomicU8::new(SessionStatus::Connecting as u8),
            outbound,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.status() == SessionStatus::Active
    }

    /// Record inbound traffic
    pub fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    pub fn last_activity(&self) -> Instant {
        match self.last_activity.lock() {
            Ok(last) => *last,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Connecting → Active
    pub fn activate(&self) -> bool {
        self.transition(SessionStatus::Connecting, SessionStatus::Active)
    }

    /// Active → Draining. Returns whether this call made the transition.
    pub fn begin_drain(&self) -> bool {
        self.transition(SessionStatus::Active, SessionStatus::Draining)
    }

    /// Any state → Closed. Returns `true` for exactly one caller.
    pub fn mark_closed(&self) -> bool {
        self.status.swap(SessionStatus::Closed as u8, Ordering::SeqCst)
            != SessionStatus::Closed as u8
    }

    fn transition(&self, from: SessionStatus, to: SessionStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Queue any frame for the writer task
    pub async fn send(&self, message: ControlMessage) -> Result<(), SessionError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| SessionError::ChannelClosed)
    }

    /// Queue a frame without waiting for room in the queue
    ///
    /// Used from the session's read loop, which must never park behind a
    /// peer that stopped reading.
    pub fn try_send(&self, message: ControlMessage) -> Result<(), SessionError> {
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SessionError::ChannelClosed,
        })
    }

    /// Queue a forwarded request; only an active session accepts new work
    pub async fn forward_request(&self, frame: RequestFrame) -> Result<(), SessionError> {
        let status = self.status();
        if status != SessionStatus::Active {
            return Err(SessionError::NotActive(status));
        }
        self.send(ControlMessage::Request(frame)).await
    }
}
