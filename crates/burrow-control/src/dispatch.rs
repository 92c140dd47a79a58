//! Forwarding of public requests into tunnel sessions

use crate::pending_requests::{PendingRequests, RequestOutcome};
use crate::session::Session;
use burrow_proto::{RequestFrame, ResponseFrame, DEFAULT_REQUEST_TIMEOUT};
use burrow_router::{extract_subdomain, normalize_host, TunnelRegistry};
use http::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// A public HTTP request, already read off the wire
#[derive(Debug, Clone, Default)]
pub struct IncomingRequest {
    pub method: String,
    /// Path and query, e.g. `/search?q=x`
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Tunnel {0} not found")]
    UnknownSubdomain(String),

    #[error("Tunnel {0} did not answer in time")]
    Timeout(String),

    #[error("Tunnel channel closed: {0}")]
    ChannelClosed(String),

    #[error("Tunnel {0} is not accepting requests")]
    SessionUnavailable(String),
}

impl DispatchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::UnknownSubdomain(_) => StatusCode::NOT_FOUND,
            DispatchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::ChannelClosed(_) | DispatchError::SessionUnavailable(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }

    /// Plain-text body shown to the public caller
    pub fn public_message(&self) -> String {
        match self {
            DispatchError::UnknownSubdomain(_) => self.to_string(),
            DispatchError::Timeout(_) => "Gateway Timeout".to_string(),
            DispatchError::ChannelClosed(_) | DispatchError::SessionUnavailable(_) => {
                "Bad Gateway".to_string()
            }
        }
    }
}

/// Resolves a host to its session and waits for the tunnelled response
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<TunnelRegistry<Arc<Session>>>,
    pending: PendingRequests,
    base_domain: Option<String>,
    request_timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<TunnelRegistry<Arc<Session>>>, pending: PendingRequests) -> Self {
        Self {
            registry,
            pending,
            base_domain: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_base_domain(mut self, base_domain: Option<String>) -> Self {
        self.base_domain = base_domain;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry<Arc<Session>>> {
        &self.registry
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn active_sessions(&self) -> usize {
        self.registry.active_count()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.total_pending()
    }

    /// Forward a request to the tunnel named by `host` and wait for its answer
    pub async fn forward(
        &self,
        host: &str,
        request: IncomingRequest,
    ) -> Result<ResponseFrame, DispatchError> {
        let Some(subdomain) = extract_subdomain(host, self.base_domain.as_deref()) else {
            let label = normalize_host(host)
                .split('.')
                .next()
                .unwrap_or_default()
                .to_string();
            debug!("No tunnel subdomain in host '{}'", host);
            return Err(DispatchError::UnknownSubdomain(label));
        };

        let session = self
            .registry
            .lookup(&subdomain)
            .ok_or_else(|| DispatchError::UnknownSubdomain(subdomain.clone()))?;

        if !session.is_active() {
            return Err(DispatchError::SessionUnavailable(subdomain));
        }

        let (id, pending) = self
            .pending
            .create_pending(session.id(), &subdomain, Some(self.request_timeout))
            .map_err(|_| DispatchError::SessionUnavailable(subdomain.clone()))?;

        debug!(
            "Forwarding {} {} to {} as request {}",
            request.method, request.path, subdomain, id
        );

        let frame = RequestFrame {
            id,
            method: request.method,
            path: request.path,
            headers: request.headers,
            body: request.body,
        };

        // A full outbound queue must not hold the caller past its deadline
        match tokio::time::timeout_at(pending.deadline(), session.forward_request(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                // Dropping `pending` releases the entry
                warn!("Failed to forward request {} to {}: {}", id, subdomain, e);
                return Err(DispatchError::ChannelClosed(e.to_string()));
            }
            Err(_) => {
                warn!("Outbound queue for {} stayed full, giving up", subdomain);
                return Err(DispatchError::Timeout(subdomain));
            }
        }

        match pending.outcome().await {
            RequestOutcome::Response(response) => Ok(response),
            RequestOutcome::TimedOut => Err(DispatchError::Timeout(subdomain)),
            RequestOutcome::Cancelled(reason) => Err(DispatchError::ChannelClosed(reason)),
        }
    }
}
