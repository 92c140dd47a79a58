//! Public ingress router
//!
//! `/health` answers locally; every other method and path is forwarded to the
//! tunnel named by the request's host.

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderName, HeaderValue, Response, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use burrow_control::{Dispatcher, IncomingRequest};
use burrow_proto::{strip_hop_by_hop, ResponseFrame, HEALTH_PATH};
use serde::Serialize;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Default limit on buffered public request bodies (10MB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct IngressState {
    pub dispatcher: Dispatcher,
    pub max_body_size: usize,
}

impl IngressState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    active_sessions: usize,
    pending_requests: usize,
}

/// Build the public-facing router
pub fn ingress_router(state: IngressState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .fallback(forward)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<IngressState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        active_sessions: state.dispatcher.active_sessions(),
        pending_requests: state.dispatcher.pending_requests(),
    })
}

async fn forward(State(state): State<IngressState>, request: Request) -> Response<Body> {
    let (parts, body) = request.into_parts();

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()));

    let Some(host) = host else {
        return text_response(StatusCode::BAD_REQUEST, "Missing Host header");
    };

    let body = match to_bytes(body, state.max_body_size).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Rejecting request body for {}: {}", host, e);
            return text_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large");
        }
    };

    let mut headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    headers = strip_hop_by_hop(&headers, &[]);

    if let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        headers.push(("x-forwarded-for".to_string(), peer.ip().to_string()));
    }

    let incoming = IncomingRequest {
        method: parts.method.as_str().to_string(),
        path: parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string()),
        headers,
        body: body.to_vec(),
    };

    match state.dispatcher.forward(&host, incoming).await {
        Ok(frame) => frame_to_response(frame),
        Err(e) => {
            debug!("Dispatch to {} failed: {}", host, e);
            text_response(e.status_code(), e.public_message())
        }
    }
}

/// Translate a tunnel response frame into an HTTP response
fn frame_to_response(frame: ResponseFrame) -> Response<Body> {
    let status = StatusCode::from_u16(frame.status).unwrap_or_else(|_| {
        warn!("Tunnel returned invalid status {}", frame.status);
        StatusCode::BAD_GATEWAY
    });

    let mut response = Response::new(Body::from(frame.body));
    *response.status_mut() = status;

    // Length and framing are recomputed for this hop
    for (name, value) in strip_hop_by_hop(&frame.headers, &["content-length"]) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => warn!("Dropping invalid response header '{}'", name),
        }
    }

    response
}

fn text_response(status: StatusCode, body: impl Into<String>) -> Response<Body> {
    let mut response = Response::new(Body::from(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_proto::RequestId;

    #[test]
    fn test_frame_translation_drops_framing_headers() {
        let frame = ResponseFrame {
            id: RequestId(1),
            status: 201,
            headers: vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Content-Length".to_string(), "999".to_string()),
                ("Transfer-Encoding".to_string(), "chunked".to_string()),
                ("Set-Cookie".to_string(), "a=1".to_string()),
                ("Set-Cookie".to_string(), "b=2".to_string()),
                ("bad header".to_string(), "x".to_string()),
            ],
            body: b"{}".to_vec(),
        };

        let response = frame_to_response(frame);
        assert_eq!(response.status(), StatusCode::CREATED);

        let headers = response.headers();
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert!(headers.get("content-length").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn test_invalid_status_becomes_bad_gateway() {
        let frame = ResponseFrame::text(RequestId(1), 1000, "nope");
        assert_eq!(frame_to_response(frame).status(), StatusCode::BAD_GATEWAY);
    }
}
