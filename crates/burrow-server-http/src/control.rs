//! Control channel endpoint: `GET /tunnel` upgraded to a WebSocket

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::Extensions,
    response::IntoResponse,
    routing::get,
    Router,
};
use burrow_control::SessionHandler;
use burrow_proto::{CONTROL_PATH, MAX_FRAME_SIZE};
use burrow_transport_websocket::WebSocketServerTransport;
use serde::Deserialize;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::debug;

#[derive(Debug, Deserialize)]
pub struct ControlParams {
    /// Subdomain the client would like to be published under
    pub subdomain: Option<String>,
}

/// Build the router serving the control endpoint
pub fn control_router(handler: SessionHandler) -> Router {
    Router::new()
        .route(CONTROL_PATH, get(upgrade))
        .with_state(handler)
        .layer(TraceLayer::new_for_http())
}

async fn upgrade(
    State(handler): State<SessionHandler>,
    Query(params): Query<ControlParams>,
    extensions: Extensions,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let peer_addr = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    debug!("Control channel upgrade from {:?}", peer_addr);

    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| async move {
            let transport = WebSocketServerTransport::new(socket, peer_addr);
            handler
                .handle_connection(transport, peer_addr, params.subdomain)
                .await;
        })
}
