//! HTTP listener, plain or TLS-terminated
use axum::{extract::ConnectInfo, Extension, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum HttpServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// A bound listener serving one router
pub struct HttpServer {
    name: &'static str,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    router: Router,
}

impl HttpServer {
    /// Bind `addr`; the router is served over TLS when a config is given
    pub async fn bind(
        name: &'static str,
        addr: SocketAddr,
        router: Router,
        tls: Option<Arc<ServerConfig>>,
    ) -> Result<Self, HttpServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HttpServerError::BindError {
                address: addr.ip().to_string(),
                port: addr.port(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            name,
            listener,
            tls: tls.map(TlsAcceptor::from),
            router,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HttpServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Serve until `shutdown` is cancelled
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), HttpServerError> {
        let addr = self.local_addr()?;
        let scheme = if self.is_tls() { "https" } else { "http" };
        info!("{} listening on {}://{}", self.name, scheme, addr);

        match self.tls {
            None => {
                axum::serve(
                    self.listener,
                    self.router
                        .into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await?;
            }
            Some(acceptor) => {
                serve_tls(self.name, self.listener, acceptor, self.router, shutdown).await;
            }
        }

        info!("{} on {} stopped", self.name, addr);
        Ok(())
    }
}

async fn serve_tls(
    name: &'static str,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("{}: failed to accept connection: {}", name, e);
                    continue;
                }
            },
        };

        let acceptor = acceptor.clone();
        let service = router.clone().layer(Extension(ConnectInfo(peer_addr)));
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("TLS handshake failed from {}: {}", peer_addr, e);
                    return;
                }
            };

            let builder = Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection_with_upgrades(
                TokioIo::new(tls_stream),
                TowerToHyperService::new(service),
            );
            tokio::pin!(conn);

            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        debug!("Connection error from {}: {}", peer_addr, e);
                    }
                }
                _ = shutdown.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    let _ = conn.await;
                }
            }
        });
    }
}
