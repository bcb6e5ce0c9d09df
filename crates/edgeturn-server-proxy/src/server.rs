//! Frontend listener: TLS, HTTP/1.1 serving and routing

use axum::extract::ConnectInfo;
use axum::routing::get;
use axum::Router;
use edgeturn_control::SessionRegistry;
use edgeturn_proto::{CONSOLE_PATH, SHELL_PATH};
use edgeturn_transport::{PumpConfig, StreamAcceptor};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::Request;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::{console, handlers};

/// Frontend listener errors
#[derive(Debug, Error)]
pub enum ProxyServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// Frontend listener configuration
#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    pub bind_addr: SocketAddr,
    /// Concurrent client links across all sessions
    pub max_links: usize,
    pub pump: PumpConfig,
    /// Bound on the TLS handshake of a client connection
    pub handshake_timeout: Duration,
    /// Lifetime of the `edgetoken` cookie set by the console entry point
    pub cookie_max_age: Duration,
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8443)),
            max_links: 1024,
            pump: PumpConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            cookie_max_age: Duration::from_secs(10 * 60),
        }
    }
}

/// State shared by every request handler
#[derive(Clone)]
pub struct ProxyState {
    pub registry: Arc<SessionRegistry>,
    /// One permit per live client link
    pub links: Arc<Semaphore>,
    pub pump: PumpConfig,
    pub cookie_max_age: Duration,
}

impl ProxyState {
    pub fn new(registry: Arc<SessionRegistry>, config: &ProxyServerConfig) -> Self {
        Self {
            registry,
            links: Arc::new(Semaphore::new(config.max_links)),
            pump: config.pump.clone(),
            cookie_max_age: config.cookie_max_age,
        }
    }
}

/// Routes of the frontend listener
pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route(SHELL_PATH, get(handlers::shell))
        .route(CONSOLE_PATH, get(console::console_start))
        .fallback(console::console_proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Frontend ("proxy") listener
pub struct ProxyServer {
    listener: TcpListener,
    acceptor: StreamAcceptor,
    router: Router,
    handshake_timeout: Duration,
}

impl ProxyServer {
    /// Bind the listener; connections are served once [`ProxyServer::run`] is called
    pub async fn bind(
        config: ProxyServerConfig,
        acceptor: StreamAcceptor,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self, ProxyServerError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| ProxyServerError::BindError {
                address: config.bind_addr.ip().to_string(),
                port: config.bind_addr.port(),
                reason: e.to_string(),
            })?;

        if !acceptor.is_tls() {
            warn!(
                "Client listener on {} is running WITHOUT TLS; session tokens travel in cleartext",
                config.bind_addr
            );
        }

        let router = build_router(ProxyState::new(registry, &config));

        Ok(Self {
            listener,
            acceptor,
            router,
            handshake_timeout: config.handshake_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve client connections until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ProxyServerError> {
        let local_addr = self.listener.local_addr()?;
        info!("Client listener accepting connections on {}", local_addr);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer_addr)) => {
                    debug!("Accepted client connection from {}", peer_addr);
                    tokio::spawn(serve_connection(
                        socket,
                        peer_addr,
                        self.acceptor.clone(),
                        self.router.clone(),
                        self.handshake_timeout,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    error!("Failed to accept client connection: {}", e);
                }
            }
        }

        info!("Client listener on {} stopped", local_addr);
        Ok(())
    }
}

async fn serve_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    acceptor: StreamAcceptor,
    router: Router,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
) {
    let stream = match tokio::time::timeout(handshake_timeout, acceptor.accept(socket)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!("TLS handshake with {} failed: {}", peer_addr, e);
            return;
        }
        Err(_) => {
            debug!("TLS handshake with {} timed out", peer_addr);
            return;
        }
    };

    let service = router.map_request(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(ConnectInfo(peer_addr));
        req
    });

    let conn = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), TowerToHyperService::new(service))
        .with_upgrades();
    tokio::pin!(conn);

    let result = tokio::select! {
        res = conn.as_mut() => res,
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        debug!("Client connection from {} ended with error: {}", peer_addr, e);
    }
}
