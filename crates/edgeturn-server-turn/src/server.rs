//! Backend listener: handshake, registration and session lifetime

use edgeturn_control::{Session, SessionRegistry, SessionToken};
use edgeturn_mux::{MuxConfig, MuxRole, MuxSession};
use edgeturn_proto::{
    encode_line, read_line, ExecReqInfo, ExecReqType, HandshakeError, SessionInfo,
    MAX_HANDSHAKE_LINE,
};
use edgeturn_transport::{MaybeTlsStream, StreamAcceptor};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Attempts at drawing a token that is not already registered
const TOKEN_ATTEMPTS: usize = 3;

/// Backend listener errors
#[derive(Debug, Error)]
pub enum TurnServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("TLS handshake failed: {0}")]
    TlsError(std::io::Error),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Invalid session request: {0}")]
    InvalidRequest(String),

    #[error("Could not allocate an unused session token")]
    TokenExhausted,

    #[error("Registration refused: {0}")]
    Registration(#[from] edgeturn_control::RegistryError),
}

/// Backend listener configuration
#[derive(Debug, Clone)]
pub struct TurnServerConfig {
    pub bind_addr: SocketAddr,
    /// Port advertised to agents as the client access port
    pub access_port: String,
    /// Bound on TLS handshake plus request read
    pub handshake_timeout: Duration,
    /// Single-client sessions nobody attached to within this are closed
    pub shell_claim_timeout: Duration,
    /// Console sessions are closed after this long regardless of activity
    pub console_ttl: Duration,
    pub mux: MuxConfig,
}

impl Default for TurnServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 6080)),
            access_port: "443".to_string(),
            handshake_timeout: Duration::from_secs(10),
            shell_claim_timeout: Duration::from_secs(5 * 60),
            console_ttl: Duration::from_secs(20 * 60),
            mux: MuxConfig::default(),
        }
    }
}

struct BackendContext {
    acceptor: StreamAcceptor,
    registry: Arc<SessionRegistry>,
    config: TurnServerConfig,
}

/// Backend ("turn") listener
pub struct TurnServer {
    listener: TcpListener,
    ctx: Arc<BackendContext>,
}

impl TurnServer {
    /// Bind the listener; connections are accepted once [`TurnServer::run`] is called
    pub async fn bind(
        config: TurnServerConfig,
        acceptor: StreamAcceptor,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self, TurnServerError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|e| TurnServerError::BindError {
                address: config.bind_addr.ip().to_string(),
                port: config.bind_addr.port(),
                reason: e.to_string(),
            })?;

        if !acceptor.is_tls() {
            warn!(
                "Backend listener on {} is running WITHOUT TLS; agent traffic is unencrypted",
                config.bind_addr
            );
        }

        Ok(Self {
            listener,
            ctx: Arc::new(BackendContext {
                acceptor,
                registry,
                config,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TurnServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept backend connections until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), TurnServerError> {
        let local_addr = self.listener.local_addr()?;
        info!("Backend listener accepting agents on {}", local_addr);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, peer_addr)) => {
                    debug!("Accepted backend connection from {}", peer_addr);
                    let ctx = self.ctx.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_backend(socket, peer_addr, ctx, shutdown).await {
                            warn!("Backend connection from {} rejected: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept backend connection: {}", e);
                }
            }
        }

        info!("Backend listener on {} stopped", local_addr);
        Ok(())
    }
}

async fn read_request(
    socket: TcpStream,
    acceptor: &StreamAcceptor,
) -> Result<(BufReader<MaybeTlsStream>, ExecReqInfo), TurnServerError> {
    let stream = acceptor
        .accept(socket)
        .await
        .map_err(TurnServerError::TlsError)?;
    if stream.has_peer_certificate() {
        debug!("Backend presented a client certificate");
    }

    let mut reader = BufReader::new(stream);
    let request: ExecReqInfo = read_line(&mut reader, MAX_HANDSHAKE_LINE).await?;

    if request.kind == ExecReqType::Console && request.init_url.is_none() {
        return Err(TurnServerError::InvalidRequest(
            "console session requires InitURL".to_string(),
        ));
    }

    Ok((reader, request))
}

fn unused_token(registry: &SessionRegistry) -> Result<SessionToken, TurnServerError> {
    for _ in 0..TOKEN_ATTEMPTS {
        let token = SessionToken::generate();
        if !registry.contains(token.as_str()) {
            return Ok(token);
        }
        warn!("Session token collision, regenerating");
    }
    Err(TurnServerError::TokenExhausted)
}

/// Handshake, register, then hold the session until its backend goes away
async fn handle_backend(
    socket: TcpStream,
    peer_addr: SocketAddr,
    ctx: Arc<BackendContext>,
    shutdown: CancellationToken,
) -> Result<(), TurnServerError> {
    let config = &ctx.config;

    let (reader, request) = tokio::time::timeout(
        config.handshake_timeout,
        read_request(socket, &ctx.acceptor),
    )
    .await
    .map_err(|_| TurnServerError::HandshakeTimeout(config.handshake_timeout))??;

    let token = unused_token(&ctx.registry)?;
    let reply = encode_line(&SessionInfo {
        token: token.as_str().to_string(),
        access_port: config.access_port.clone(),
    })?;

    let mux_config = config.mux.clone().with_accept_streams(false);
    let (mux, driver) = MuxSession::new(reader, MuxRole::Client, mux_config);
    let session = Arc::new(Session::new(
        token,
        request.kind,
        request.init_url,
        mux,
        config.access_port.clone(),
        peer_addr,
    ));
    session.activate();

    // Registered before the agent can learn its token
    ctx.registry.put(session.clone())?;
    driver.spawn_with_preamble(reply);

    info!(
        "Session {:?} ({}) registered for agent {}",
        session.token(),
        session.kind(),
        peer_addr
    );

    let reason = hold_session(&session, config, &shutdown).await;

    ctx.registry.remove_session(&session);
    session.close(&reason);
    session.mark_closed();

    info!(
        "Session {:?} ({}) from {} ended after {:?}: {}",
        session.token(),
        session.kind(),
        peer_addr,
        session.age(),
        reason
    );
    Ok(())
}

/// Wait for whichever ends the session first; returns the reason
async fn hold_session(
    session: &Arc<Session>,
    config: &TurnServerConfig,
    shutdown: &CancellationToken,
) -> String {
    let lifetime = async {
        if session.kind().is_single_client() {
            tokio::time::sleep(config.shell_claim_timeout).await;
            if session.is_claimed() {
                std::future::pending::<()>().await;
            }
            format!(
                "no client attached within {:?}",
                config.shell_claim_timeout
            )
        } else {
            tokio::time::sleep(config.console_ttl).await;
            format!("console session expired after {:?}", config.console_ttl)
        }
    };

    tokio::select! {
        _ = session.mux().closed() => session
            .mux()
            .close_reason()
            .unwrap_or_else(|| "backend connection closed".to_string()),
        _ = shutdown.cancelled() => "relay shutting down".to_string(),
        reason = lifetime => reason,
    }
}
